//! Call-related error types.

use thiserror::Error;

/// Failure reported by the signaling transport for a submitted request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rpc error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("transport disconnected")]
    Disconnected,

    #[error("request timed out")]
    Timeout,
}

/// Reasons a call negotiation fails.
///
/// These never reach the caller of a [`Call`](super::Call) operation. They are
/// logged and turned into the `Failed` transition.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("could not compute mod-exp {0}")]
    ModExp(&'static str),

    #[error("peer DH value is out of range")]
    BadDhValue,

    #[error("wrong g_a_hash size {got}, expected {expected}")]
    WrongGaHashSize { got: usize, expected: usize },

    #[error("wrong g_a hash received")]
    WrongGaHash,

    #[error("wrong call access_hash")]
    WrongAccessHash,

    #[error("wrong call admin_id {got}, expected {expected}")]
    WrongAdminId { got: i64, expected: i64 },

    #[error("wrong call participant_id {got}, expected {expected}")]
    WrongParticipantId { got: i64, expected: i64 },

    #[error("wrong call fingerprint")]
    WrongFingerprint,

    #[error("expected {expected} in response to {request}")]
    UnexpectedResponse {
        request: &'static str,
        expected: &'static str,
    },

    #[error("unexpected call-accepted for an incoming call")]
    AcceptedForIncoming,

    #[error("call-empty received")]
    EmptyCall,

    #[error("media engine reported failure")]
    MediaFailed,

    #[error("request failed: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_converts_into_call_error() {
        let err: CallError = TransportError::Rpc {
            code: 400,
            message: "CALL_PEER_INVALID".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "request failed: rpc error 400: CALL_PEER_INVALID"
        );
    }

    #[test]
    fn test_mismatch_messages_carry_both_ids() {
        let err = CallError::WrongParticipantId {
            got: 11,
            expected: 12,
        };
        assert_eq!(err.to_string(), "wrong call participant_id 11, expected 12");
    }
}
