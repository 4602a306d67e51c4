//! Interpretation of inbound call updates.
//!
//! [`interpret`] checks a [`PhoneCall`] against a snapshot of the call it is
//! offered to and says what the state machine should do with it. It never
//! mutates anything, so every validation rule is testable in isolation.

use super::error::CallError;
use super::key_exchange::G_A_HASH_SIZE;
use super::signaling::{
    CallProtocol, PhoneCall, PhoneCallAccepted, PhoneCallData, PhoneCallRequested, UserId,
};
use super::state::{CallState, CallType, DiscardReason};

/// What the interpreter needs to know about a call.
#[derive(Debug, Clone, Copy)]
pub struct CallView {
    pub call_type: CallType,
    pub state: CallState,
    /// Zero until the server assigns an id.
    pub id: i64,
    pub access_hash: i64,
    pub self_id: UserId,
    pub peer_id: UserId,
}

impl CallView {
    fn expected_admin_id(&self) -> UserId {
        match self.call_type {
            CallType::Outgoing => self.self_id,
            CallType::Incoming => self.peer_id,
        }
    }

    fn expected_participant_id(&self) -> UserId {
        match self.call_type {
            CallType::Outgoing => self.peer_id,
            CallType::Incoming => self.self_id,
        }
    }

    fn owns(&self, id: i64) -> bool {
        self.id != 0 && self.id == id
    }
}

/// Verdict on an update.
#[derive(Debug)]
pub enum Interpretation<'a> {
    /// The id does not match. The caller should offer the update to other calls.
    NotThisCall,
    /// Ours, nothing to do.
    Acknowledged,
    /// A new incoming call: the identifiers and the `g_a` commitment.
    Requested {
        id: i64,
        access_hash: i64,
        protocol: CallProtocol,
        g_a_hash: [u8; G_A_HASH_SIZE],
    },
    /// The originator revealed `g_a`; the receiver can finish the exchange.
    ConfirmIncoming(&'a PhoneCallData),
    /// The receiver answered with `g_b`; common fields are already verified.
    Accepted(&'a PhoneCallAccepted),
    Discarded { busy: bool, need_debug: bool },
    /// Ours, and the call must fail.
    Failed(CallError),
}

/// Classify and validate `update` for the call described by `view`.
///
/// # Panics
///
/// Panics on a call-requested update offered to anything but a fresh,
/// unidentified incoming call from the same peer. The dispatch layer only
/// creates calls for such updates, so this is a local bug.
pub fn interpret<'a>(view: &CallView, update: &'a PhoneCall) -> Interpretation<'a> {
    match update {
        PhoneCall::Requested(data) => interpret_requested(view, data),
        PhoneCall::Empty { id } => {
            if !view.owns(*id) {
                return Interpretation::NotThisCall;
            }
            Interpretation::Failed(CallError::EmptyCall)
        }
        PhoneCall::Waiting(data) => {
            if !view.owns(data.id) {
                return Interpretation::NotThisCall;
            }
            Interpretation::Acknowledged
        }
        PhoneCall::InProgress(data) => {
            if !view.owns(data.id) {
                return Interpretation::NotThisCall;
            }
            if view.call_type == CallType::Incoming && view.state == CallState::ExchangingKeys {
                Interpretation::ConfirmIncoming(data)
            } else {
                Interpretation::Acknowledged
            }
        }
        PhoneCall::Discarded(data) => {
            if !view.owns(data.id) {
                return Interpretation::NotThisCall;
            }
            Interpretation::Discarded {
                busy: data.reason == Some(DiscardReason::Busy),
                need_debug: data.need_debug,
            }
        }
        PhoneCall::Accepted(data) => {
            if !view.owns(data.id) {
                return Interpretation::NotThisCall;
            }
            if view.call_type != CallType::Outgoing {
                return Interpretation::Failed(CallError::AcceptedForIncoming);
            }
            match check_common_fields(view, data.access_hash, data.admin_id, data.participant_id)
            {
                Ok(()) => Interpretation::Accepted(data),
                Err(err) => Interpretation::Failed(err),
            }
        }
    }
}

fn interpret_requested<'a>(view: &CallView, data: &PhoneCallRequested) -> Interpretation<'a> {
    if view.call_type != CallType::Incoming || view.id != 0 || data.admin_id != view.peer_id {
        panic!(
            "call-requested {} offered to an existing call {} ({:?})",
            data.id, view.id, view.call_type
        );
    }
    if data.participant_id != view.self_id {
        return Interpretation::Failed(CallError::WrongParticipantId {
            got: data.participant_id,
            expected: view.self_id,
        });
    }
    let Ok(g_a_hash) = <[u8; G_A_HASH_SIZE]>::try_from(data.g_a_hash.as_slice()) else {
        return Interpretation::Failed(CallError::WrongGaHashSize {
            got: data.g_a_hash.len(),
            expected: G_A_HASH_SIZE,
        });
    };
    Interpretation::Requested {
        id: data.id,
        access_hash: data.access_hash,
        protocol: data.protocol,
        g_a_hash,
    }
}

/// Access hash plus admin/participant ids, which depend on our role.
pub fn check_common_fields(
    view: &CallView,
    access_hash: i64,
    admin_id: UserId,
    participant_id: UserId,
) -> Result<(), CallError> {
    if access_hash != view.access_hash {
        return Err(CallError::WrongAccessHash);
    }
    let expected = view.expected_admin_id();
    if admin_id != expected {
        return Err(CallError::WrongAdminId {
            got: admin_id,
            expected,
        });
    }
    let expected = view.expected_participant_id();
    if participant_id != expected {
        return Err(CallError::WrongParticipantId {
            got: participant_id,
            expected,
        });
    }
    Ok(())
}

/// Common fields plus the key fingerprint the server echoes.
pub fn check_call_fields(
    view: &CallView,
    data: &PhoneCallData,
    key_fingerprint: u64,
) -> Result<(), CallError> {
    check_common_fields(view, data.access_hash, data.admin_id, data.participant_id)?;
    if data.key_fingerprint != key_fingerprint {
        return Err(CallError::WrongFingerprint);
    }
    Ok(())
}
