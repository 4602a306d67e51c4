//! Call phases, roles and discard reasons.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the call we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// We placed the call (the DH "admin").
    Outgoing,
    /// We are being called.
    Incoming,
}

/// Current phase of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Incoming call created but not started yet.
    Starting,
    /// Outgoing: create-call request in flight.
    Requesting,
    /// Outgoing: server queued the call, callee not answered.
    Waiting,
    /// Incoming: ringing locally.
    Ringing,
    ExchangingKeys,
    Established,
    /// Media engine is waiting for the peer's init packet.
    WaitingInit,
    /// Media engine is waiting for the init acknowledgment.
    WaitingInitAck,
    HangingUp,
    /// Peer is busy. Moves to `Ended` after the hangup timeout.
    Busy,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Phases in which media connectivity is being set up or running.
    /// Entering one of these starts the call duration clock.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::WaitingInit | Self::WaitingInitAck | Self::Established
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reason sent with a discard-call request or received in call-discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscardReason {
    Missed,
    Disconnect,
    Hangup,
    Busy,
}

/// Pick the reason for a local hangup.
///
/// A hangup is a miss when the receiver never answered, or when the
/// originator gave up before the callee responded.
pub fn hangup_reason(state: CallState, call_type: CallType) -> DiscardReason {
    let missed = state == CallState::Ringing
        || (state == CallState::Waiting && call_type == CallType::Outgoing);
    if missed {
        DiscardReason::Missed
    } else {
        DiscardReason::Hangup
    }
}
