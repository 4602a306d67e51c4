//! Signaling payloads exchanged with the relay server.
//!
//! [`PhoneCall`] is the closed set of call descriptions the server pushes (or
//! returns from a request). [`SignalingRequest`] and [`SignalingResponse`] are
//! what the call sends through the [`SignalingTransport`](super::SignalingTransport).
//! Wire encoding is the transport's business; these types only derive serde.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::DiscardReason;

/// Numeric user id as assigned by the server.
pub type UserId = i64;

/// Protocol capabilities advertised in create/accept/confirm requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallProtocol {
    pub udp_p2p: bool,
    pub udp_reflector: bool,
    pub min_layer: i32,
    pub max_layer: i32,
}

/// A relay or direct endpoint the media engine may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneConnection {
    pub id: i64,
    pub ip: String,
    pub ipv6: String,
    pub port: i32,
    pub peer_tag: Vec<u8>,
}

/// Reference to a call on the server: id plus the capability token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPhoneCall {
    pub id: i64,
    pub access_hash: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCallWaiting {
    pub id: i64,
    pub access_hash: i64,
    pub date: i32,
    pub admin_id: UserId,
    pub participant_id: UserId,
    pub protocol: CallProtocol,
    pub receive_date: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCallRequested {
    pub id: i64,
    pub access_hash: i64,
    pub date: i32,
    pub admin_id: UserId,
    pub participant_id: UserId,
    pub g_a_hash: Vec<u8>,
    pub protocol: CallProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCallAccepted {
    pub id: i64,
    pub access_hash: i64,
    pub date: i32,
    pub admin_id: UserId,
    pub participant_id: UserId,
    pub g_b: Vec<u8>,
    pub protocol: CallProtocol,
}

/// Final call data once both sides have exchanged their DH values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCallData {
    pub id: i64,
    pub access_hash: i64,
    pub date: i32,
    pub admin_id: UserId,
    pub participant_id: UserId,
    /// `g_a` for the receiver, `g_b` echoed back for the originator.
    pub g_a_or_b: Vec<u8>,
    pub key_fingerprint: u64,
    pub protocol: CallProtocol,
    pub connection: PhoneConnection,
    pub alternative_connections: Vec<PhoneConnection>,
    pub start_date: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCallDiscarded {
    pub id: i64,
    pub reason: Option<DiscardReason>,
    pub duration: Option<i32>,
    pub need_rating: bool,
    pub need_debug: bool,
}

/// Inbound call description, pushed by the server or returned from a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhoneCall {
    /// The call does not exist (any more) on the server.
    Empty { id: i64 },
    /// The server has queued the call.
    Waiting(PhoneCallWaiting),
    /// Someone is calling us.
    Requested(PhoneCallRequested),
    /// The receiver answered with `g_b`.
    Accepted(PhoneCallAccepted),
    /// Both sides' key material is known to the server.
    InProgress(PhoneCallData),
    Discarded(PhoneCallDiscarded),
}

impl PhoneCall {
    pub fn id(&self) -> i64 {
        match self {
            Self::Empty { id } => *id,
            Self::Waiting(data) => data.id,
            Self::Requested(data) => data.id,
            Self::Accepted(data) => data.id,
            Self::InProgress(data) => data.id,
            Self::Discarded(data) => data.id,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Empty { .. } => "call-empty",
            Self::Waiting(_) => "call-waiting",
            Self::Requested(_) => "call-requested",
            Self::Accepted(_) => "call-accepted",
            Self::InProgress(_) => "call-in-progress",
            Self::Discarded(_) => "call-discarded",
        }
    }
}

impl fmt::Display for PhoneCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id {})", self.kind(), self.id())
    }
}

/// Requests the call submits to the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingRequest {
    RequestCall {
        user_id: UserId,
        random_id: i32,
        g_a_hash: Vec<u8>,
        protocol: CallProtocol,
    },
    AcceptCall {
        peer: InputPhoneCall,
        g_b: Vec<u8>,
        protocol: CallProtocol,
    },
    ConfirmCall {
        peer: InputPhoneCall,
        g_a: Vec<u8>,
        key_fingerprint: u64,
        protocol: CallProtocol,
    },
    DiscardCall {
        peer: InputPhoneCall,
        duration: i32,
        reason: DiscardReason,
        connection_id: i64,
    },
    /// Diagnostic upload. Fire-and-forget.
    SaveCallDebug {
        peer: InputPhoneCall,
        debug: String,
    },
}

impl SignalingRequest {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RequestCall { .. } => "request-call",
            Self::AcceptCall { .. } => "accept-call",
            Self::ConfirmCall { .. } => "confirm-call",
            Self::DiscardCall { .. } => "discard-call",
            Self::SaveCallDebug { .. } => "save-call-debug",
        }
    }
}

/// Successful result of a [`SignalingRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingResponse {
    /// Create, accept and confirm return the updated call description.
    PhoneCall(PhoneCall),
    /// Discard returns the updates it produced.
    Updates(Vec<PhoneCall>),
    /// Plain acknowledgment (debug upload).
    Ok,
}
