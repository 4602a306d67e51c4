//! Call setup over a relay server.
//!
//! This module negotiates an end-to-end encrypted voice call: a Diffie-Hellman
//! exchange validated against an untrusted peer, a state machine driven by
//! out-of-order signaling, and timeouts that always make progress toward a
//! terminal state.
//!
//! # Architecture
//!
//! - [`key_exchange`]: DH values, auth key, fingerprint
//! - [`PhoneCall`]: the closed set of inbound call updates
//! - [`interpret`]: validates an update against a call snapshot
//! - [`Call`]: the aggregate and its state machine
//! - [`SignalingTransport`] & [`MediaEngine`]: collaborators the call drives
//! - [`loopback`]: in-memory relay and media engine for demos and tests
//!
//! # Protocol Overview
//!
//! The originator commits to `g_a` with its SHA-256 hash in the create-call
//! request. The receiver answers with `g_b`, the originator derives the key
//! and reveals `g_a` with the key fingerprint in a confirm-call request, and
//! the receiver checks `g_a` against the commitment before deriving the same
//! key. Media starts once both sides hold a verified key.

mod call;
mod error;
mod handler;
pub mod key_exchange;
pub mod loopback;
mod media;
mod signaling;
mod state;
mod timer;
mod transport;

#[cfg(test)]
mod test_support;

pub use call::{Call, CallDelegate, CallEvent, CallServices, RequestKind, SessionIdentity};
pub use error::{CallError, TransportError};
pub use handler::{CallView, Interpretation, check_call_fields, check_common_fields, interpret};
pub use key_exchange::{AuthKey, DhConfig, RandomPower};
pub use media::{
    ControllerState, Endpoint, EndpointKind, MediaController, MediaEngine, MediaSessionParams,
    PEER_TAG_SIZE, StateCallback, collect_endpoints,
};
pub use signaling::{
    CallProtocol, InputPhoneCall, PhoneCall, PhoneCallAccepted, PhoneCallData,
    PhoneCallDiscarded, PhoneCallRequested, PhoneCallWaiting, PhoneConnection, SignalingRequest,
    SignalingResponse, UserId,
};
pub use state::{CallState, CallType, DiscardReason, hangup_reason};
pub use transport::SignalingTransport;
