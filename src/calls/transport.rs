//! Signaling transport collaborator.

use async_trait::async_trait;

use super::error::TransportError;
use super::signaling::{SignalingRequest, SignalingResponse};

/// Sends signed requests to the relay server.
///
/// The call never awaits a request on its control path: each request is
/// spawned, and its result is queued back onto the call's event queue.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn request(&self, request: SignalingRequest)
    -> Result<SignalingResponse, TransportError>;
}
