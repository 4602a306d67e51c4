//! Media engine collaborator.
//!
//! The media engine does the actual audio transport and encryption once a key
//! is agreed. It runs on its own threads and reports connectivity through a
//! callback that may fire from any of them, including during its own teardown.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use log::debug;

use super::key_exchange::AuthKey;
use super::signaling::PhoneConnection;
use crate::config::MediaConfig;

/// Length of the peer tag every relay endpoint must carry.
pub const PEER_TAG_SIZE: usize = 16;

/// Connectivity states reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    WaitInit,
    WaitInitAck,
    Established,
    Failed,
    /// A state code this crate does not know about.
    Unknown(i32),
}

/// Callback the media engine invokes on connectivity changes.
pub type StateCallback = Arc<dyn Fn(ControllerState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    UdpRelay,
}

/// Network endpoint handed to the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: i64,
    pub port: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub kind: EndpointKind,
    pub peer_tag: [u8; PEER_TAG_SIZE],
}

impl Endpoint {
    /// Convert a relay connection record. Records without a 16-byte peer tag
    /// or with a port outside `u16` are skipped.
    pub fn from_connection(connection: &PhoneConnection) -> Option<Self> {
        let peer_tag: [u8; PEER_TAG_SIZE] = connection.peer_tag.as_slice().try_into().ok()?;
        let port = u16::try_from(connection.port).ok()?;
        Some(Self {
            id: connection.id,
            port,
            ipv4: connection.ip.parse().ok(),
            ipv6: connection.ipv6.parse().ok(),
            kind: EndpointKind::UdpRelay,
            peer_tag,
        })
    }
}

/// Endpoints from the primary connection followed by all alternatives.
pub fn collect_endpoints<'a>(
    primary: &'a PhoneConnection,
    alternatives: impl IntoIterator<Item = &'a PhoneConnection>,
) -> Vec<Endpoint> {
    std::iter::once(primary)
        .chain(alternatives)
        .filter_map(|connection| {
            let endpoint = Endpoint::from_connection(connection);
            if endpoint.is_none() {
                debug!(
                    target: "Call/Media",
                    "Skipping endpoint {} (port {}, {}-byte peer tag)",
                    connection.id,
                    connection.port,
                    connection.peer_tag.len()
                );
            }
            endpoint
        })
        .collect()
}

/// Everything the media engine needs to open a session.
#[derive(Debug, Clone)]
pub struct MediaSessionParams {
    pub key: AuthKey,
    /// True for the originator. Decides the encryption direction parity.
    pub is_outgoing: bool,
    pub endpoints: Vec<Endpoint>,
    pub allow_p2p: bool,
    pub config: MediaConfig,
}

/// Factory for media sessions.
pub trait MediaEngine: Send + Sync {
    fn create(&self, params: MediaSessionParams) -> Box<dyn MediaController>;
}

/// Handle to one running media session. Dropping it tears the session down.
pub trait MediaController: Send {
    fn set_mute(&mut self, mute: bool);
    fn set_state_callback(&mut self, callback: StateCallback);
    fn start(&mut self);
    fn connect(&mut self);
    fn preferred_relay_id(&self) -> i64;
    fn debug_log(&self) -> String;
}
