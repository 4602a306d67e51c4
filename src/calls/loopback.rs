//! In-memory relay server and media engine.
//!
//! [`LoopbackRelay`] plays the server side of call signaling for any number of
//! registered users: it assigns call ids and access hashes, forwards key
//! material between the two parties and pushes the updates each of them would
//! receive. [`LoopbackMediaEngine`] reports a successful connection shortly
//! after `connect`. Together they let two [`Call`]s negotiate inside one
//! process.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};

use super::call::{Call, CallDelegate, CallServices};
use super::error::TransportError;
use super::key_exchange::DhConfig;
use super::media::{
    ControllerState, MediaController, MediaEngine, MediaSessionParams, PEER_TAG_SIZE,
    StateCallback,
};
use super::signaling::{
    CallProtocol, InputPhoneCall, PhoneCall, PhoneCallAccepted, PhoneCallData, PhoneCallDiscarded,
    PhoneCallRequested, PhoneCallWaiting, PhoneConnection, SignalingRequest, SignalingResponse,
    UserId,
};
use super::state::{CallType, DiscardReason};
use super::transport::SignalingTransport;
use crate::config::CallConfig;

/// RFC 3526 2048-bit MODP group, big-endian hex.
pub const MODP_2048_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// The DH parameters the relay hands out.
pub fn default_dh_config() -> DhConfig {
    DhConfig {
        version: 1,
        g: 2,
        p: hex::decode(MODP_2048_PRIME).unwrap_or_default(),
    }
}

const RELAY_ENDPOINT_ID: i64 = 1_000_001;
const ALT_ENDPOINT_ID: i64 = 1_000_002;

struct RelayCall {
    access_hash: i64,
    date: i32,
    admin_id: UserId,
    participant_id: UserId,
    protocol: CallProtocol,
    g_a_hash: Vec<u8>,
    g_b: Option<Vec<u8>>,
}

impl RelayCall {
    fn waiting(&self, id: i64) -> PhoneCall {
        PhoneCall::Waiting(PhoneCallWaiting {
            id,
            access_hash: self.access_hash,
            date: self.date,
            admin_id: self.admin_id,
            participant_id: self.participant_id,
            protocol: self.protocol,
            receive_date: None,
        })
    }

    fn other_party(&self, user: UserId) -> UserId {
        if user == self.admin_id {
            self.participant_id
        } else {
            self.admin_id
        }
    }
}

/// Server side of call signaling, shared by every [`LoopbackTransport`].
pub struct LoopbackRelay {
    next_id: AtomicI64,
    calls: DashMap<i64, RelayCall>,
    subscribers: DashMap<UserId, mpsc::UnboundedSender<PhoneCall>>,
    debug_logs: DashMap<i64, String>,
}

impl LoopbackRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            calls: DashMap::new(),
            subscribers: DashMap::new(),
            debug_logs: DashMap::new(),
        })
    }

    /// Start receiving the updates pushed to `user`. Replaces any previous
    /// registration.
    pub fn register(&self, user: UserId) -> mpsc::UnboundedReceiver<PhoneCall> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(user, tx);
        rx
    }

    /// A transport that submits requests on behalf of `user`.
    pub fn transport(self: &Arc<Self>, user: UserId) -> LoopbackTransport {
        LoopbackTransport {
            relay: Arc::clone(self),
            user,
        }
    }

    /// The debug log uploaded for a call, if any.
    pub fn debug_log(&self, call_id: i64) -> Option<String> {
        self.debug_logs.get(&call_id).map(|log| log.clone())
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    fn push(&self, user: UserId, update: PhoneCall) {
        debug!(target: "Relay", "Pushing {update} to user {user}");
        let delivered = self
            .subscribers
            .get(&user)
            .is_some_and(|tx| tx.send(update).is_ok());
        if !delivered {
            warn!(target: "Relay", "User {user} is not listening for updates");
        }
    }

    fn handle(
        &self,
        user: UserId,
        request: SignalingRequest,
    ) -> Result<SignalingResponse, TransportError> {
        match request {
            SignalingRequest::RequestCall {
                user_id,
                g_a_hash,
                protocol,
                ..
            } => Ok(self.request_call(user, user_id, g_a_hash, protocol)),
            SignalingRequest::AcceptCall { peer, g_b, .. } => self.accept_call(user, peer, g_b),
            SignalingRequest::ConfirmCall {
                peer,
                g_a,
                key_fingerprint,
                ..
            } => self.confirm_call(user, peer, g_a, key_fingerprint),
            SignalingRequest::DiscardCall {
                peer,
                duration,
                reason,
                ..
            } => self.discard_call(user, peer, duration, reason),
            SignalingRequest::SaveCallDebug { peer, debug } => {
                self.lookup(user, peer)?;
                self.debug_logs.insert(peer.id, debug);
                Ok(SignalingResponse::Ok)
            }
        }
    }

    fn request_call(
        &self,
        admin_id: UserId,
        participant_id: UserId,
        g_a_hash: Vec<u8>,
        protocol: CallProtocol,
    ) -> SignalingResponse {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = RelayCall {
            access_hash: rand::random::<i64>(),
            date: chrono::Utc::now().timestamp() as i32,
            admin_id,
            participant_id,
            protocol,
            g_a_hash,
            g_b: None,
        };
        info!(target: "Relay", "Call {id}: {admin_id} -> {participant_id}");

        let waiting = call.waiting(id);
        let requested = PhoneCall::Requested(PhoneCallRequested {
            id,
            access_hash: call.access_hash,
            date: call.date,
            admin_id,
            participant_id,
            g_a_hash: call.g_a_hash.clone(),
            protocol,
        });
        // The callee may answer as soon as the push lands.
        self.calls.insert(id, call);
        self.push(participant_id, requested);
        SignalingResponse::PhoneCall(waiting)
    }

    fn accept_call(
        &self,
        user: UserId,
        peer: InputPhoneCall,
        g_b: Vec<u8>,
    ) -> Result<SignalingResponse, TransportError> {
        let (waiting, accepted, admin_id) = {
            let mut call = self.lookup_mut(user, peer)?;
            if call.participant_id != user || call.g_b.is_some() {
                return Err(call_error("CALL_ALREADY_ACCEPTED"));
            }
            call.g_b = Some(g_b.clone());
            let accepted = PhoneCall::Accepted(PhoneCallAccepted {
                id: peer.id,
                access_hash: call.access_hash,
                date: call.date,
                admin_id: call.admin_id,
                participant_id: call.participant_id,
                g_b,
                protocol: call.protocol,
            });
            (call.waiting(peer.id), accepted, call.admin_id)
        };
        self.push(admin_id, accepted);
        Ok(SignalingResponse::PhoneCall(waiting))
    }

    fn confirm_call(
        &self,
        user: UserId,
        peer: InputPhoneCall,
        g_a: Vec<u8>,
        key_fingerprint: u64,
    ) -> Result<SignalingResponse, TransportError> {
        let (for_admin, for_participant, participant_id) = {
            let call = self.lookup(user, peer)?;
            let Some(g_b) = call.g_b.clone() else {
                return Err(call_error("CALL_PEER_INVALID"));
            };
            if call.admin_id != user {
                return Err(call_error("CALL_PEER_INVALID"));
            }
            let connection = relay_connection(RELAY_ENDPOINT_ID);
            let alternatives = vec![relay_connection(ALT_ENDPOINT_ID)];
            let data = |g_a_or_b: Vec<u8>| PhoneCallData {
                id: peer.id,
                access_hash: call.access_hash,
                date: call.date,
                admin_id: call.admin_id,
                participant_id: call.participant_id,
                g_a_or_b,
                key_fingerprint,
                protocol: call.protocol,
                connection: connection.clone(),
                alternative_connections: alternatives.clone(),
                start_date: chrono::Utc::now().timestamp() as i32,
            };
            (data(g_b), data(g_a), call.participant_id)
        };
        info!(target: "Relay", "Call {} confirmed, fingerprint {key_fingerprint:016x}", peer.id);
        self.push(participant_id, PhoneCall::InProgress(for_participant));
        Ok(SignalingResponse::PhoneCall(PhoneCall::InProgress(for_admin)))
    }

    fn discard_call(
        &self,
        user: UserId,
        peer: InputPhoneCall,
        duration: i32,
        reason: DiscardReason,
    ) -> Result<SignalingResponse, TransportError> {
        let other = self.lookup(user, peer)?.other_party(user);
        self.calls.remove(&peer.id);
        info!(target: "Relay", "Call {} discarded by {user} ({reason:?}, {duration}s)", peer.id);

        let discarded = PhoneCall::Discarded(PhoneCallDiscarded {
            id: peer.id,
            reason: Some(reason),
            duration: Some(duration),
            need_rating: false,
            need_debug: false,
        });
        self.push(other, discarded.clone());
        Ok(SignalingResponse::Updates(vec![discarded]))
    }

    fn lookup(
        &self,
        user: UserId,
        peer: InputPhoneCall,
    ) -> Result<dashmap::mapref::one::Ref<'_, i64, RelayCall>, TransportError> {
        let call = self
            .calls
            .get(&peer.id)
            .ok_or_else(|| call_error("CALL_PEER_INVALID"))?;
        if call.access_hash != peer.access_hash
            || (call.admin_id != user && call.participant_id != user)
        {
            return Err(call_error("CALL_PEER_INVALID"));
        }
        Ok(call)
    }

    fn lookup_mut(
        &self,
        user: UserId,
        peer: InputPhoneCall,
    ) -> Result<dashmap::mapref::one::RefMut<'_, i64, RelayCall>, TransportError> {
        let call = self
            .calls
            .get_mut(&peer.id)
            .ok_or_else(|| call_error("CALL_PEER_INVALID"))?;
        if call.access_hash != peer.access_hash
            || (call.admin_id != user && call.participant_id != user)
        {
            return Err(call_error("CALL_PEER_INVALID"));
        }
        Ok(call)
    }
}

fn call_error(message: &str) -> TransportError {
    TransportError::Rpc {
        code: 400,
        message: message.to_string(),
    }
}

fn relay_connection(id: i64) -> PhoneConnection {
    let mut peer_tag = vec![0u8; PEER_TAG_SIZE];
    rand::rng().fill_bytes(&mut peer_tag);
    PhoneConnection {
        id,
        ip: "127.0.0.1".to_string(),
        ipv6: "::1".to_string(),
        port: 0,
        peer_tag,
    }
}

/// Submits requests to a [`LoopbackRelay`] as one user.
#[derive(Clone)]
pub struct LoopbackTransport {
    relay: Arc<LoopbackRelay>,
    user: UserId,
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn request(
        &self,
        request: SignalingRequest,
    ) -> Result<SignalingResponse, TransportError> {
        debug!(target: "Relay", "User {} sent {}", self.user, request.name());
        self.relay.handle(self.user, request)
    }
}

/// Hands out the relay's DH config and logs call outcomes.
pub struct LoggingDelegate {
    dh_config: DhConfig,
}

impl LoggingDelegate {
    pub fn new(dh_config: DhConfig) -> Self {
        Self { dh_config }
    }
}

impl Default for LoggingDelegate {
    fn default() -> Self {
        Self::new(default_dh_config())
    }
}

impl CallDelegate for LoggingDelegate {
    fn dh_config(&self) -> DhConfig {
        self.dh_config.clone()
    }

    fn call_finished(&self, call: &Call) {
        info!(target: "Call", "Call {} with {} finished", call.id(), call.peer_id());
    }

    fn call_failed(&self, call: &Call) {
        warn!(target: "Call", "Call {} with {} failed", call.id(), call.peer_id());
    }
}

/// Media engine whose sessions connect by themselves.
#[derive(Debug, Clone)]
pub struct LoopbackMediaEngine {
    step_delay: Duration,
}

impl LoopbackMediaEngine {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for LoopbackMediaEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl MediaEngine for LoopbackMediaEngine {
    fn create(&self, params: MediaSessionParams) -> Box<dyn MediaController> {
        Box::new(LoopbackController {
            step_delay: self.step_delay,
            params,
            muted: false,
            callback: None,
        })
    }
}

struct LoopbackController {
    step_delay: Duration,
    params: MediaSessionParams,
    muted: bool,
    callback: Option<StateCallback>,
}

impl MediaController for LoopbackController {
    fn set_mute(&mut self, mute: bool) {
        self.muted = mute;
    }

    fn set_state_callback(&mut self, callback: StateCallback) {
        self.callback = Some(callback);
    }

    fn start(&mut self) {
        debug!(
            target: "Call/Media",
            "Loopback session started, fingerprint {:016x}",
            self.params.key.fingerprint()
        );
    }

    fn connect(&mut self) {
        let Some(callback) = self.callback.clone() else {
            return;
        };
        let delay = self.step_delay;
        std::thread::spawn(move || {
            for state in [
                ControllerState::WaitInit,
                ControllerState::WaitInitAck,
                ControllerState::Established,
            ] {
                std::thread::sleep(delay);
                callback(state);
            }
        });
    }

    fn preferred_relay_id(&self) -> i64 {
        self.params.endpoints.first().map_or(0, |e| e.id)
    }

    fn debug_log(&self) -> String {
        serde_json::json!({
            "endpoints": self.params.endpoints.len(),
            "outgoing": self.params.is_outgoing,
            "muted": self.muted,
        })
        .to_string()
    }
}

/// Wiring for one user on a loopback relay.
pub fn loopback_services(relay: &Arc<LoopbackRelay>, user: UserId) -> CallServices {
    CallServices {
        identity: super::call::SessionIdentity { user_id: user },
        delegate: Arc::new(LoggingDelegate::default()),
        transport: Arc::new(relay.transport(user)),
        media: Arc::new(LoopbackMediaEngine::default()),
    }
}

/// Fresh caller-supplied entropy for [`Call::start`].
pub fn random_seed() -> Vec<u8> {
    let mut seed = vec![0u8; super::key_exchange::RANDOM_POWER_SIZE];
    rand::rng().fill_bytes(&mut seed);
    seed
}

/// Own a call until it reaches a terminal state, feeding it queued events and
/// pushed updates. Completing `hangup` hangs the call up.
pub async fn run_call(
    mut call: Call,
    mut updates: mpsc::UnboundedReceiver<PhoneCall>,
    mut hangup: oneshot::Receiver<()>,
) -> Call {
    let mut hangup_requested = false;
    let mut updates_open = true;
    while !call.state().is_terminal() {
        tokio::select! {
            // Request results first: a pushed update may refer to an id the
            // call only learns from a queued response.
            biased;
            Some(event) = call.next_event() => call.handle_event(event),
            update = updates.recv(), if updates_open => match update {
                // Only a fresh incoming call may take a call-requested; any
                // other caller is left to time out.
                Some(PhoneCall::Requested(request))
                    if call.id() != 0 || call.call_type() == CallType::Outgoing =>
                {
                    info!(
                        target: "Call",
                        "Ignoring call {} from {} during call {}",
                        request.id, request.admin_id, call.id()
                    );
                }
                Some(update) => {
                    if !call.handle_update(&update) {
                        debug!(target: "Call", "Update {update} is not for call {}", call.id());
                    }
                }
                None => {
                    warn!(target: "Call", "Update stream closed, hanging up call {}", call.id());
                    updates_open = false;
                    call.hangup();
                }
            },
            result = &mut hangup, if !hangup_requested => {
                hangup_requested = true;
                if result.is_ok() {
                    call.hangup();
                }
            }
            else => break,
        }
    }
    call
}

/// Wait for an incoming call request, then answer it.
///
/// Returns `None` if the update stream closes first.
pub async fn answer_next_call(
    services: CallServices,
    updates: &mut mpsc::UnboundedReceiver<PhoneCall>,
    config: CallConfig,
    seed: &[u8],
) -> Option<Call> {
    loop {
        let update = updates.recv().await?;
        let PhoneCall::Requested(request) = &update else {
            debug!(target: "Call", "Ignoring {update} while idle");
            continue;
        };
        let mut call = Call::new(services, request.admin_id, CallType::Incoming, config);
        call.handle_update(&update);
        call.start(seed);
        call.answer();
        return Some(call);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::key_exchange::{
        RANDOM_POWER_SIZE, RandomPower, compute_g_a_hash, compute_mod_exp_first,
    };

    fn seeded_request(relay: &Arc<LoopbackRelay>, from: UserId, to: UserId) -> (i64, i64) {
        let power = RandomPower::from_bytes([9; RANDOM_POWER_SIZE]);
        let g_a = compute_mod_exp_first(&default_dh_config(), &power);
        let response = relay
            .handle(
                from,
                SignalingRequest::RequestCall {
                    user_id: to,
                    random_id: 1,
                    g_a_hash: compute_g_a_hash(&g_a).to_vec(),
                    protocol: CallConfig::default().protocol(),
                },
            )
            .unwrap();
        let SignalingResponse::PhoneCall(PhoneCall::Waiting(waiting)) = response else {
            panic!("expected call-waiting, got {response:?}");
        };
        (waiting.id, waiting.access_hash)
    }

    #[test]
    fn test_default_dh_config_is_2048_bit() {
        let config = default_dh_config();
        assert_eq!(config.p.len(), 256);
        assert_eq!(config.g, 2);
    }

    #[test]
    fn test_request_pushes_requested_to_callee() {
        let relay = LoopbackRelay::new();
        let mut bob = relay.register(2);
        let (id, access_hash) = seeded_request(&relay, 1, 2);

        let Ok(PhoneCall::Requested(requested)) = bob.try_recv() else {
            panic!("bob did not receive call-requested");
        };
        assert_eq!(requested.id, id);
        assert_eq!(requested.access_hash, access_hash);
        assert_eq!(requested.admin_id, 1);
        assert_eq!(requested.participant_id, 2);
        assert_eq!(requested.g_a_hash.len(), 32);
    }

    #[test]
    fn test_wrong_access_hash_is_rejected() {
        let relay = LoopbackRelay::new();
        let _bob = relay.register(2);
        let (id, access_hash) = seeded_request(&relay, 1, 2);

        let result = relay.handle(
            2,
            SignalingRequest::AcceptCall {
                peer: InputPhoneCall {
                    id,
                    access_hash: access_hash.wrapping_add(1),
                },
                g_b: vec![5; 256],
                protocol: CallProtocol::default(),
            },
        );
        assert_eq!(result, Err(call_error("CALL_PEER_INVALID")));
    }

    #[test]
    fn test_confirm_before_accept_is_rejected() {
        let relay = LoopbackRelay::new();
        let _bob = relay.register(2);
        let (id, access_hash) = seeded_request(&relay, 1, 2);

        let result = relay.handle(
            1,
            SignalingRequest::ConfirmCall {
                peer: InputPhoneCall { id, access_hash },
                g_a: vec![5; 256],
                key_fingerprint: 1,
                protocol: CallProtocol::default(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_discard_notifies_other_party() {
        let relay = LoopbackRelay::new();
        let mut alice = relay.register(1);
        let mut bob = relay.register(2);
        let (id, access_hash) = seeded_request(&relay, 1, 2);
        let _ = bob.try_recv();

        let response = relay
            .handle(
                2,
                SignalingRequest::DiscardCall {
                    peer: InputPhoneCall { id, access_hash },
                    duration: 0,
                    reason: DiscardReason::Busy,
                    connection_id: 0,
                },
            )
            .unwrap();
        assert!(matches!(response, SignalingResponse::Updates(ref u) if u.len() == 1));

        let Ok(PhoneCall::Discarded(discarded)) = alice.try_recv() else {
            panic!("alice did not receive call-discarded");
        };
        assert_eq!(discarded.reason, Some(DiscardReason::Busy));
        assert_eq!(relay.active_calls(), 0);
    }

    #[test]
    fn test_connections_carry_full_peer_tags() {
        let connection = relay_connection(RELAY_ENDPOINT_ID);
        assert_eq!(connection.peer_tag.len(), PEER_TAG_SIZE);
    }
}
