//! The call aggregate and its state machine.
//!
//! A [`Call`] is owned by a single control task. Every mutation goes through
//! `&mut self`: local actions are plain method calls, inbound updates go
//! through [`Call::handle_update`], and everything asynchronous (request
//! completions, media engine state changes, the hangup timer) arrives as a
//! [`CallEvent`] on the call's own queue, which the owner drains with
//! [`Call::next_event`] and [`Call::handle_event`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::error::{CallError, TransportError};
use super::handler::{self, CallView, Interpretation};
use super::key_exchange::{
    AuthKey, DhConfig, G_A_HASH_SIZE, RandomPower, compute_g_a_hash,
    compute_mod_exp_first, compute_shared_secret, is_good_ga_gb,
};
use super::media::{
    ControllerState, MediaController, MediaEngine, MediaSessionParams, collect_endpoints,
};
use super::signaling::{
    CallProtocol, InputPhoneCall, PhoneCall, PhoneCallAccepted, PhoneCallData, SignalingRequest,
    SignalingResponse, UserId,
};
use super::state::{CallState, CallType, DiscardReason, hangup_reason};
use super::timer::HangupTimer;
use super::transport::SignalingTransport;
use crate::config::CallConfig;

const STATE_CHANNEL_CAPACITY: usize = 16;

/// The local session's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
}

/// Owner-side hooks: DH parameters in, terminal outcomes out.
///
/// `call_finished` and `call_failed` are mutually exclusive and each fires at
/// most once per call.
pub trait CallDelegate: Send + Sync {
    fn dh_config(&self) -> DhConfig;
    fn call_finished(&self, call: &Call);
    fn call_failed(&self, call: &Call);
}

/// External collaborators a call talks to.
#[derive(Clone)]
pub struct CallServices {
    pub identity: SessionIdentity,
    pub delegate: Arc<dyn CallDelegate>,
    pub transport: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaEngine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    RequestCall,
    AcceptCall,
    ConfirmCall,
    DiscardCall,
}

/// Something that happened off the control path, queued for the owner.
#[derive(Debug)]
pub enum CallEvent {
    RequestDone {
        kind: RequestKind,
        result: Result<SignalingResponse, TransportError>,
    },
    /// A media engine state change, already mapped to a call phase.
    MediaState(CallState),
    HangupTimeout {
        generation: u64,
    },
}

struct KeyMaterial {
    dh_config: DhConfig,
    power: RandomPower,
}

pub struct Call {
    services: CallServices,
    config: CallConfig,
    call_type: CallType,
    peer_id: UserId,
    state: CallState,

    id: i64,
    access_hash: i64,
    protocol: CallProtocol,

    keys: Option<KeyMaterial>,
    g_a: Vec<u8>,
    g_b: Vec<u8>,
    g_a_hash: Option<[u8; G_A_HASH_SIZE]>,
    auth_key: Option<AuthKey>,
    key_fingerprint: u64,

    start_time: Option<Instant>,
    finish_after_requesting: bool,
    mute: bool,
    controller: Option<Box<dyn MediaController>>,

    events_tx: mpsc::UnboundedSender<CallEvent>,
    events_rx: mpsc::UnboundedReceiver<CallEvent>,
    state_tx: broadcast::Sender<CallState>,
    hangup_timer: HangupTimer,
}

impl Call {
    pub fn new(
        services: CallServices,
        peer_id: UserId,
        call_type: CallType,
        config: CallConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let state = match call_type {
            CallType::Outgoing => CallState::Requesting,
            CallType::Incoming => CallState::Starting,
        };
        Self {
            services,
            protocol: config.protocol(),
            config,
            call_type,
            peer_id,
            state,
            id: 0,
            access_hash: 0,
            keys: None,
            g_a: Vec::new(),
            g_b: Vec::new(),
            g_a_hash: None,
            auth_key: None,
            key_fingerprint: 0,
            start_time: None,
            finish_after_requesting: false,
            mute: false,
            controller: None,
            hangup_timer: HangupTimer::new(events_tx.clone()),
            events_tx,
            events_rx,
            state_tx,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Every subsequent phase change, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    /// Server-assigned id, zero until known.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_muted(&self) -> bool {
        self.mute
    }

    /// Fingerprint of the agreed key, once derived.
    pub fn key_fingerprint(&self) -> Option<u64> {
        self.auth_key.as_ref().map(|_| self.key_fingerprint)
    }

    /// Time since media connectivity started, if it ever did.
    pub fn duration(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }

    pub fn has_media_session(&self) -> bool {
        self.controller.is_some()
    }

    /// Snapshot the DH config, generate our exponent and start in the
    /// direction given at construction.
    pub fn start(&mut self, seed: &[u8]) {
        match self.call_type {
            CallType::Outgoing => self.start_outgoing(seed),
            CallType::Incoming => self.start_incoming(seed),
        }
    }

    /// Compute `g_a`, commit to it and ask the server to create the call.
    ///
    /// # Panics
    ///
    /// Panics on an incoming call, on a seed of the wrong size, or on a DH
    /// config with `g == 0` or an empty `p`.
    pub fn start_outgoing(&mut self, seed: &[u8]) {
        assert_eq!(self.call_type, CallType::Outgoing, "start_outgoing on an incoming call");
        if self.keys.is_some() || self.state.is_terminal() {
            warn!(target: "Call", "Outgoing call already started (state {})", self.state);
            return;
        }
        let keys = self.snapshot_keys(seed);
        self.g_a = compute_mod_exp_first(&keys.dh_config, &keys.power);
        self.keys = Some(keys);
        if self.g_a.is_empty() {
            self.fail(CallError::ModExp("first"));
            return;
        }
        let g_a_hash = compute_g_a_hash(&self.g_a);
        self.g_a_hash = Some(g_a_hash);

        self.set_state(CallState::Requesting);
        info!(target: "Call", "Requesting call to user {}", self.peer_id);
        self.send_request(SignalingRequest::RequestCall {
            user_id: self.peer_id,
            random_id: rand::random::<i32>(),
            g_a_hash: g_a_hash.to_vec(),
            protocol: self.config.protocol(),
        });
    }

    /// Prepare our exponent and start ringing.
    ///
    /// # Panics
    ///
    /// Same contract as [`Call::start_outgoing`], for incoming calls.
    pub fn start_incoming(&mut self, seed: &[u8]) {
        assert_eq!(self.call_type, CallType::Incoming, "start_incoming on an outgoing call");
        if self.keys.is_some() || self.state.is_terminal() {
            warn!(target: "Call", "Incoming call already started (state {})", self.state);
            return;
        }
        self.keys = Some(self.snapshot_keys(seed));
        self.set_state(CallState::Ringing);
    }

    fn snapshot_keys(&self, seed: &[u8]) -> KeyMaterial {
        // The global config may change while the call runs; this snapshot is
        // what every computation of this call uses.
        let dh_config = self.services.delegate.dh_config();
        assert!(dh_config.g != 0, "DH config has g == 0");
        assert!(!dh_config.p.is_empty(), "DH config has an empty p");
        KeyMaterial {
            dh_config,
            power: RandomPower::generate(seed),
        }
    }

    /// Answer a ringing incoming call with our `g_b`.
    ///
    /// # Panics
    ///
    /// Panics on an outgoing call.
    pub fn answer(&mut self) {
        assert_eq!(self.call_type, CallType::Incoming, "answer on an outgoing call");
        if self.state != CallState::Ringing || self.id == 0 {
            warn!(target: "Call", "Ignoring answer in state {} (id {})", self.state, self.id);
            return;
        }
        let Some(keys) = &self.keys else {
            return;
        };
        self.g_b = compute_mod_exp_first(&keys.dh_config, &keys.power);
        if self.g_b.is_empty() {
            self.fail(CallError::ModExp("first"));
            return;
        }

        self.set_state(CallState::ExchangingKeys);
        self.send_request(SignalingRequest::AcceptCall {
            peer: self.input_call(),
            g_b: self.g_b.clone(),
            protocol: self.protocol,
        });
    }

    pub fn hangup(&mut self) {
        let reason = hangup_reason(self.state, self.call_type);
        self.finish(reason);
    }

    pub fn decline(&mut self) {
        self.finish(DiscardReason::Busy);
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
        if let Some(controller) = &mut self.controller {
            controller.set_mute(mute);
        }
    }

    /// Offer an inbound update to this call.
    ///
    /// Returns false when the update belongs to another call; the dispatcher
    /// should then try the other active calls.
    pub fn handle_update(&mut self, update: &PhoneCall) -> bool {
        let interpretation = handler::interpret(&self.view(), update);
        if matches!(interpretation, Interpretation::NotThisCall) {
            return false;
        }
        if self.state.is_terminal() {
            debug!(target: "Call", "Ignoring {update} in state {}", self.state);
            return true;
        }
        match interpretation {
            Interpretation::NotThisCall | Interpretation::Acknowledged => {}
            Interpretation::Requested {
                id,
                access_hash,
                protocol,
                g_a_hash,
            } => {
                self.id = id;
                self.access_hash = access_hash;
                self.protocol = protocol;
                self.g_a_hash = Some(g_a_hash);
            }
            Interpretation::ConfirmIncoming(data) => self.start_confirmed_call(data),
            Interpretation::Accepted(data) => self.confirm_accepted_call(data),
            Interpretation::Discarded { busy, need_debug } => {
                if need_debug {
                    self.upload_debug_log();
                }
                self.set_state(if busy {
                    CallState::Busy
                } else {
                    CallState::Ended
                });
            }
            Interpretation::Failed(err) => self.fail(err),
        }
        true
    }

    /// Wait for the next queued event. `None` only if the queue is closed,
    /// which cannot happen while the call is alive.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events_rx.recv().await
    }

    /// Handle every event that is already queued, without waiting.
    pub fn process_pending(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    /// Drive the call until it reaches `Ended` or `Failed`.
    pub async fn run_until_finished(&mut self) {
        while !self.state.is_terminal() {
            let Some(event) = self.next_event().await else {
                return;
            };
            self.handle_event(event);
        }
    }

    pub fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::RequestDone { kind, result } => self.handle_request_done(kind, result),
            CallEvent::MediaState(state) => self.handle_media_state(state),
            CallEvent::HangupTimeout { generation } => {
                if self.hangup_timer.expire(generation) {
                    info!(target: "Call", "Hangup timeout in state {}, ending call", self.state);
                    self.set_state(CallState::Ended);
                }
            }
        }
    }

    fn handle_request_done(
        &mut self,
        kind: RequestKind,
        result: Result<SignalingResponse, TransportError>,
    ) {
        if self.state.is_terminal() {
            debug!(target: "Call", "Dropping {kind:?} result in state {}", self.state);
            return;
        }
        match kind {
            RequestKind::RequestCall => self.handle_request_call_done(result),
            RequestKind::AcceptCall => match result {
                Ok(SignalingResponse::PhoneCall(call @ PhoneCall::Waiting(_))) => {
                    self.handle_update(&call);
                }
                Ok(_) => self.fail(CallError::UnexpectedResponse {
                    request: "accept-call",
                    expected: "call-waiting",
                }),
                Err(err) => self.fail(err.into()),
            },
            RequestKind::ConfirmCall if self.is_tearing_down() => {
                debug!(target: "Call", "Dropping confirm-call result in state {}", self.state);
            }
            RequestKind::ConfirmCall => match result {
                Ok(SignalingResponse::PhoneCall(PhoneCall::InProgress(data))) => {
                    self.create_and_start_controller(&data);
                }
                Ok(_) => self.fail(CallError::UnexpectedResponse {
                    request: "confirm-call",
                    expected: "call-in-progress",
                }),
                Err(err) => self.fail(err.into()),
            },
            RequestKind::DiscardCall => {
                match result {
                    Ok(SignalingResponse::Updates(updates)) => {
                        for update in &updates {
                            self.handle_update(update);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => debug!(target: "Call", "Discard request failed: {err}"),
                }
                self.set_state(CallState::Ended);
            }
        }
    }

    fn handle_request_call_done(&mut self, result: Result<SignalingResponse, TransportError>) {
        let waiting = match result {
            Ok(SignalingResponse::PhoneCall(PhoneCall::Waiting(waiting))) => waiting,
            Ok(_) => {
                return self.fail_requesting(CallError::UnexpectedResponse {
                    request: "request-call",
                    expected: "call-waiting",
                });
            }
            Err(err) => return self.fail_requesting(err.into()),
        };

        self.id = waiting.id;
        self.access_hash = waiting.access_hash;
        self.set_state(CallState::Waiting);
        if self.finish_after_requesting {
            self.hangup();
            return;
        }
        self.handle_update(&PhoneCall::Waiting(waiting));
    }

    /// A failed create-call ends the call instead of failing it when the user
    /// already hung up.
    fn fail_requesting(&mut self, err: CallError) {
        if self.finish_after_requesting {
            info!(target: "Call", "Create-call failed after hangup ({err}), ending call");
            self.set_state(CallState::Ended);
        } else {
            self.fail(err);
        }
    }

    /// A hangup or busy signal is being finalized; only `Ended` may follow.
    fn is_tearing_down(&self) -> bool {
        matches!(self.state, CallState::HangingUp | CallState::Busy)
    }

    fn handle_media_state(&mut self, state: CallState) {
        if self.is_tearing_down() {
            debug!(target: "Call/Media", "Ignoring media state {state} while {}", self.state);
            return;
        }
        if state == CallState::Failed {
            self.fail(CallError::MediaFailed);
        } else {
            self.set_state(state);
        }
    }

    /// Originator side: the callee answered with `g_b`.
    fn confirm_accepted_call(&mut self, data: &PhoneCallAccepted) {
        if !matches!(self.state, CallState::Waiting | CallState::ExchangingKeys) {
            debug!(target: "Call", "Ignoring call-accepted in state {}", self.state);
            return;
        }
        if self.auth_key.is_some() {
            debug!(target: "Call", "Duplicate call-accepted for call {}", self.id);
            return;
        }
        let Some(key) = self.derive_auth_key(&data.g_b) else {
            return;
        };
        self.key_fingerprint = key.fingerprint();
        self.auth_key = Some(key);

        self.set_state(CallState::ExchangingKeys);
        self.send_request(SignalingRequest::ConfirmCall {
            peer: self.input_call(),
            g_a: self.g_a.clone(),
            key_fingerprint: self.key_fingerprint,
            protocol: self.config.protocol(),
        });
    }

    /// Receiver side: the originator revealed `g_a`.
    fn start_confirmed_call(&mut self, data: &PhoneCallData) {
        if self.auth_key.is_some() {
            debug!(target: "Call", "Duplicate call data for call {}", self.id);
            return;
        }
        if self.g_a_hash != Some(compute_g_a_hash(&data.g_a_or_b)) {
            self.fail(CallError::WrongGaHash);
            return;
        }
        let Some(key) = self.derive_auth_key(&data.g_a_or_b) else {
            return;
        };
        self.key_fingerprint = key.fingerprint();
        self.auth_key = Some(key);

        self.create_and_start_controller(data);
    }

    fn derive_auth_key(&mut self, peer_value: &[u8]) -> Option<AuthKey> {
        let result = match &self.keys {
            Some(keys) if !is_good_ga_gb(peer_value, &keys.dh_config) => {
                Err(CallError::BadDhValue)
            }
            Some(keys) => compute_shared_secret(&keys.dh_config, peer_value, &keys.power)
                .ok_or(CallError::ModExp("final")),
            None => Err(CallError::ModExp("final")),
        };
        match result {
            Ok(key) => Some(key),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    fn create_and_start_controller(&mut self, data: &PhoneCallData) {
        if self.is_tearing_down() {
            debug!(target: "Call", "Not starting media in state {}", self.state);
            return;
        }
        if let Err(err) = handler::check_call_fields(&self.view(), data, self.key_fingerprint) {
            self.fail(err);
            return;
        }
        let Some(key) = self.auth_key.clone() else {
            self.fail(CallError::ModExp("final"));
            return;
        };

        self.set_state(CallState::Established);

        let endpoints = collect_endpoints(&data.connection, &data.alternative_connections);
        info!(
            target: "Call",
            "Starting media for call {} with {} endpoints, fingerprint {:016x}",
            self.id,
            endpoints.len(),
            self.key_fingerprint
        );
        let mut controller = self.services.media.create(MediaSessionParams {
            key,
            is_outgoing: self.call_type == CallType::Outgoing,
            endpoints,
            allow_p2p: data.protocol.udp_p2p,
            config: self.config.media.clone(),
        });
        if self.mute {
            controller.set_mute(self.mute);
        }

        // Invoked from media engine threads, possibly during its teardown.
        let events = self.events_tx.clone();
        controller.set_state_callback(Arc::new(move |state| {
            if let Some(next) = media_state_to_call_state(state) {
                debug!(target: "Call/Media", "State changed to {next}");
                let _ = events.send(CallEvent::MediaState(next));
            }
        }));
        controller.start();
        controller.connect();
        self.controller = Some(controller);
    }

    fn finish(&mut self, reason: DiscardReason) {
        if self.state == CallState::Requesting {
            self.hangup_timer.arm(self.config.hangup_timeout());
            self.finish_after_requesting = true;
            return;
        }
        if matches!(
            self.state,
            CallState::HangingUp | CallState::Ended | CallState::Failed
        ) {
            return;
        }
        if self.id == 0 {
            self.set_state(CallState::Ended);
            return;
        }

        self.set_state(CallState::HangingUp);
        let duration = self
            .start_time
            .map(|t| whole_seconds(t.elapsed()))
            .unwrap_or(0);
        let connection_id = self
            .controller
            .as_ref()
            .map(|c| c.preferred_relay_id())
            .unwrap_or(0);
        self.hangup_timer.arm(self.config.hangup_timeout());
        info!(
            target: "Call",
            "Discarding call {} ({reason:?}, {duration}s)", self.id
        );
        self.send_request(SignalingRequest::DiscardCall {
            peer: self.input_call(),
            duration,
            reason,
            connection_id,
        });
    }

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        if self.state.is_terminal() {
            debug!(target: "Call", "Ignoring transition {} -> {state}", self.state);
            return;
        }
        debug!(target: "Call", "Call {} state {} -> {state}", self.id, self.state);
        self.state = state;
        let _ = self.state_tx.send(state);

        if state.is_connecting() && self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
        match state {
            CallState::Ended => {
                self.hangup_timer.cancel();
                let delegate = Arc::clone(&self.services.delegate);
                delegate.call_finished(self);
            }
            CallState::Failed => {
                self.hangup_timer.cancel();
                let delegate = Arc::clone(&self.services.delegate);
                delegate.call_failed(self);
            }
            CallState::Busy => self.hangup_timer.arm(self.config.hangup_timeout()),
            _ => {}
        }
    }

    fn fail(&mut self, err: CallError) {
        warn!(target: "Call", "Call {} error: {err}", self.id);
        self.set_state(CallState::Failed);
    }

    fn send_request(&self, request: SignalingRequest) {
        let kind = match &request {
            SignalingRequest::RequestCall { .. } => RequestKind::RequestCall,
            SignalingRequest::AcceptCall { .. } => RequestKind::AcceptCall,
            SignalingRequest::ConfirmCall { .. } => RequestKind::ConfirmCall,
            SignalingRequest::DiscardCall { .. } => RequestKind::DiscardCall,
            SignalingRequest::SaveCallDebug { .. } => {
                self.send_fire_and_forget(request);
                return;
            }
        };
        let transport = Arc::clone(&self.services.transport);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.request(request).await;
            let _ = events.send(CallEvent::RequestDone { kind, result });
        });
    }

    fn send_fire_and_forget(&self, request: SignalingRequest) {
        let transport = Arc::clone(&self.services.transport);
        tokio::spawn(async move {
            let name = request.name();
            if let Err(err) = transport.request(request).await {
                debug!(target: "Call", "{name} failed: {err}");
            }
        });
    }

    fn upload_debug_log(&self) {
        let Some(controller) = &self.controller else {
            return;
        };
        let debug = controller.debug_log();
        if debug.is_empty() {
            return;
        }
        self.send_request(SignalingRequest::SaveCallDebug {
            peer: self.input_call(),
            debug,
        });
    }

    fn input_call(&self) -> InputPhoneCall {
        InputPhoneCall {
            id: self.id,
            access_hash: self.access_hash,
        }
    }

    fn view(&self) -> CallView {
        CallView {
            call_type: self.call_type,
            state: self.state,
            id: self.id,
            access_hash: self.access_hash,
            self_id: self.services.identity.user_id,
            peer_id: self.peer_id,
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            debug!(target: "Call", "Destroying call controller..");
            drop(controller);
            debug!(target: "Call", "Call controller destroyed.");
        }
    }
}

/// Call duration as reported in discard requests, saturating at `i32::MAX`.
fn whole_seconds(elapsed: Duration) -> i32 {
    i32::try_from(elapsed.as_secs()).unwrap_or(i32::MAX)
}

fn media_state_to_call_state(state: ControllerState) -> Option<CallState> {
    match state {
        ControllerState::WaitInit => Some(CallState::WaitingInit),
        ControllerState::WaitInitAck => Some(CallState::WaitingInitAck),
        ControllerState::Established => Some(CallState::Established),
        ControllerState::Failed => Some(CallState::Failed),
        ControllerState::Unknown(code) => {
            error!(target: "Call/Media", "Unexpected media state {code}");
            None
        }
    }
}
