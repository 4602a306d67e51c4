//! Mock collaborators for call tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::call::{Call, CallDelegate, CallServices, SessionIdentity};
use super::error::TransportError;
use super::key_exchange::{DhConfig, RANDOM_POWER_SIZE};
use super::loopback::default_dh_config;
use super::media::{
    ControllerState, Endpoint, MediaController, MediaEngine, MediaSessionParams, StateCallback,
};
use super::signaling::{SignalingRequest, SignalingResponse, UserId};
use super::state::CallType;
use super::transport::SignalingTransport;
use crate::config::CallConfig;

pub const ME: UserId = 100;
pub const PEER: UserId = 200;
pub const SEED: [u8; RANDOM_POWER_SIZE] = [0x42; RANDOM_POWER_SIZE];

pub fn dh_config() -> DhConfig {
    default_dh_config()
}

#[derive(Default)]
pub struct TestDelegate {
    pub finished: AtomicUsize,
    pub failed: AtomicUsize,
}

impl TestDelegate {
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

impl CallDelegate for TestDelegate {
    fn dh_config(&self) -> DhConfig {
        dh_config()
    }

    fn call_finished(&self, _call: &Call) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn call_failed(&self, _call: &Call) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

type Responder =
    dyn Fn(&SignalingRequest) -> Option<Result<SignalingResponse, TransportError>> + Send + Sync;

/// Records every request and answers through a responder closure.
/// A `None` answer leaves the request pending forever.
pub struct ScriptedTransport {
    pub requests: Mutex<Vec<SignalingRequest>>,
    responder: Box<Responder>,
}

impl ScriptedTransport {
    pub fn new(
        responder: impl Fn(&SignalingRequest) -> Option<Result<SignalingResponse, TransportError>>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    pub fn silent() -> Arc<Self> {
        Self::new(|_| None)
    }

    pub fn requests(&self) -> Vec<SignalingRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_names(&self) -> Vec<&'static str> {
        self.requests().iter().map(|r| r.name()).collect()
    }
}

#[async_trait]
impl SignalingTransport for ScriptedTransport {
    async fn request(
        &self,
        request: SignalingRequest,
    ) -> Result<SignalingResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        match (self.responder)(&request) {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

/// What the mock media engine observed for one session.
#[derive(Default)]
pub struct MockSession {
    pub fingerprint: u64,
    pub is_outgoing: bool,
    pub endpoints: Vec<Endpoint>,
    pub mute_calls: Mutex<Vec<bool>>,
    pub started: Mutex<bool>,
    pub connected: Mutex<bool>,
    pub destroyed: Mutex<bool>,
    pub debug_log: Mutex<String>,
    callback: Mutex<Option<StateCallback>>,
}

impl MockSession {
    /// Report a state from a foreign thread, as the real engine does.
    pub fn emit_from_thread(&self, state: ControllerState) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            std::thread::spawn(move || callback(state)).join().unwrap();
        }
    }

    pub fn mute_calls(&self) -> Vec<bool> {
        self.mute_calls.lock().unwrap().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MockMediaEngine {
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockMediaEngine {
    pub fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl MediaEngine for MockMediaEngine {
    fn create(&self, params: MediaSessionParams) -> Box<dyn MediaController> {
        let session = Arc::new(MockSession {
            fingerprint: params.key.fingerprint(),
            is_outgoing: params.is_outgoing,
            endpoints: params.endpoints,
            ..Default::default()
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Box::new(MockController { session })
    }
}

struct MockController {
    session: Arc<MockSession>,
}

impl MediaController for MockController {
    fn set_mute(&mut self, mute: bool) {
        self.session.mute_calls.lock().unwrap().push(mute);
    }

    fn set_state_callback(&mut self, callback: StateCallback) {
        *self.session.callback.lock().unwrap() = Some(callback);
    }

    fn start(&mut self) {
        *self.session.started.lock().unwrap() = true;
    }

    fn connect(&mut self) {
        *self.session.connected.lock().unwrap() = true;
    }

    fn preferred_relay_id(&self) -> i64 {
        self.session.endpoints.first().map(|e| e.id).unwrap_or(0)
    }

    fn debug_log(&self) -> String {
        self.session.debug_log.lock().unwrap().clone()
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        *self.session.destroyed.lock().unwrap() = true;
    }
}

/// A call wired to mocks, plus handles to inspect them.
pub struct Harness {
    pub call: Call,
    pub delegate: Arc<TestDelegate>,
    pub transport: Arc<ScriptedTransport>,
    pub media: Arc<MockMediaEngine>,
}

impl Harness {
    pub fn new(call_type: CallType, transport: Arc<ScriptedTransport>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let delegate = Arc::new(TestDelegate::default());
        let media = Arc::new(MockMediaEngine::default());
        let services = CallServices {
            identity: SessionIdentity { user_id: ME },
            delegate: delegate.clone(),
            transport: transport.clone(),
            media: media.clone(),
        };
        let call = Call::new(services, PEER, call_type, CallConfig::default());
        Self {
            call,
            delegate,
            transport,
            media,
        }
    }

    /// Wait for and handle exactly one queued event.
    pub async fn step(&mut self) {
        let event = self.call.next_event().await.unwrap();
        self.call.handle_event(event);
    }
}
