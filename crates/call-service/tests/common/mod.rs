//! Shared fixtures: a scripted protocol engine and a service harness

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use parking_lot::Mutex;
use tokio::time::Instant;

use dialtone_call_service::account::{AccountRegistration, PhoneAccount, StaticAccountStore};
use dialtone_call_service::config::TransportConfig;
use dialtone_call_service::engine::{
    CallHandle, CallInfo, EngineCallback, EngineCallbackSender, InviteState, MediaHandle,
    MediaKind, MediaStatus, MediaStreamInfo, ProtocolEngine,
};
use dialtone_call_service::events::{Notification, NotificationBus, StatusNotification, Subscription};
use dialtone_call_service::middleware::MiddlewareClient;
use dialtone_call_service::ringback::{Tone, TonePlayer};
use dialtone_call_service::service::{
    CallSnapshot, DialRequest, RunningService, ServiceHandle, ServiceSnapshot,
    SessionEngineBuilder, StartRequest, StopReason,
};
use dialtone_call_service::{EngineError, MiddlewareError, ServiceConfig};

pub const DOMAIN: &str = "sip.example.com";

pub fn test_account() -> PhoneAccount {
    PhoneAccount::new("129700042", "secret")
}

mock! {
    pub Middleware {}

    #[async_trait]
    impl MiddlewareClient for Middleware {
        async fn reply(&self, response_url: &str, token: &str) -> Result<(), MiddlewareError>;
    }
}

/// Middleware that accepts every reply
#[derive(Debug, Default)]
pub struct AcceptingMiddleware {
    pub replies: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MiddlewareClient for AcceptingMiddleware {
    async fn reply(&self, response_url: &str, token: &str) -> Result<(), MiddlewareError> {
        self.replies
            .lock()
            .push((response_url.to_string(), token.to_string()));
        Ok(())
    }
}

/// Tone player remembering when it played
#[derive(Debug, Default)]
pub struct RecordingTonePlayer {
    plays: Mutex<Vec<Instant>>,
}

impl RecordingTonePlayer {
    pub fn count(&self) -> usize {
        self.plays.lock().len()
    }

    pub fn plays(&self) -> Vec<Instant> {
        self.plays.lock().clone()
    }
}

impl TonePlayer for RecordingTonePlayer {
    fn play(&self, tone: Tone, _duration: Duration) -> Result<(), EngineError> {
        assert_eq!(tone, Tone::Ringback);
        self.plays.lock().push(Instant::now());
        Ok(())
    }
}

/// Scripted protocol engine
///
/// Every primitive is recorded in an operation log. Failures can be injected per
/// primitive name; they persist until cleared.
pub struct FakeEngine {
    ops: Mutex<Vec<String>>,
    callbacks: Mutex<Option<EngineCallbackSender>>,
    calls: Mutex<HashMap<CallHandle, CallInfo>>,
    failures: Mutex<HashMap<&'static str, EngineError>>,
    panicking_wiring: Mutex<HashSet<MediaHandle>>,
    wiring_delay: Mutex<Option<Duration>>,
    auto_register: AtomicBool,
    next_handle: AtomicI32,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            callbacks: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            panicking_wiring: Mutex::new(HashSet::new()),
            wiring_delay: Mutex::new(None),
            auto_register: AtomicBool::new(true),
            next_handle: AtomicI32::new(1),
        })
    }

    /// Do not complete registration on `register`
    pub fn without_auto_register(self: &Arc<Self>) -> Arc<Self> {
        self.auto_register.store(false, Ordering::SeqCst);
        self.clone()
    }

    pub fn fail(&self, op: &'static str, error: EngineError) {
        self.failures.lock().insert(op, error);
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.failures.lock().remove(op);
    }

    /// Make wiring of `media` panic
    pub fn panic_on_wiring(&self, media: MediaHandle) {
        self.panicking_wiring.lock().insert(media);
    }

    /// Make every audio wiring take `delay`
    pub fn slow_wiring(&self, delay: Duration) {
        *self.wiring_delay.lock() = Some(delay);
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    /// Number of recorded operations starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.ops.lock().iter().filter(|op| op.starts_with(prefix)).count()
    }

    pub fn has_op(&self, op: &str) -> bool {
        self.ops.lock().iter().any(|recorded| recorded == op)
    }

    pub fn emit(&self, callback: EngineCallback) {
        let callbacks = self.callbacks.lock();
        let sender = callbacks.as_ref().expect("engine not started");
        sender.send(callback).expect("session engine gone");
    }

    /// Deliver an inbound INVITE
    pub fn offer_incoming(&self, handle: CallHandle, remote_uri: &str, display_name: Option<&str>) {
        self.calls.lock().insert(
            handle,
            CallInfo {
                handle,
                state: InviteState::Incoming,
                last_status: 0,
                remote_uri: remote_uri.to_string(),
                media: Vec::new(),
            },
        );
        self.emit(EngineCallback::IncomingCall {
            handle,
            remote_uri: remote_uri.to_string(),
            display_name: display_name.map(str::to_string),
        });
    }

    /// Move the INVITE session of `handle` and report it
    pub fn set_call_state(&self, handle: CallHandle, state: InviteState, last_status: u16) {
        {
            let mut calls = self.calls.lock();
            let info = calls.entry(handle).or_insert_with(|| CallInfo {
                handle,
                state,
                last_status,
                remote_uri: String::new(),
                media: Vec::new(),
            });
            info.state = state;
            info.last_status = last_status;
        }
        self.emit(EngineCallback::CallStateChanged { handle });
    }

    /// Replace the media streams of `handle` and report it
    pub fn set_media(&self, handle: CallHandle, media: Vec<MediaStreamInfo>) {
        if let Some(info) = self.calls.lock().get_mut(&handle) {
            info.media = media;
        }
        self.emit(EngineCallback::CallMediaChanged { handle });
    }

    /// Forget the call so reading it back fails
    pub fn forget_call(&self, handle: CallHandle) {
        self.calls.lock().remove(&handle);
    }

    fn record(&self, op: &'static str, detail: String) -> Result<(), EngineError> {
        let entry = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, detail)
        };
        self.ops.lock().push(entry);
        match self.failures.lock().get(op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// An active audio stream at `index` using media port `10 + index`
pub fn active_audio(index: usize) -> MediaStreamInfo {
    MediaStreamInfo {
        index,
        kind: MediaKind::Audio,
        status: MediaStatus::Active,
        media: MediaHandle(10 + index as u32),
    }
}

#[async_trait]
impl ProtocolEngine for FakeEngine {
    async fn load(&self) -> Result<(), EngineError> {
        self.record("load", String::new())
    }

    async fn start(
        &self,
        transport: &TransportConfig,
        callbacks: EngineCallbackSender,
    ) -> Result<(), EngineError> {
        self.record("start", format!("{}", transport.port))?;
        *self.callbacks.lock() = Some(callbacks);
        Ok(())
    }

    async fn register(&self, account: &AccountRegistration) -> Result<(), EngineError> {
        self.record("register", account.identity_uri.clone())?;
        if self.auto_register.load(Ordering::SeqCst) {
            self.emit(EngineCallback::RegistrationChanged {
                status: 200,
                reason: "OK".to_string(),
                expires: 3600,
            });
        }
        Ok(())
    }

    async fn unregister(&self) -> Result<(), EngineError> {
        self.record("unregister", String::new())
    }

    async fn make_call(&self, uri: &str) -> Result<CallHandle, EngineError> {
        self.record("make_call", uri.to_string())?;
        let handle = CallHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.calls.lock().insert(
            handle,
            CallInfo {
                handle,
                state: InviteState::Calling,
                last_status: 0,
                remote_uri: uri.to_string(),
                media: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn answer(&self, handle: CallHandle, status: u16) -> Result<(), EngineError> {
        self.record("answer", format!("{} {}", handle, status))
    }

    async fn hangup(&self, handle: CallHandle, status: u16) -> Result<(), EngineError> {
        self.record("hangup", format!("{} {}", handle, status))
    }

    async fn set_hold(&self, handle: CallHandle) -> Result<(), EngineError> {
        self.record("set_hold", handle.to_string())
    }

    async fn reinvite(&self, handle: CallHandle, unhold: bool) -> Result<(), EngineError> {
        let flag = if unhold { "unhold" } else { "keep" };
        self.record("reinvite", format!("{} {}", handle, flag))
    }

    async fn dial_dtmf(&self, handle: CallHandle, digits: &str) -> Result<(), EngineError> {
        self.record("dial_dtmf", format!("{} {}", handle, digits))
    }

    async fn call_info(&self, handle: CallHandle) -> Result<CallInfo, EngineError> {
        if let Some(error) = self.failures.lock().get("call_info") {
            return Err(error.clone());
        }
        self.calls
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(EngineError::InvalidCallHandle { handle })
    }

    async fn adjust_rx_level(
        &self,
        handle: CallHandle,
        media_index: usize,
        level: f32,
    ) -> Result<(), EngineError> {
        self.record("adjust_rx_level", format!("{} {} {}", handle, media_index, level))
    }

    async fn connect_audio(&self, media: MediaHandle) -> Result<(), EngineError> {
        let delay = *self.wiring_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.panicking_wiring.lock().contains(&media) {
            panic!("sound device exploded");
        }
        self.record("connect_audio", media.to_string())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.record("shutdown", String::new())
    }
}

/// How to assemble the service under test
pub struct Setup {
    pub engine: Arc<FakeEngine>,
    account: Option<PhoneAccount>,
    config: ServiceConfig,
    start: Option<StartRequest>,
    middleware: Arc<dyn MiddlewareClient>,
}

impl Setup {
    pub fn new() -> Self {
        Self {
            engine: FakeEngine::new(),
            account: Some(test_account()),
            config: ServiceConfig::new(DOMAIN),
            start: None,
            middleware: Arc::new(AcceptingMiddleware::default()),
        }
    }

    pub fn without_account(mut self) -> Self {
        self.account = None;
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn start_request(mut self, start: StartRequest) -> Self {
        self.start = Some(start);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn MiddlewareClient>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn spawn(self) -> TestService {
        let bus = NotificationBus::new();
        let notifications = bus.subscribe();
        let tones = Arc::new(RecordingTonePlayer::default());

        let mut builder = SessionEngineBuilder::new()
            .config(self.config)
            .engine(self.engine.clone())
            .account_store(Arc::new(StaticAccountStore::new(self.account)))
            .tone_player(tones.clone())
            .middleware(self.middleware)
            .notification_bus(bus);
        if let Some(start) = self.start {
            builder = builder.start_request(start);
        }
        let service = builder.spawn().expect("service spawns");

        TestService {
            engine: self.engine,
            tones,
            handle: service.handle(),
            notifications,
            service,
        }
    }
}

/// Running service with its collaborators
pub struct TestService {
    pub engine: Arc<FakeEngine>,
    pub tones: Arc<RecordingTonePlayer>,
    pub handle: ServiceHandle,
    pub notifications: Subscription,
    service: RunningService,
}

impl TestService {
    /// Spawn with defaults and wait for the account to register
    pub async fn registered() -> Self {
        Setup::new().spawn().wait_registered().await
    }

    pub async fn wait_registered(self) -> Self {
        let snapshot = self.snapshot().await;
        assert_eq!(
            snapshot.registration,
            Some(dialtone_call_service::account::RegistrationState::Registered)
        );
        self
    }

    pub async fn snapshot(&self) -> ServiceSnapshot {
        self.handle.snapshot().await.expect("service is running")
    }

    /// Current call, after everything the engine reported so far was processed
    pub async fn call(&self) -> Option<CallSnapshot> {
        self.snapshot().await.call
    }

    /// Status notifications published so far
    pub fn statuses(&mut self) -> Vec<StatusNotification> {
        let mut statuses = Vec::new();
        while let Some(notification) = self.notifications.try_recv() {
            if let Some(status) = notification.status() {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Everything published so far, including call presentations
    pub fn notifications(&mut self) -> Vec<Notification> {
        let mut all = Vec::new();
        while let Some(notification) = self.notifications.try_recv() {
            all.push(notification);
        }
        all
    }

    /// Collect statuses until SERVICE_STOPPED and wait for the engine to finish
    pub async fn finish(mut self) -> (StopReason, Vec<StatusNotification>) {
        let mut statuses = Vec::new();
        let collect = async {
            while let Some(status) = self.notifications.next_status().await {
                statuses.push(status);
                if status == StatusNotification::ServiceStopped {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(30), collect)
            .await
            .expect("service stops");

        let Self { service, handle, .. } = self;
        drop(handle);
        let reason = service.join().await.expect("engine task completes");
        (reason, statuses)
    }

    /// Drop every service handle, keeping the engine and the subscription
    pub fn detach(self) -> (Arc<FakeEngine>, Subscription) {
        let Self {
            engine,
            handle,
            notifications,
            service,
            ..
        } = self;
        drop(handle);
        drop(service);
        (engine, notifications)
    }

    /// Place an outbound call and drive it to CONNECTED
    pub async fn connected_outgoing(&mut self) -> CallHandle {
        let handle = self
            .handle
            .place_call(DialRequest::new("+3199999999"))
            .await
            .expect("call placed");
        self.engine.set_call_state(handle, InviteState::Early, 180);
        self.engine.set_call_state(handle, InviteState::Confirmed, 200);
        let call = self.call().await.expect("call exists");
        assert_eq!(call.state, dialtone_call_service::CallState::Connected);
        self.statuses();
        handle
    }
}
