//! Session engine
//!
//! The session engine is a single serialized event loop that owns the current
//! [`CallSession`] and the [`AccountSession`]. Four sources feed it:
//!
//! 1. protocol engine callbacks
//! 2. middleware acknowledgment outcomes
//! 3. ringback timer ticks
//! 4. control messages from [`ServiceHandle`]s (interaction commands, dial requests)
//!
//! They are polled in that order, so everything the engine has already reported is
//! processed before the next control message, and a tick queued behind a state change
//! is judged against the new state. Handling one event is atomic with respect to
//! the call: no other event is looked at until its handler returns.
//!
//! Handlers return [`ControlFlow`]; a `Break` carries the [`StopReason`] and ends the loop.
//! Teardown then runs best-effort and `SERVICE_STOPPED` is always the last notification.

mod builder;
mod handlers;

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::account::{AccountSession, AccountStore, RegistrationState};
use crate::call::{CallDirection, CallSession, CallState};
use crate::config::ServiceConfig;
use crate::engine::{CallHandle, EngineAdapter, EngineCallbackReceiver, EngineCallbackSender};
use crate::error::{MiddlewareError, ServiceError, ServiceResult};
use crate::events::{InteractionCommand, NotificationBus, StatusNotification, Subscription};
use crate::middleware::MiddlewareClient;
use crate::ringback::{RingbackScheduler, RingbackTick, TonePlayer};

pub use builder::SessionEngineBuilder;

/// Outbound call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub number: String,
    pub display_name: Option<String>,
}

impl DialRequest {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Why the service was started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRequest {
    /// Deliver an inbound call announced by the middleware
    Incoming {
        /// Where to acknowledge readiness once registered
        response_url: String,
        /// One-time token of the announcement
        request_token: String,
        peer_number: Option<String>,
        display_name: Option<String>,
    },
    /// Place a call as soon as the account is registered
    Outgoing(DialRequest),
}

/// Why the session engine terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The call ended
    CallEnded,
    /// There is no stored account
    NoAccount,
    EngineLoadFailed,
    EngineStartFailed,
    RegistrationFailed,
    /// The middleware acknowledgment failed
    MiddlewareRejected,
    /// The call entered an invalid state
    InvalidCallState,
    /// [`ServiceHandle::stop`] was called
    Requested,
    /// Every service handle was dropped
    HandleDropped,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::CallEnded => "call ended",
            Self::NoAccount => "no account",
            Self::EngineLoadFailed => "engine could not be loaded",
            Self::EngineStartFailed => "engine could not be started",
            Self::RegistrationFailed => "registration failed",
            Self::MiddlewareRejected => "middleware acknowledgment failed",
            Self::InvalidCallState => "invalid call state",
            Self::Requested => "stop requested",
            Self::HandleDropped => "all handles dropped",
        };
        f.write_str(reason)
    }
}

/// Point-in-time view of the current call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub handle: CallHandle,
    pub direction: CallDirection,
    pub peer_number: String,
    pub peer_display_name: Option<String>,
    pub state: CallState,
    pub on_hold: bool,
    pub media_bound: bool,
    pub ringback_active: bool,
}

impl From<&CallSession> for CallSnapshot {
    fn from(call: &CallSession) -> Self {
        Self {
            handle: call.handle,
            direction: call.direction,
            peer_number: call.peer_number.clone(),
            peer_display_name: call.peer_display_name.clone(),
            state: call.state(),
            on_hold: call.is_on_hold(),
            media_bound: call.media_bound(),
            ringback_active: call.ringback_active(),
        }
    }
}

/// Point-in-time view of the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    /// `None` until the account session exists
    pub registration: Option<RegistrationState>,
    pub call: Option<CallSnapshot>,
}

#[derive(Debug)]
pub(crate) enum ControlMessage {
    Interaction(InteractionCommand),
    PlaceCall {
        request: DialRequest,
        reply: oneshot::Sender<ServiceResult<CallHandle>>,
    },
    Snapshot {
        reply: oneshot::Sender<ServiceSnapshot>,
    },
    Stop,
}

/// Clonable handle to a running session engine
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
    bus: NotificationBus,
}

impl ServiceHandle {
    /// Send an interaction command to the current call
    pub fn send(&self, command: InteractionCommand) -> ServiceResult<()> {
        self.control
            .send(ControlMessage::Interaction(command))
            .map_err(|_| ServiceError::ChannelClosed)
    }

    pub fn hold_toggle(&self) -> ServiceResult<()> {
        self.send(InteractionCommand::HoldToggle)
    }

    pub fn hang_up(&self) -> ServiceResult<()> {
        self.send(InteractionCommand::Hangup)
    }

    pub fn answer(&self) -> ServiceResult<()> {
        self.send(InteractionCommand::Answer)
    }

    pub fn decline(&self) -> ServiceResult<()> {
        self.send(InteractionCommand::Decline)
    }

    pub fn transfer(&self) -> ServiceResult<()> {
        self.send(InteractionCommand::Transfer)
    }

    pub fn dial_dtmf(&self, digit: impl Into<String>) -> ServiceResult<()> {
        self.send(InteractionCommand::DialDtmf {
            digit: digit.into(),
        })
    }

    pub fn set_mic_volume(&self, level: i32) -> ServiceResult<()> {
        self.send(InteractionCommand::SetMicVolume { level })
    }

    /// Place an outbound call
    ///
    /// Fails with [`ServiceError::Busy`] while a call exists and with
    /// [`ServiceError::NotRegistered`] before the account is registered.
    pub async fn place_call(&self, request: DialRequest) -> ServiceResult<CallHandle> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlMessage::PlaceCall { request, reply })
            .map_err(|_| ServiceError::ChannelClosed)?;
        rx.await.map_err(|_| ServiceError::ChannelClosed)?
    }

    /// Take a snapshot of the service
    ///
    /// The snapshot reflects every engine callback delivered before this call.
    pub async fn snapshot(&self) -> ServiceResult<ServiceSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlMessage::Snapshot { reply })
            .map_err(|_| ServiceError::ChannelClosed)?;
        rx.await.map_err(|_| ServiceError::ChannelClosed)
    }

    /// Ask the session engine to terminate
    pub fn stop(&self) -> ServiceResult<()> {
        self.control
            .send(ControlMessage::Stop)
            .map_err(|_| ServiceError::ChannelClosed)
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.control.is_closed()
    }
}

/// A spawned session engine
#[derive(Debug)]
pub struct RunningService {
    handle: ServiceHandle,
    task: JoinHandle<StopReason>,
}

impl RunningService {
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.handle.subscribe()
    }

    /// Wait for the session engine to terminate
    pub async fn join(self) -> ServiceResult<StopReason> {
        let reason = self.task.await?;
        Ok(reason)
    }
}

/// Receiving ends of everything the session engine consumes
pub(crate) struct Inbox {
    control: mpsc::UnboundedReceiver<ControlMessage>,
    callbacks: EngineCallbackReceiver,
    ticks: mpsc::UnboundedReceiver<RingbackTick>,
    acks: mpsc::UnboundedReceiver<Result<(), MiddlewareError>>,
}

impl Inbox {
    fn close(&mut self) {
        self.control.close();
        self.callbacks.close();
        self.ticks.close();
        self.acks.close();
    }
}

/// Everything the session engine is assembled from
pub(crate) struct EngineParts {
    pub config: ServiceConfig,
    pub adapter: EngineAdapter,
    pub account_store: Arc<dyn AccountStore>,
    pub tone_player: Arc<dyn TonePlayer>,
    pub middleware: Arc<dyn MiddlewareClient>,
    pub bus: NotificationBus,
    pub start_request: Option<StartRequest>,
}

/// Middleware acknowledgment owed once the account registers
#[derive(Debug)]
struct PendingAck {
    response_url: String,
    request_token: String,
}

/// Peer identity handed over with an inbound delivery request
#[derive(Debug, Default)]
struct PeerHint {
    number: Option<String>,
    display_name: Option<String>,
}

pub(crate) struct SessionEngine {
    config: ServiceConfig,
    adapter: EngineAdapter,
    account_store: Arc<dyn AccountStore>,
    tone_player: Arc<dyn TonePlayer>,
    middleware: Arc<dyn MiddlewareClient>,
    bus: NotificationBus,
    ringback: RingbackScheduler,
    acks: mpsc::UnboundedSender<Result<(), MiddlewareError>>,
    callbacks: Option<EngineCallbackSender>,

    pending_ack: Option<PendingAck>,
    pending_dial: Option<DialRequest>,
    peer_hint: Option<PeerHint>,

    engine_loaded: bool,
    account: Option<AccountSession>,
    call: Option<CallSession>,
}

impl SessionEngine {
    pub(crate) fn new(
        parts: EngineParts,
        control: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> ServiceResult<(Self, Inbox)> {
        let (callback_tx, callbacks) = mpsc::unbounded_channel();
        let (tick_tx, ticks) = mpsc::unbounded_channel();
        let (ack_tx, acks) = mpsc::unbounded_channel();

        let (pending_ack, pending_dial, peer_hint) = match parts.start_request {
            Some(StartRequest::Incoming {
                response_url,
                request_token,
                peer_number,
                display_name,
            }) => (
                Some(PendingAck {
                    response_url,
                    request_token,
                }),
                None,
                Some(PeerHint {
                    number: peer_number,
                    display_name,
                }),
            ),
            Some(StartRequest::Outgoing(dial)) => (None, Some(dial), None),
            None => (None, None, None),
        };

        let ringback = RingbackScheduler::new(parts.config.ringback.clone(), tick_tx)?;
        let engine = Self {
            ringback,
            config: parts.config,
            adapter: parts.adapter,
            account_store: parts.account_store,
            tone_player: parts.tone_player,
            middleware: parts.middleware,
            bus: parts.bus,
            acks: ack_tx,
            callbacks: Some(callback_tx),
            pending_ack,
            pending_dial,
            peer_hint,
            engine_loaded: false,
            account: None,
            call: None,
        };
        let inbox = Inbox {
            control,
            callbacks,
            ticks,
            acks,
        };
        Ok((engine, inbox))
    }

    /// Bring the engine up, process events until a handler stops, then tear down
    pub(crate) async fn run(mut self, mut inbox: Inbox) -> StopReason {
        tracing::info!("Session engine starting");

        let reason = match self.bring_up().await {
            ControlFlow::Break(reason) => reason,
            ControlFlow::Continue(()) => self.event_loop(&mut inbox).await,
        };

        tracing::info!("Session engine stopping: {}", reason);
        inbox.close();
        self.teardown().await;
        reason
    }

    async fn event_loop(&mut self, inbox: &mut Inbox) -> StopReason {
        loop {
            let flow = tokio::select! {
                biased;

                Some(callback) = inbox.callbacks.recv() => self.on_callback(callback).await,
                Some(outcome) = inbox.acks.recv() => self.on_middleware_reply(outcome),
                Some(tick) = inbox.ticks.recv() => self.on_ringback_tick(tick),
                message = inbox.control.recv() => match message {
                    Some(message) => self.on_control(message).await,
                    None => {
                        tracing::info!("All service handles dropped");
                        ControlFlow::Break(StopReason::HandleDropped)
                    }
                },
            };

            if let ControlFlow::Break(reason) = flow {
                return reason;
            }
        }
    }

    async fn on_control(&mut self, message: ControlMessage) -> ControlFlow<StopReason> {
        match message {
            ControlMessage::Interaction(command) => self.handle_interaction(command).await,
            ControlMessage::PlaceCall { request, reply } => {
                let result = self.place_call(request).await;
                let flow = self.dial_outcome(&result);
                if reply.send(result).is_err() {
                    tracing::debug!("Dial requester went away");
                }
                flow
            }
            ControlMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                ControlFlow::Continue(())
            }
            ControlMessage::Stop => ControlFlow::Break(StopReason::Requested),
        }
    }

    fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            registration: self.account.as_ref().map(|account| account.state),
            call: self.call.as_ref().map(CallSnapshot::from),
        }
    }

    fn publish(&self, status: StatusNotification) {
        self.bus.publish(status);
    }

    /// Release everything in order, each step independent of the others
    async fn teardown(&mut self) {
        if let Some(mut call) = self.call.take() {
            if !call.state().is_terminal() {
                match self.adapter.hangup(call.handle).await {
                    Ok(()) => self.publish(StatusNotification::CallDisconnected),
                    Err(e) => tracing::warn!("Failed to hang up {} during teardown: {}", call.handle, e),
                }
            }
            call.mark_disconnected();
        }

        if self.account.take().is_some() {
            if let Err(e) = self.adapter.unregister().await {
                tracing::warn!("Failed to unregister account: {}", e);
            }
        }

        if self.engine_loaded {
            self.engine_loaded = false;
            if let Err(e) = self.adapter.shutdown().await {
                tracing::warn!("Failed to shut down protocol engine: {}", e);
            }
        }

        self.publish(StatusNotification::ServiceStopped);
        tracing::info!("Session engine stopped");
    }
}

pub(crate) fn spawn(
    engine: SessionEngine,
    inbox: Inbox,
    bus: NotificationBus,
    control: mpsc::UnboundedSender<ControlMessage>,
) -> RunningService {
    let task = tokio::spawn(engine.run(inbox));
    RunningService {
        handle: ServiceHandle { control, bus },
        task,
    }
}
