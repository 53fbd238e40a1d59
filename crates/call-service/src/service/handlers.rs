//! Event handlers of the session engine

use std::ops::ControlFlow;

use super::{DialRequest, PendingAck, SessionEngine, StopReason};
use crate::account::{self, AccountRegistration, AccountSession, RegistrationState};
use crate::call::{CallDirection, CallSession, HoldAction};
use crate::engine::{
    AccountEvent, CallHandle, CallStateEvent, EngineCallback, EngineEvent, MediaStateEvent,
    RemoteParty,
};
use crate::error::{EngineError, MiddlewareError, ServiceError, ServiceResult};
use crate::events::{is_valid_dtmf, CallPresentation, InteractionCommand, Notification, StatusNotification};
use crate::ringback::{RingbackTick, Tone};

type Flow = ControlFlow<StopReason>;

const CONTINUE: Flow = ControlFlow::Continue(());

impl SessionEngine {
    // ===== BRING-UP =====

    /// Load and start the protocol engine, then start registering the stored account
    pub(super) async fn bring_up(&mut self) -> Flow {
        if let Err(e) = self.adapter.load().await {
            tracing::error!("Cannot load protocol engine: {}", e);
            self.publish(StatusNotification::SipServiceCanNotLoadEngine);
            return ControlFlow::Break(StopReason::EngineLoadFailed);
        }
        self.engine_loaded = true;

        let stored = match self.account_store.load() {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::warn!("No SIP account configured");
                self.publish(StatusNotification::SipServiceHasNoAccount);
                return ControlFlow::Break(StopReason::NoAccount);
            }
            Err(e) => {
                tracing::error!("Cannot read the stored SIP account: {}", e);
                self.publish(StatusNotification::SipServiceHasNoAccount);
                return ControlFlow::Break(StopReason::NoAccount);
            }
        };

        let Some(callbacks) = self.callbacks.take() else {
            tracing::error!("Protocol engine callbacks already handed out");
            self.publish(StatusNotification::SipServiceCanNotStartEngine);
            return ControlFlow::Break(StopReason::EngineStartFailed);
        };
        if let Err(e) = self.adapter.start(&self.config.transport, callbacks).await {
            tracing::error!("Cannot start protocol engine: {}", e);
            self.publish(StatusNotification::SipServiceCanNotStartEngine);
            return ControlFlow::Break(StopReason::EngineStartFailed);
        }

        let registration = AccountRegistration::from_account(&stored, &self.config.sip_domain);
        let mut session = AccountSession::new(registration);
        if let Err(e) = self.adapter.register(&session.registration).await {
            tracing::error!("Cannot register {}: {}", session.registration.identity_uri, e);
            self.publish(StatusNotification::SipServiceAccountRegistrationFailed);
            return ControlFlow::Break(StopReason::RegistrationFailed);
        }
        session.state = RegistrationState::Registering;
        tracing::info!("Registering {}", session.registration.identity_uri);
        self.account = Some(session);

        CONTINUE
    }

    // ===== ENGINE CALLBACKS =====

    pub(super) async fn on_callback(&mut self, callback: EngineCallback) -> Flow {
        if let EngineCallback::CallStateChanged { handle } | EngineCallback::CallMediaChanged { handle } =
            &callback
        {
            if !self.is_current_call(*handle) {
                tracing::debug!("Ignoring callback for {} which is not the current call", handle);
                return CONTINUE;
            }
        }

        match self.adapter.translate(callback).await {
            Some(event) => self.handle_engine_event(event).await,
            None => CONTINUE,
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) -> Flow {
        tracing::debug!("Engine event: {:?}", event);
        match event {
            EngineEvent::IncomingCall { handle, remote } => self.on_incoming_call(handle, remote).await,
            EngineEvent::CallState { handle, event } => self.on_call_state(handle, event),
            EngineEvent::MediaState { handle, event } => self.on_media_state(handle, event),
            EngineEvent::Account(event) => self.on_account_event(event).await,
        }
    }

    fn is_current_call(&self, handle: CallHandle) -> bool {
        self.call.as_ref().is_some_and(|call| call.handle == handle)
    }

    async fn on_incoming_call(&mut self, handle: CallHandle, remote: RemoteParty) -> Flow {
        if let Some(active) = &self.call {
            tracing::info!("Rejecting {} from {}: {} is in progress", handle, remote.uri, active.handle);
            if let Err(e) = self.adapter.reject_busy(handle).await {
                tracing::warn!("Failed to reject {} as busy: {}", handle, e);
            }
            return CONTINUE;
        }

        let hint = self.peer_hint.take().unwrap_or_default();
        let number = hint.number.unwrap_or_else(|| remote.number());
        let display_name = hint.display_name.or_else(|| remote.display_name.clone());

        if let Err(e) = self.adapter.ring(handle).await {
            tracing::error!("Failed to ring inbound {}: {}", handle, e);
            self.publish(StatusNotification::CallInvalidState);
            return ControlFlow::Break(StopReason::InvalidCallState);
        }

        tracing::info!("Inbound call {} from {}", handle, number);
        let call = CallSession::offered(handle, number, display_name);
        self.present(&call, remote.uri);
        self.call = Some(call);
        CONTINUE
    }

    fn on_call_state(&mut self, handle: CallHandle, event: CallStateEvent) -> Flow {
        let Some(call) = self.call.as_mut() else {
            return CONTINUE;
        };

        match event {
            CallStateEvent::Ringing | CallStateEvent::EarlyMedia => {
                if call.enter_early() {
                    tracing::debug!("{} is early", handle);
                }
                call.sync_ringback(&self.ringback);
                CONTINUE
            }
            CallStateEvent::Connected => {
                let first = call.mark_connected();
                call.sync_ringback(&self.ringback);
                if first {
                    tracing::info!("{} connected", handle);
                    self.publish(StatusNotification::CallConnected);
                }
                CONTINUE
            }
            CallStateEvent::Disconnected { status } => {
                tracing::info!("{} disconnected with status {}", handle, status);
                self.end_call()
            }
            CallStateEvent::Invalid { reason } => {
                tracing::error!("{} is in an invalid state: {}", handle, reason);
                self.invalidate_call()
            }
        }
    }

    fn on_media_state(&mut self, handle: CallHandle, event: MediaStateEvent) -> Flow {
        let Some(call) = self.call.as_mut() else {
            return CONTINUE;
        };

        match event {
            MediaStateEvent::Available {
                media,
                partial_failure,
            } => {
                call.bind_media(media);
                call.sync_ringback(&self.ringback);
                tracing::info!("{} has audio on {}", handle, media);
                self.publish(StatusNotification::CallMediaAvailable);
                if let Some(reason) = partial_failure {
                    tracing::warn!("Part of the audio of {} could not be wired: {}", handle, reason);
                    self.publish(StatusNotification::CallMediaFailed);
                }
            }
            MediaStateEvent::Unavailable => {
                call.unbind_media();
                call.sync_ringback(&self.ringback);
            }
            MediaStateEvent::Failed { reason } => {
                tracing::warn!("Audio of {} could not be wired: {}", handle, reason);
                self.publish(StatusNotification::CallMediaFailed);
            }
        }
        CONTINUE
    }

    async fn on_account_event(&mut self, event: AccountEvent) -> Flow {
        let Some(account) = self.account.as_mut() else {
            tracing::debug!("Ignoring account event without an account session: {:?}", event);
            return CONTINUE;
        };
        let registered_now = account.apply(&event);

        match event {
            AccountEvent::Registered { expires } => {
                tracing::info!("{} registered for {}s", account.registration.identity_uri, expires);
                if registered_now {
                    return self.on_registered().await;
                }
                CONTINUE
            }
            AccountEvent::Unregistered => {
                tracing::info!("{} unregistered", account.registration.identity_uri);
                CONTINUE
            }
            AccountEvent::Failed { status, reason } => {
                tracing::warn!("Registration failed with {} {}", status, reason);
                self.registration_lost()
            }
            AccountEvent::InvalidState { reason } => {
                tracing::warn!("Account is in an invalid state: {}", reason);
                self.registration_lost()
            }
        }
    }

    fn registration_lost(&mut self) -> Flow {
        if self.config.terminate_on_registration_failure {
            self.publish(StatusNotification::SipServiceAccountRegistrationFailed);
            return ControlFlow::Break(StopReason::RegistrationFailed);
        }
        CONTINUE
    }

    async fn on_registered(&mut self) -> Flow {
        if let Some(ack) = self.pending_ack.take() {
            self.acknowledge(ack);
        }

        if let Some(request) = self.pending_dial.take() {
            let result = self.place_call(request).await;
            if let Err(e) = &result {
                tracing::warn!("Requested call could not be placed: {}", e);
            }
            return self.dial_outcome(&result);
        }
        CONTINUE
    }

    /// Tell the middleware the device is ready; the outcome comes back as an event
    fn acknowledge(&self, ack: PendingAck) {
        let middleware = self.middleware.clone();
        let outcomes = self.acks.clone();
        tracing::debug!("Acknowledging inbound delivery to {}", ack.response_url);
        tokio::spawn(async move {
            let outcome = middleware.reply(&ack.response_url, &ack.request_token).await;
            let _ = outcomes.send(outcome);
        });
    }

    pub(super) fn on_middleware_reply(&mut self, outcome: Result<(), MiddlewareError>) -> Flow {
        match outcome {
            Ok(()) => {
                tracing::info!("Middleware acknowledged inbound delivery");
                CONTINUE
            }
            Err(e) => {
                tracing::error!("Middleware acknowledgment failed: {}", e);
                self.publish(StatusNotification::SipServiceAccountRegistrationFailed);
                ControlFlow::Break(StopReason::MiddlewareRejected)
            }
        }
    }

    // ===== RINGBACK =====

    pub(super) fn on_ringback_tick(&mut self, tick: RingbackTick) -> Flow {
        let owned = self
            .call
            .as_ref()
            .is_some_and(|call| call.owns_ringback_tick(tick.generation));
        if !owned {
            tracing::trace!("Dropping stale ringback tick {}", tick.generation);
            return CONTINUE;
        }

        let duration = self.ringback.config().tone_duration;
        if let Err(e) = self.tone_player.play(Tone::Ringback, duration) {
            tracing::warn!("Failed to play ringback: {}", e);
        }
        CONTINUE
    }

    // ===== OUTBOUND CALLS =====

    pub(super) async fn place_call(&mut self, request: DialRequest) -> ServiceResult<CallHandle> {
        if let Some(active) = &self.call {
            tracing::info!("Rejecting call to {}: {} is in progress", request.number, active.handle);
            return Err(ServiceError::Busy {
                active: active.handle,
            });
        }
        if !self.account.as_ref().is_some_and(AccountSession::is_registered) {
            return Err(ServiceError::NotRegistered);
        }

        let peer_uri = account::sip_uri(&request.number, &self.config.sip_domain);
        let handle = self.adapter.place_call(&peer_uri).await?;

        tracing::info!("Dialing {} as {}", peer_uri, handle);
        let call = CallSession::dialing(handle, request.number, request.display_name);
        self.present(&call, peer_uri);
        self.call = Some(call);
        Ok(handle)
    }

    /// Engine failures while dialing are fatal; rejections are not
    pub(super) fn dial_outcome(&self, result: &ServiceResult<CallHandle>) -> Flow {
        match result {
            Err(ServiceError::Engine(e)) => {
                tracing::error!("Protocol engine could not place the call: {}", e);
                self.publish(StatusNotification::CallInvalidState);
                ControlFlow::Break(StopReason::InvalidCallState)
            }
            _ => CONTINUE,
        }
    }

    // ===== INTERACTIONS =====

    pub(super) async fn handle_interaction(&mut self, command: InteractionCommand) -> Flow {
        let Some(call) = self.call.as_ref() else {
            tracing::debug!("Ignoring {}: no current call", command.name());
            return CONTINUE;
        };
        if call.state().is_terminal() {
            tracing::debug!("Ignoring {}: call has ended", command.name());
            return CONTINUE;
        }
        let handle = call.handle;
        tracing::debug!("Handling {} for {}", command.name(), handle);

        match command {
            InteractionCommand::HoldToggle => self.toggle_hold(handle).await,
            InteractionCommand::Hangup => {
                let result = self.adapter.hangup(handle).await;
                self.local_hangup(handle, result)
            }
            InteractionCommand::Decline => {
                if !call.can_answer() {
                    tracing::debug!("Ignoring decline: {} is not an unanswered inbound call", handle);
                    return CONTINUE;
                }
                let result = self.adapter.decline(handle).await;
                self.local_hangup(handle, result)
            }
            InteractionCommand::Answer => self.answer(handle).await,
            InteractionCommand::Transfer => {
                tracing::info!("Transfer of {} requested but not supported", handle);
                CONTINUE
            }
            InteractionCommand::DialDtmf { digit } => self.dial_dtmf(handle, &digit).await,
            InteractionCommand::SetMicVolume { level } => self.set_mic_volume(handle, level).await,
        }
    }

    async fn toggle_hold(&mut self, handle: CallHandle) -> Flow {
        let Some(action) = self.call.as_mut().and_then(CallSession::toggle_hold) else {
            tracing::debug!("Ignoring hold toggle: {} is not established", handle);
            return CONTINUE;
        };

        if let Err(e) = self
            .adapter
            .toggle_hold(handle, action == HoldAction::Resume)
            .await
        {
            tracing::warn!("{:?} of {} failed: {}", action, handle, e);
            self.publish(StatusNotification::CallPutOnHoldFailed);
        }
        CONTINUE
    }

    async fn answer(&mut self, handle: CallHandle) -> Flow {
        if !self.call.as_ref().is_some_and(CallSession::can_answer) {
            tracing::debug!("Ignoring answer: {} cannot be answered", handle);
            return CONTINUE;
        }

        match self.adapter.answer(handle).await {
            Ok(()) => {
                if let Some(call) = self.call.as_mut() {
                    call.mark_answered();
                }
                tracing::info!("Answered {}", handle);
                CONTINUE
            }
            Err(e) => {
                tracing::error!("Failed to answer {}: {}", handle, e);
                self.invalidate_call()
            }
        }
    }

    fn local_hangup(&mut self, handle: CallHandle, result: Result<(), EngineError>) -> Flow {
        match result {
            Ok(()) => {
                tracing::info!("Hung up {}", handle);
                self.end_call()
            }
            Err(e) => {
                tracing::error!("Failed to hang up {}: {}", handle, e);
                self.invalidate_call()
            }
        }
    }

    async fn dial_dtmf(&mut self, handle: CallHandle, digits: &str) -> Flow {
        if !is_valid_dtmf(digits) {
            tracing::warn!("Ignoring invalid DTMF {:?}", digits);
            return CONTINUE;
        }
        if !self.accepts_media_commands() {
            return self.skip_unestablished(handle, "DTMF").await;
        }

        match self.adapter.send_dtmf(handle, digits).await {
            Ok(()) => CONTINUE,
            Err(e) if e.is_stale_handle() => {
                tracing::error!("DTMF on stale {}: {}", handle, e);
                self.invalidate_call()
            }
            Err(e) => {
                tracing::warn!("Failed to send DTMF on {}: {}", handle, e);
                CONTINUE
            }
        }
    }

    async fn set_mic_volume(&mut self, handle: CallHandle, level: i32) -> Flow {
        if !self.accepts_media_commands() {
            return self.skip_unestablished(handle, "microphone volume").await;
        }

        match self.adapter.set_mic_level(handle, level).await {
            Ok(()) => CONTINUE,
            Err(e) if e.is_stale_handle() => {
                tracing::error!("Microphone volume on stale {}: {}", handle, e);
                self.invalidate_call()
            }
            Err(e) => {
                tracing::warn!("Failed to set microphone volume of {}: {}", handle, e);
                self.publish(StatusNotification::CallUpdateMicrophoneVolumeFailed);
                CONTINUE
            }
        }
    }

    /// Drop a media command for a call that is not established yet
    ///
    /// The handle is still read back, so a call the engine already forgot is invalidated.
    async fn skip_unestablished(&mut self, handle: CallHandle, command: &str) -> Flow {
        match self.adapter.call_info(handle).await {
            Ok(_) => {
                tracing::debug!("Ignoring {}: {} is not established", command, handle);
                CONTINUE
            }
            Err(e) if e.is_stale_handle() => {
                tracing::error!("{} on stale {}: {}", command, handle, e);
                self.invalidate_call()
            }
            Err(e) => {
                tracing::debug!("Ignoring {}: {} is not established ({})", command, handle, e);
                CONTINUE
            }
        }
    }

    fn accepts_media_commands(&self) -> bool {
        self.call
            .as_ref()
            .is_some_and(|call| call.state().accepts_media_commands())
    }

    // ===== CALL RELEASE =====

    fn end_call(&mut self) -> Flow {
        self.release_call();
        self.publish(StatusNotification::CallDisconnected);
        ControlFlow::Break(StopReason::CallEnded)
    }

    fn invalidate_call(&mut self) -> Flow {
        self.release_call();
        self.publish(StatusNotification::CallInvalidState);
        ControlFlow::Break(StopReason::InvalidCallState)
    }

    fn release_call(&mut self) {
        if let Some(mut call) = self.call.take() {
            call.mark_disconnected();
        }
    }

    fn present(&self, call: &CallSession, peer_uri: String) {
        let presentation = CallPresentation {
            direction: call.direction,
            peer_uri,
            peer_number: call.peer_number.clone(),
            peer_display_name: call.peer_display_name.clone(),
        };
        if call.direction == CallDirection::Incoming {
            tracing::debug!("Surfacing inbound call from {}", presentation.peer_number);
        }
        self.bus.publish(Notification::CallVisible(presentation));
    }
}
