//! Adapter between the protocol engine and the session engine
//!
//! [`EngineAdapter`] exposes the call primitives the session engine works with (place,
//! answer, decline, hang up, hold toggle, DTMF, microphone level) on top of the low-level
//! [`ProtocolEngine`] trait, and translates raw [`EngineCallback`]s into typed
//! [`EngineEvent`]s.
//!
//! Translation reads the call back from the engine. A failure to do so never escapes:
//! it is reported as [`CallStateEvent::Invalid`]. Wiring audio devices to a call's media
//! is bounded by a timeout and guarded against panics; failures there become
//! [`MediaStateEvent::Failed`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use super::{
    status, AccountEvent, CallHandle, CallInfo, CallStateEvent, EngineCallback,
    EngineCallbackSender, EngineEvent, InviteState, MediaStateEvent, ProtocolEngine, RemoteParty,
};
use crate::account::{self, AccountRegistration};
use crate::config::TransportConfig;
use crate::error::EngineError;

/// Facade over a [`ProtocolEngine`]
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<dyn ProtocolEngine>,
    media_wiring_timeout: Duration,
}

impl std::fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("engine", &"<protocol engine>")
            .field("media_wiring_timeout", &self.media_wiring_timeout)
            .finish()
    }
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn ProtocolEngine>, media_wiring_timeout: Duration) -> Self {
        Self {
            engine,
            media_wiring_timeout,
        }
    }

    // ===== LIFECYCLE =====

    pub async fn load(&self) -> Result<(), EngineError> {
        self.engine.load().await
    }

    pub async fn start(
        &self,
        transport: &TransportConfig,
        callbacks: EngineCallbackSender,
    ) -> Result<(), EngineError> {
        tracing::debug!("Starting protocol engine on {:?} port {}", transport.kind, transport.port);
        self.engine.start(transport, callbacks).await
    }

    pub async fn register(&self, account: &AccountRegistration) -> Result<(), EngineError> {
        tracing::debug!("Registering {} at {}", account.identity_uri, account.registrar_uri);
        self.engine.register(account).await
    }

    pub async fn unregister(&self) -> Result<(), EngineError> {
        self.engine.unregister().await
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.engine.shutdown().await
    }

    // ===== CALL PRIMITIVES =====

    /// Place an outbound call to `peer_uri`
    pub async fn place_call(&self, peer_uri: &str) -> Result<CallHandle, EngineError> {
        self.engine.make_call(peer_uri).await
    }

    /// Acknowledge an inbound offer with 180 Ringing
    pub async fn ring(&self, handle: CallHandle) -> Result<(), EngineError> {
        self.engine.answer(handle, status::RINGING).await
    }

    /// Reject an inbound offer with 486 Busy Here
    pub async fn reject_busy(&self, handle: CallHandle) -> Result<(), EngineError> {
        self.engine.answer(handle, status::BUSY_HERE).await
    }

    /// Answer an inbound call
    pub async fn answer(&self, handle: CallHandle) -> Result<(), EngineError> {
        self.engine.answer(handle, status::OK).await
    }

    /// Decline an unanswered inbound call
    pub async fn decline(&self, handle: CallHandle) -> Result<(), EngineError> {
        self.engine.hangup(handle, status::DECLINE).await
    }

    /// Hang up the call
    pub async fn hangup(&self, handle: CallHandle) -> Result<(), EngineError> {
        self.engine.hangup(handle, status::DECLINE).await
    }

    /// Put the call on hold, or resume it when `on_hold` is set
    pub async fn toggle_hold(&self, handle: CallHandle, on_hold: bool) -> Result<(), EngineError> {
        if on_hold {
            self.engine.reinvite(handle, true).await
        } else {
            self.engine.set_hold(handle).await
        }
    }

    pub async fn send_dtmf(&self, handle: CallHandle, digits: &str) -> Result<(), EngineError> {
        self.engine.dial_dtmf(handle, digits).await
    }

    /// Read the call back from the engine
    pub async fn call_info(&self, handle: CallHandle) -> Result<CallInfo, EngineError> {
        self.engine.call_info(handle).await
    }

    /// Set the microphone level on every audio stream of the call
    pub async fn set_mic_level(&self, handle: CallHandle, level: i32) -> Result<(), EngineError> {
        let info = self.engine.call_info(handle).await?;
        for stream in info
            .media
            .iter()
            .filter(|stream| stream.kind == super::MediaKind::Audio)
        {
            self.engine
                .adjust_rx_level(handle, stream.index, level as f32)
                .await?;
        }
        Ok(())
    }

    // ===== CALLBACK TRANSLATION =====

    /// Translate a raw engine callback
    ///
    /// Returns `None` for engine transitions that have no session-level meaning.
    pub async fn translate(&self, callback: EngineCallback) -> Option<EngineEvent> {
        match callback {
            EngineCallback::IncomingCall {
                handle,
                remote_uri,
                display_name,
            } => Some(EngineEvent::IncomingCall {
                handle,
                remote: RemoteParty {
                    uri: remote_uri,
                    display_name,
                },
            }),
            EngineCallback::CallStateChanged { handle } => {
                let event = match self.engine.call_info(handle).await {
                    Ok(info) => classify_call_state(&info)?,
                    Err(e) => {
                        tracing::error!("Cannot read call info of {}: {}", handle, e);
                        CallStateEvent::Invalid {
                            reason: e.to_string(),
                        }
                    }
                };
                Some(EngineEvent::CallState { handle, event })
            }
            EngineCallback::CallMediaChanged { handle } => match self.engine.call_info(handle).await {
                Ok(info) => Some(EngineEvent::MediaState {
                    handle,
                    event: self.bind_media(&info).await,
                }),
                Err(e) => {
                    tracing::error!("Cannot read media of {}: {}", handle, e);
                    Some(EngineEvent::CallState {
                        handle,
                        event: CallStateEvent::Invalid {
                            reason: e.to_string(),
                        },
                    })
                }
            },
            EngineCallback::RegistrationChanged {
                status,
                reason,
                expires,
            } => Some(EngineEvent::Account(account::registration_event(
                status, &reason, expires,
            ))),
            EngineCallback::AccountFault { reason } => {
                Some(EngineEvent::Account(AccountEvent::InvalidState { reason }))
            }
        }
    }

    /// Wire the audio devices to every usable audio stream of the call
    ///
    /// A stream that fails to wire does not stop the others. The call has audio as soon
    /// as one stream is wired.
    async fn bind_media(&self, info: &CallInfo) -> MediaStateEvent {
        let mut bound = None;
        let mut failure = None;
        for stream in info.media.iter().filter(|stream| stream.is_usable_audio()) {
            let wiring = AssertUnwindSafe(self.engine.connect_audio(stream.media)).catch_unwind();
            let reason = match tokio::time::timeout(self.media_wiring_timeout, wiring).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!("Audio devices wired to {} of {}", stream.media, info.handle);
                    bound.get_or_insert(stream.media);
                    continue;
                }
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(_panic)) => format!("audio wiring of {} panicked", stream.media),
                Err(_elapsed) => EngineError::Timeout {
                    operation: "connect_audio".to_string(),
                }
                .to_string(),
            };
            tracing::warn!("Cannot wire {} of {}: {}", stream.media, info.handle, reason);
            failure.get_or_insert(reason);
        }

        match (bound, failure) {
            (Some(media), partial_failure) => MediaStateEvent::Available {
                media,
                partial_failure,
            },
            (None, Some(reason)) => MediaStateEvent::Failed { reason },
            (None, None) => MediaStateEvent::Unavailable,
        }
    }
}

/// Map the engine's INVITE state to a session-level call state event
pub fn classify_call_state(info: &CallInfo) -> Option<CallStateEvent> {
    match info.state {
        InviteState::Early if info.last_status == status::SESSION_PROGRESS => {
            Some(CallStateEvent::EarlyMedia)
        }
        InviteState::Early => Some(CallStateEvent::Ringing),
        InviteState::Confirmed => Some(CallStateEvent::Connected),
        InviteState::Disconnected => Some(CallStateEvent::Disconnected {
            status: info.last_status,
        }),
        InviteState::Null | InviteState::Calling | InviteState::Incoming | InviteState::Connecting => {
            None
        }
    }
}
