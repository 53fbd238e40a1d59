//! Notification and interaction bus
//!
//! The UI and the registration collaborator talk to the session engine through two typed
//! channels:
//!
//! - **Interaction** (inbound): [`InteractionCommand`]s addressed to the current call
//! - **Notification** (outbound): [`Notification`]s broadcast to every subscriber
//!
//! Every subscriber owns an unbounded queue, so no notification is dropped for a slow
//! subscriber and each one observes the emission order.
//!
//! ```rust
//! use dialtone_call_service::events::{Notification, NotificationBus, StatusNotification};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = NotificationBus::new();
//! let mut ui = bus.subscribe();
//!
//! bus.publish(StatusNotification::CallConnected);
//!
//! assert_eq!(
//!     ui.recv().await,
//!     Some(Notification::Status(StatusNotification::CallConnected))
//! );
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::call::CallDirection;

/// Status notifications, a fixed vocabulary shared with the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusNotification {
    SipServiceHasNoAccount,
    SipServiceCanNotLoadEngine,
    SipServiceCanNotStartEngine,
    SipServiceAccountRegistrationFailed,
    CallConnected,
    CallDisconnected,
    CallInvalidState,
    CallMediaAvailable,
    CallMediaFailed,
    CallPutOnHoldFailed,
    CallUpdateMicrophoneVolumeFailed,
    ServiceStopped,
}

impl StatusNotification {
    /// Wire name of the notification
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SipServiceHasNoAccount => "SIP_SERVICE_HAS_NO_ACCOUNT",
            Self::SipServiceCanNotLoadEngine => "SIP_SERVICE_CAN_NOT_LOAD_ENGINE",
            Self::SipServiceCanNotStartEngine => "SIP_SERVICE_CAN_NOT_START_ENGINE",
            Self::SipServiceAccountRegistrationFailed => "SIP_SERVICE_ACCOUNT_REGISTRATION_FAILED",
            Self::CallConnected => "CALL_CONNECTED",
            Self::CallDisconnected => "CALL_DISCONNECTED",
            Self::CallInvalidState => "CALL_INVALID_STATE",
            Self::CallMediaAvailable => "CALL_MEDIA_AVAILABLE",
            Self::CallMediaFailed => "CALL_MEDIA_FAILED",
            Self::CallPutOnHoldFailed => "CALL_PUT_ON_HOLD_FAILED",
            Self::CallUpdateMicrophoneVolumeFailed => "CALL_UPDATE_MICROPHONE_VOLUME_FAILED",
            Self::ServiceStopped => "SERVICE_STOPPED",
        }
    }
}

impl fmt::Display for StatusNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the UI needs to show a call screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPresentation {
    pub direction: CallDirection,
    /// URI of the peer (`sip:<number>@<domain>`)
    pub peer_uri: String,
    pub peer_number: String,
    pub peer_display_name: Option<String>,
}

/// Everything published on the notification bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    /// A session or account transition
    Status(StatusNotification),
    /// A call should be made visible to the user
    CallVisible(CallPresentation),
}

impl Notification {
    /// The status carried by this notification, if any
    pub fn status(&self) -> Option<StatusNotification> {
        match self {
            Self::Status(status) => Some(*status),
            Self::CallVisible(_) => None,
        }
    }
}

impl From<StatusNotification> for Notification {
    fn from(status: StatusNotification) -> Self {
        Self::Status(status)
    }
}

/// Commands the UI issues against the current call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionCommand {
    HoldToggle,
    Hangup,
    Answer,
    Decline,
    Transfer,
    DialDtmf { digit: String },
    SetMicVolume { level: i32 },
}

impl InteractionCommand {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::HoldToggle => "hold_toggle",
            Self::Hangup => "hangup",
            Self::Answer => "answer",
            Self::Decline => "decline",
            Self::Transfer => "transfer",
            Self::DialDtmf { .. } => "dial_dtmf",
            Self::SetMicVolume { .. } => "set_mic_volume",
        }
    }
}

/// Whether `digits` only contains DTMF keypad symbols
pub fn is_valid_dtmf(digits: &str) -> bool {
    !digits.is_empty()
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D'))
}

/// Broadcast bus for [`Notification`]s with an explicit subscriber list
#[derive(Clone, Default)]
pub struct NotificationBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    ///
    /// The subscriber receives every notification published after this call.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }

    /// Deliver a notification to every live subscriber
    pub fn publish(&self, notification: impl Into<Notification>) {
        let notification = notification.into();
        tracing::debug!("Publishing notification {:?}", notification);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Receiving end of a bus subscription
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    /// Wait for the next notification
    ///
    /// Returns `None` once the bus is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Take a notification without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next status notification, skipping call presentations
    pub async fn next_status(&mut self) -> Option<StatusNotification> {
        while let Some(notification) = self.rx.recv().await {
            if let Some(status) = notification.status() {
                return Some(status);
            }
        }
        None
    }

    /// Turn the subscription into a `Stream`
    pub fn into_stream(self) -> UnboundedReceiverStream<Notification> {
        UnboundedReceiverStream::new(self.rx)
    }
}
