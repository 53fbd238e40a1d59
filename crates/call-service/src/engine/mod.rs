//! Protocol engine boundary
//!
//! The SIP protocol engine (registration, transport, dialogs, media) is an external
//! capability. This module defines the low-level [`ProtocolEngine`] trait an engine binding
//! implements, the raw callbacks it emits, and the typed events the session engine consumes.
//!
//! ```text
//! ┌──────────────────────┐  EngineCallback   ┌───────────────┐  EngineEvent  ┌────────────────┐
//! │ ProtocolEngine impl  │ ────────────────► │ EngineAdapter │ ────────────► │ SessionEngine  │
//! │ (native SIP library) │ ◄──────────────── │  (adapter.rs) │ ◄──────────── │ (service/)     │
//! └──────────────────────┘    primitives     └───────────────┘   commands    └────────────────┘
//! ```

pub mod adapter;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::account::AccountRegistration;
use crate::config::TransportConfig;
use crate::error::EngineError;

pub use adapter::EngineAdapter;

/// SIP status codes the service hands to the engine
pub mod status {
    /// 180 Ringing, used to acknowledge an inbound offer
    pub const RINGING: u16 = 180;
    /// 183 Session Progress
    pub const SESSION_PROGRESS: u16 = 183;
    /// 200 OK, used to answer
    pub const OK: u16 = 200;
    /// 486 Busy Here, used to reject an offer while a call is active
    pub const BUSY_HERE: u16 = 486;
    /// 603 Decline, used to hang up and decline
    pub const DECLINE: u16 = 603;
}

/// Opaque engine handle of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle(pub i32);

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Engine handle of an audio media port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaHandle(pub u32);

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media#{}", self.0)
    }
}

/// INVITE session state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteState {
    Null,
    Calling,
    Incoming,
    Early,
    Connecting,
    Confirmed,
    Disconnected,
}

/// Media type of a call stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Status of a call media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaStatus {
    None,
    Active,
    LocalHold,
    RemoteHold,
    Error,
}

/// One media stream of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamInfo {
    /// Index of the stream within the call
    pub index: usize,
    pub kind: MediaKind,
    pub status: MediaStatus,
    /// Port to wire audio devices to
    pub media: MediaHandle,
}

impl MediaStreamInfo {
    /// Audio stream that carries sound in at least one direction
    pub fn is_usable_audio(&self) -> bool {
        self.kind == MediaKind::Audio
            && matches!(self.status, MediaStatus::Active | MediaStatus::RemoteHold)
    }
}

/// Snapshot of a call as read back from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub handle: CallHandle,
    pub state: InviteState,
    /// Last SIP status code seen on the INVITE session
    pub last_status: u16,
    pub remote_uri: String,
    pub media: Vec<MediaStreamInfo>,
}

/// Raw callbacks emitted by the protocol engine
///
/// Native callbacks carry only handles; the adapter reads call details back from the
/// engine when translating them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCallback {
    /// An inbound INVITE was received
    IncomingCall {
        handle: CallHandle,
        remote_uri: String,
        display_name: Option<String>,
    },
    /// The INVITE session state of a call changed
    CallStateChanged { handle: CallHandle },
    /// The media state of a call changed
    CallMediaChanged { handle: CallHandle },
    /// A REGISTER transaction completed
    RegistrationChanged {
        status: u16,
        reason: String,
        expires: u32,
    },
    /// The engine-side account object failed
    AccountFault { reason: String },
}

impl EngineCallback {
    /// Call handle the callback refers to, if any
    pub fn call_handle(&self) -> Option<CallHandle> {
        match self {
            Self::IncomingCall { handle, .. }
            | Self::CallStateChanged { handle }
            | Self::CallMediaChanged { handle } => Some(*handle),
            Self::RegistrationChanged { .. } | Self::AccountFault { .. } => None,
        }
    }
}

/// Sender half the engine uses to deliver its callbacks
pub type EngineCallbackSender = mpsc::UnboundedSender<EngineCallback>;

/// Receiver half consumed by the session engine
pub type EngineCallbackReceiver = mpsc::UnboundedReceiver<EngineCallback>;

/// Call state events delivered to the session engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStateEvent {
    /// Provisional response, remote side is ringing
    Ringing,
    /// Provisional response announcing early media
    EarlyMedia,
    /// Call was confirmed
    Connected,
    /// Call ended with the given last status code
    Disconnected { status: u16 },
    /// Call details could not be read back from the engine
    Invalid { reason: String },
}

/// Media state events delivered to the session engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaStateEvent {
    /// Audio devices are wired to the given media port
    ///
    /// `partial_failure` is set when another usable stream of the call could not be wired.
    Available {
        media: MediaHandle,
        partial_failure: Option<String>,
    },
    /// The call has no usable audio stream
    Unavailable,
    /// Audio was offered but the devices could not be wired
    Failed { reason: String },
}

/// Account registration events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Registered { expires: u32 },
    Unregistered,
    Failed { status: u16, reason: String },
    InvalidState { reason: String },
}

/// Identity of the remote party of an inbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParty {
    pub uri: String,
    pub display_name: Option<String>,
}

impl RemoteParty {
    /// User part of the remote URI (`sip:+31501234@host` -> `+31501234`)
    pub fn number(&self) -> String {
        let uri = self.uri.trim();
        let uri = uri
            .rsplit_once('<')
            .map(|(_, rest)| rest.trim_end_matches('>'))
            .unwrap_or(uri);
        let without_scheme = uri
            .strip_prefix("sips:")
            .or_else(|| uri.strip_prefix("sip:"))
            .or_else(|| uri.strip_prefix("tel:"))
            .unwrap_or(uri);
        let user = without_scheme
            .split_once('@')
            .map(|(user, _)| user)
            .unwrap_or(without_scheme);
        user.split(';').next().unwrap_or(user).to_string()
    }
}

/// Typed engine events, consumed by a single `match` in the session engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    IncomingCall { handle: CallHandle, remote: RemoteParty },
    CallState { handle: CallHandle, event: CallStateEvent },
    MediaState { handle: CallHandle, event: MediaStateEvent },
    Account(AccountEvent),
}

/// Low-level primitives of the external SIP protocol engine
///
/// Implementations wrap a native SIP library. Every primitive is fallible; the adapter
/// catches all failures so nothing escapes into the session engine unhandled.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Load the native library
    async fn load(&self) -> Result<(), EngineError>;

    /// Create, initialise and start the library with one transport
    ///
    /// The engine delivers all of its callbacks through `callbacks` from now on.
    async fn start(
        &self,
        transport: &TransportConfig,
        callbacks: EngineCallbackSender,
    ) -> Result<(), EngineError>;

    /// Create the account and start registering it
    async fn register(&self, account: &AccountRegistration) -> Result<(), EngineError>;

    /// Unregister and delete the account
    async fn unregister(&self) -> Result<(), EngineError>;

    /// Send an INVITE to `uri`
    async fn make_call(&self, uri: &str) -> Result<CallHandle, EngineError>;

    /// Respond to an inbound INVITE with `status`
    async fn answer(&self, handle: CallHandle, status: u16) -> Result<(), EngineError>;

    /// Terminate the call, using `status` when the call is not yet answered
    async fn hangup(&self, handle: CallHandle, status: u16) -> Result<(), EngineError>;

    /// Put the call on hold
    async fn set_hold(&self, handle: CallHandle) -> Result<(), EngineError>;

    /// Send a re-INVITE, optionally releasing hold
    async fn reinvite(&self, handle: CallHandle, unhold: bool) -> Result<(), EngineError>;

    /// Send DTMF digits
    async fn dial_dtmf(&self, handle: CallHandle, digits: &str) -> Result<(), EngineError>;

    /// Read back the current call details
    async fn call_info(&self, handle: CallHandle) -> Result<CallInfo, EngineError>;

    /// Adjust the receive level of one media stream of the call
    async fn adjust_rx_level(
        &self,
        handle: CallHandle,
        media_index: usize,
        level: f32,
    ) -> Result<(), EngineError>;

    /// Wire the capture and playback devices to a media port
    async fn connect_audio(&self, media: MediaHandle) -> Result<(), EngineError>;

    /// Destroy the library
    async fn shutdown(&self) -> Result<(), EngineError>;
}
