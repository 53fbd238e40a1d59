//! # Dialtone Call Service
//!
//! Call session orchestration for a single-line SIP softphone.
//!
//! This crate provides:
//! - A serialized session engine owning the one active call and the SIP account
//! - An adapter over an external SIP protocol engine ([`engine::ProtocolEngine`])
//! - A ringback scheduler for outgoing calls without early media
//! - A typed notification bus and interaction commands for the UI
//! - The middleware acknowledgment of inbound call deliveries
//!
//! ## Architecture
//!
//! The protocol engine itself (registration, transport, dialogs, media) is supplied by the
//! host. Its callbacks and the UI's commands are funneled into one event loop, which drives
//! the [`call::CallSession`] state machine and publishes
//! [`events::StatusNotification`]s. The engine terminates once the call ends or a fatal
//! failure occurs; `SERVICE_STOPPED` is always its last notification.

pub mod account;
pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod middleware;
pub mod ringback;
pub mod service;

pub use account::{AccountStore, JsonAccountStore, PhoneAccount, StaticAccountStore};
pub use call::{CallDirection, CallSession, CallState};
pub use config::{MiddlewareConfig, RingbackConfig, ServiceConfig, TransportConfig, TransportKind};
pub use engine::{CallHandle, EngineAdapter, ProtocolEngine};
pub use error::{EngineError, MiddlewareError, ServiceError, ServiceResult};
pub use events::{InteractionCommand, Notification, NotificationBus, StatusNotification, Subscription};
pub use middleware::{HttpMiddlewareClient, MiddlewareClient};
pub use ringback::{SilentTonePlayer, Tone, TonePlayer};
pub use service::{
    CallSnapshot, DialRequest, RunningService, ServiceHandle, ServiceSnapshot, SessionEngineBuilder,
    StartRequest, StopReason,
};

/// Version of the call service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
