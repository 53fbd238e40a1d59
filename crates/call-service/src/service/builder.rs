//! Builder for the session engine
//!
//! [`SessionEngineBuilder`] assembles the collaborators of a session engine and spawns it
//! on the current tokio runtime.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dialtone_call_service::account::JsonAccountStore;
//! use dialtone_call_service::engine::ProtocolEngine;
//! use dialtone_call_service::events::NotificationBus;
//! use dialtone_call_service::service::{DialRequest, SessionEngineBuilder, StartRequest};
//! use dialtone_call_service::ServiceConfig;
//!
//! # async fn run(engine: Arc<dyn ProtocolEngine>) -> dialtone_call_service::ServiceResult<()> {
//! let bus = NotificationBus::new();
//! let mut notifications = bus.subscribe();
//!
//! let service = SessionEngineBuilder::new()
//!     .config(ServiceConfig::new("sip.example.com"))
//!     .engine(engine)
//!     .account_store(Arc::new(JsonAccountStore::new("/data/account.json")))
//!     .notification_bus(bus)
//!     .start_request(StartRequest::Outgoing(DialRequest::new("+3199999999")))
//!     .spawn()?;
//!
//! while let Some(notification) = notifications.recv().await {
//!     println!("{:?}", notification);
//! }
//! let reason = service.join().await?;
//! println!("service stopped: {}", reason);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{EngineParts, RunningService, SessionEngine, StartRequest};
use crate::account::AccountStore;
use crate::config::ServiceConfig;
use crate::engine::{EngineAdapter, ProtocolEngine};
use crate::error::{ServiceError, ServiceResult};
use crate::events::NotificationBus;
use crate::middleware::{HttpMiddlewareClient, MiddlewareClient};
use crate::ringback::{SilentTonePlayer, TonePlayer};

/// Fluent builder for a session engine
///
/// A protocol engine and an account store are required. Without an explicit middleware
/// client an [`HttpMiddlewareClient`] is built from the configuration; without a tone
/// player ringback is silent.
pub struct SessionEngineBuilder {
    config: ServiceConfig,
    engine: Option<Arc<dyn ProtocolEngine>>,
    account_store: Option<Arc<dyn AccountStore>>,
    tone_player: Arc<dyn TonePlayer>,
    middleware: Option<Arc<dyn MiddlewareClient>>,
    bus: NotificationBus,
    start_request: Option<StartRequest>,
}

impl Default for SessionEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
            engine: None,
            account_store: None,
            tone_player: Arc::new(SilentTonePlayer),
            middleware: None,
            bus: NotificationBus::new(),
            start_request: None,
        }
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ProtocolEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn account_store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.account_store = Some(store);
        self
    }

    pub fn tone_player(mut self, player: Arc<dyn TonePlayer>) -> Self {
        self.tone_player = player;
        self
    }

    pub fn middleware(mut self, client: Arc<dyn MiddlewareClient>) -> Self {
        self.middleware = Some(client);
        self
    }

    /// Publish notifications on an existing bus
    ///
    /// Subscribe to the bus before spawning to observe start-up notifications.
    pub fn notification_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn start_request(mut self, request: StartRequest) -> Self {
        self.start_request = Some(request);
        self
    }

    /// Validate the configuration and spawn the session engine
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> ServiceResult<RunningService> {
        self.config.validate()?;

        let engine = self
            .engine
            .ok_or_else(|| ServiceError::config("a protocol engine is required"))?;
        let account_store = self
            .account_store
            .ok_or_else(|| ServiceError::config("an account store is required"))?;
        let middleware: Arc<dyn MiddlewareClient> = match self.middleware {
            Some(client) => client,
            None => Arc::new(HttpMiddlewareClient::new(&self.config.middleware)?),
        };

        let adapter = EngineAdapter::new(engine, self.config.media_wiring_timeout);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let parts = EngineParts {
            config: self.config,
            adapter,
            account_store,
            tone_player: self.tone_player,
            middleware,
            bus: self.bus.clone(),
            start_request: self.start_request,
        };

        let (engine, inbox) = SessionEngine::new(parts, control_rx)?;
        tracing::debug!("Spawning session engine");
        Ok(super::spawn(engine, inbox, self.bus, control_tx))
    }
}
