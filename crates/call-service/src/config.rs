//! Service configuration
//!
//! [`ServiceConfig`] holds everything the session engine needs besides the stored account:
//! the SIP domain, the transport the engine listens on, ringback timing, the media wiring
//! bound and the middleware request settings. It can be built in code or read from TOML.
//!
//! ```rust
//! use dialtone_call_service::config::ServiceConfig;
//!
//! let config = ServiceConfig::from_toml_str(r#"
//!     sip_domain = "sip.example.com"
//!
//!     [transport]
//!     kind = "udp"
//!     port = 5062
//!
//!     [ringback]
//!     initial_delay_ms = 1500
//! "#).unwrap();
//!
//! assert_eq!(config.transport.port, 5062);
//! assert_eq!(config.ringback.initial_delay.as_millis(), 1500);
//! assert_eq!(config.ringback.period.as_secs(), 4);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

/// Transport protocol of the engine's SIP listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
}

/// SIP transport the protocol engine binds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Udp,
            port: 5060,
        }
    }
}

/// Timing of the locally generated ringback tone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingbackConfig {
    /// Delay between entering early state and the first tone
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Interval between tones
    #[serde(rename = "period_ms", with = "duration_ms")]
    pub period: Duration,
    /// Length of a single tone
    #[serde(rename = "tone_duration_ms", with = "duration_ms")]
    pub tone_duration: Duration,
}

impl Default for RingbackConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            period: Duration::from_secs(4),
            tone_duration: Duration::from_secs(1),
        }
    }
}

/// Settings of the middleware acknowledgment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            user_agent: format!("dialtone/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Complete configuration of the call service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Domain used to build identity, registrar and peer URIs
    pub sip_domain: String,
    /// Upper bound for wiring audio devices to a call's media
    #[serde(rename = "media_wiring_timeout_ms", with = "duration_ms")]
    pub media_wiring_timeout: Duration,
    /// Stop the engine when the registrar rejects the account
    pub terminate_on_registration_failure: bool,
    pub transport: TransportConfig,
    pub ringback: RingbackConfig,
    pub middleware: MiddlewareConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sip_domain: "localhost".to_string(),
            media_wiring_timeout: Duration::from_secs(2),
            terminate_on_registration_failure: false,
            transport: TransportConfig::default(),
            ringback: RingbackConfig::default(),
            middleware: MiddlewareConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a configuration for `sip_domain` with default settings
    pub fn new(sip_domain: impl Into<String>) -> Self {
        Self {
            sip_domain: sip_domain.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> ServiceResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| ServiceError::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded service configuration from {}", path.display());
        Self::from_toml_str(&input)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> ServiceResult<()> {
        if self.sip_domain.trim().is_empty() {
            return Err(ServiceError::config("sip_domain must not be empty"));
        }
        if self.transport.port == 0 {
            return Err(ServiceError::config("transport port must not be 0"));
        }
        if self.ringback.period.is_zero() {
            return Err(ServiceError::config("ringback period must be greater than 0"));
        }
        if self.media_wiring_timeout.is_zero() {
            return Err(ServiceError::config("media wiring timeout must be greater than 0"));
        }
        Ok(())
    }

    pub fn with_transport(mut self, kind: TransportKind, port: u16) -> Self {
        self.transport = TransportConfig { kind, port };
        self
    }

    pub fn with_ringback(mut self, ringback: RingbackConfig) -> Self {
        self.ringback = ringback;
        self
    }

    pub fn with_media_wiring_timeout(mut self, timeout: Duration) -> Self {
        self.media_wiring_timeout = timeout;
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewareConfig) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_terminate_on_registration_failure(mut self, terminate: bool) -> Self {
        self.terminate_on_registration_failure = terminate;
        self
    }
}

/// Durations as integer milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
