//! Middleware acknowledgment
//!
//! Inbound calls are announced to the device by a push message from the middleware. Once
//! the account is registered, the service replies to the middleware so the call gets routed
//! to this device. The reply is a single HTTP request, not retried.

use async_trait::async_trait;
use url::Url;

use crate::config::MiddlewareConfig;
use crate::error::MiddlewareError;

/// Form field carrying the one-time request token
pub const TOKEN_FIELD: &str = "unique_key";

/// Client of the middleware that paired the inbound call with this device
#[async_trait]
pub trait MiddlewareClient: Send + Sync {
    /// Tell the middleware the device is ready to receive the call identified by `token`
    async fn reply(&self, response_url: &str, token: &str) -> Result<(), MiddlewareError>;
}

/// [`MiddlewareClient`] speaking HTTP
#[derive(Debug, Clone)]
pub struct HttpMiddlewareClient {
    http: reqwest::Client,
}

impl HttpMiddlewareClient {
    pub fn new(config: &MiddlewareConfig) -> Result<Self, MiddlewareError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { http })
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MiddlewareClient for HttpMiddlewareClient {
    async fn reply(&self, response_url: &str, token: &str) -> Result<(), MiddlewareError> {
        let url = Url::parse(response_url).map_err(|e| MiddlewareError::InvalidUrl {
            url: response_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MiddlewareError::InvalidUrl {
                url: response_url.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        tracing::debug!("Replying to middleware at {}", url);
        let response = self
            .http
            .post(url)
            .form(&[(TOKEN_FIELD, token)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::info!("Middleware accepted the reply ({})", status);
            Ok(())
        } else {
            Err(MiddlewareError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}
