//! SIP account storage, credentials and registration state
//!
//! The stored [`PhoneAccount`] is read once at start-up through an [`AccountStore`]. From it
//! the service derives the [`AccountRegistration`] the protocol engine registers, and
//! tracks the outcome in an [`AccountSession`].
//!
//! ```rust
//! use dialtone_call_service::account::{AccountRegistration, PhoneAccount};
//!
//! let account = PhoneAccount::new("129700042", "secret");
//! let registration = AccountRegistration::from_account(&account, "sip.example.com");
//!
//! assert_eq!(registration.identity_uri, "sip:129700042@sip.example.com");
//! assert_eq!(registration.registrar_uri, "sip:sip.example.com");
//! assert_eq!(registration.credential.username, "129700042");
//! ```

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{status, AccountEvent};
use crate::error::{ServiceError, ServiceResult};

/// SIP account as stored on the device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneAccount {
    pub account_id: String,
    pub password: String,
}

impl PhoneAccount {
    pub fn new(account_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PhoneAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhoneAccount")
            .field("account_id", &self.account_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of the stored SIP account
pub trait AccountStore: Send + Sync {
    /// Load the stored account, `None` when the user has no SIP account
    fn load(&self) -> ServiceResult<Option<PhoneAccount>>;
}

/// Account store backed by a JSON file
///
/// A missing file means there is no account.
#[derive(Debug, Clone)]
pub struct JsonAccountStore {
    path: PathBuf,
}

impl JsonAccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write `account` to the backing file
    pub fn save(&self, account: &PhoneAccount) -> ServiceResult<()> {
        let json = serde_json::to_string_pretty(account)
            .map_err(|e| ServiceError::storage(format!("cannot encode account: {}", e)))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl AccountStore for JsonAccountStore {
    fn load(&self) -> ServiceResult<Option<PhoneAccount>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map(Some).map_err(|e| {
            ServiceError::storage(format!("cannot decode {}: {}", self.path.display(), e))
        })
    }
}

/// In-memory account store
#[derive(Debug, Clone, Default)]
pub struct StaticAccountStore {
    account: Option<PhoneAccount>,
}

impl StaticAccountStore {
    pub fn new(account: Option<PhoneAccount>) -> Self {
        Self { account }
    }
}

impl AccountStore for StaticAccountStore {
    fn load(&self) -> ServiceResult<Option<PhoneAccount>> {
        Ok(self.account.clone())
    }
}

/// Digest authentication credential
#[derive(Clone, PartialEq, Eq)]
pub struct DigestCredential {
    pub scheme: String,
    pub realm: String,
    pub username: String,
    pub secret: String,
}

impl DigestCredential {
    /// Plain-text digest credential valid for any realm
    pub fn any_realm(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            scheme: "digest".to_string(),
            realm: "*".to_string(),
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for DigestCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestCredential")
            .field("scheme", &self.scheme)
            .field("realm", &self.realm)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Build a SIP URI for `user` at `domain`
pub fn sip_uri(user: &str, domain: &str) -> String {
    format!("sip:{}@{}", user, domain)
}

/// Build the registrar URI of `domain`
pub fn registrar_uri(domain: &str) -> String {
    format!("sip:{}", domain)
}

/// What the protocol engine needs to register an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRegistration {
    pub identity_uri: String,
    pub registrar_uri: String,
    pub credential: DigestCredential,
}

impl AccountRegistration {
    pub fn from_account(account: &PhoneAccount, domain: &str) -> Self {
        Self {
            identity_uri: sip_uri(&account.account_id, domain),
            registrar_uri: registrar_uri(domain),
            credential: DigestCredential::any_realm(&account.account_id, &account.password),
        }
    }
}

/// Registration state of the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Registered => "registered",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Translate a completed REGISTER transaction into an account event
pub fn registration_event(status_code: u16, reason: &str, expires: u32) -> AccountEvent {
    if (status::OK..300).contains(&status_code) {
        if expires > 0 {
            AccountEvent::Registered { expires }
        } else {
            AccountEvent::Unregistered
        }
    } else {
        AccountEvent::Failed {
            status: status_code,
            reason: reason.to_string(),
        }
    }
}

/// The authenticated identity used for this engine run
#[derive(Debug, Clone)]
pub struct AccountSession {
    pub registration: AccountRegistration,
    pub state: RegistrationState,
    pub registered_at: Option<DateTime<Utc>>,
}

impl AccountSession {
    pub fn new(registration: AccountRegistration) -> Self {
        Self {
            registration,
            state: RegistrationState::Unregistered,
            registered_at: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    /// Apply an account event, returning `true` when the account just became registered
    pub fn apply(&mut self, event: &AccountEvent) -> bool {
        let was_registered = self.is_registered();
        self.state = match event {
            AccountEvent::Registered { .. } => RegistrationState::Registered,
            AccountEvent::Unregistered => RegistrationState::Unregistered,
            AccountEvent::Failed { .. } | AccountEvent::InvalidState { .. } => {
                RegistrationState::Failed
            }
        };
        let registered_now = self.is_registered() && !was_registered;
        if registered_now {
            self.registered_at = Some(Utc::now());
        }
        registered_now
    }
}
