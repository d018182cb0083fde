//! Credentials for distribution targets.
//!
//! Credentials are checked out per operation and dropped afterwards.
//! They are never logged, serialized or kept on a record.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::RwLock;

use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;
use crate::commons::CustodyResult;
use crate::constants::CUSTODIAN_ENV_SECRET_PREFIX;


//------------ Credential ----------------------------------------------------

#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub secret: SecretString,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Credential { username: username.into(), secret: SecretString::new(secret.into()) }
    }

    /// A bare API key, as used by appliances.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::new("api", key)
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Credential({}, ****)", self.username)
    }
}


//------------ SecretStore ---------------------------------------------------

pub trait SecretStore: Send + Sync {
    /// Checks out the credential stored under `reference`.
    fn get_credential(&self, reference: &str) -> CustodyResult<Credential>;
}


//------------ EnvSecretStore ------------------------------------------------

/// Reads credentials from the environment.
///
/// For reference `fw1` it looks for `CUSTODIAN_FW1_API_KEY`, and
/// otherwise for `CUSTODIAN_FW1_PASSWORD` with an optional
/// `CUSTODIAN_FW1_USERNAME` that defaults to `admin`.
#[derive(Clone, Debug, Default)]
pub struct EnvSecretStore {
    prefix: Option<String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        EnvSecretStore::default()
    }

    /// Uses a different prefix than `CUSTODIAN_`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        EnvSecretStore { prefix: Some(prefix.into()) }
    }

    fn var_name(&self, reference: &str, suffix: &str) -> String {
        let reference: String = reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        let prefix = self.prefix.as_deref().unwrap_or(CUSTODIAN_ENV_SECRET_PREFIX);
        format!("{}{}_{}", prefix, reference, suffix)
    }

    fn var(&self, reference: &str, suffix: &str) -> Option<String> {
        env::var(self.var_name(reference, suffix)).ok().filter(|v| !v.is_empty())
    }
}

impl SecretStore for EnvSecretStore {
    fn get_credential(&self, reference: &str) -> CustodyResult<Credential> {
        if let Some(key) = self.var(reference, "API_KEY") {
            return Ok(Credential::api_key(key));
        }
        match self.var(reference, "PASSWORD") {
            Some(password) => {
                let username = self.var(reference, "USERNAME").unwrap_or_else(|| "admin".to_string());
                Ok(Credential::new(username, password))
            }
            None => Err(Error::CredentialNotFound(reference.to_string())),
        }
    }
}


//------------ StaticSecretStore ---------------------------------------------

#[derive(Default)]
pub struct StaticSecretStore {
    credentials: RwLock<HashMap<String, Credential>>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        StaticSecretStore::default()
    }

    pub fn with(self, reference: &str, credential: Credential) -> Self {
        self.insert(reference, credential);
        self
    }

    pub fn insert(&self, reference: &str, credential: Credential) {
        self.credentials
            .write()
            .expect("poisoned lock")
            .insert(reference.to_string(), credential);
    }
}

impl SecretStore for StaticSecretStore {
    fn get_credential(&self, reference: &str) -> CustodyResult<Credential> {
        self.credentials
            .read()
            .expect("poisoned lock")
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::CredentialNotFound(reference.to_string()))
    }
}


//------------ Tests ---------------------------------------------------------
