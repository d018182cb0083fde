//! Certificate authorities.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commons::CustodyResult;
use crate::commons::crypto::Certificate;


//------------ CaId ----------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct CaId(String);

impl CaId {
    pub fn generate() -> Self {
        CaId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CaId {
    fn from(s: &str) -> Self {
        CaId(s.to_string())
    }
}

impl fmt::Display for CaId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ KeyRef --------------------------------------------------------

/// Where private key material is kept, never the key itself.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct KeyRef(String);

impl KeyRef {
    const EXTERNAL_PREFIX: &'static str = "external:";

    pub fn new(s: impl Into<String>) -> Self {
        KeyRef(s.into())
    }

    /// A key held outside the custodian, by the CA that operates it.
    pub fn external(holder: &str) -> Self {
        KeyRef(format!("{}{}", Self::EXTERNAL_PREFIX, holder))
    }

    pub fn is_external(&self) -> bool {
        self.0.starts_with(Self::EXTERNAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ CaTier --------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaTier {
    Root,
    Intermediate,
}


//------------ CaStatus ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaStatus {
    Active,
    Revoked,
}


//------------ Validity ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Validity { not_before, not_after }
    }

    /// From a few minutes ago (to tolerate clock skew) for `days` days.
    pub fn days_from_now(days: u32) -> Self {
        let now = Utc::now();
        Validity {
            not_before: now - Duration::minutes(5),
            not_after: now + Duration::days(days.into()),
        }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.not_before <= time && time <= self.not_after
    }

    /// Shortens the validity so it ends no later than `limit`.
    pub fn capped_at(self, limit: DateTime<Utc>) -> Self {
        Validity {
            not_before: self.not_before,
            not_after: self.not_after.min(limit),
        }
    }
}


//------------ CertificateAuthority ------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateAuthority {
    pub id: CaId,
    pub common_name: String,
    pub tier: CaTier,
    pub parent: Option<CaId>,

    /// The CA certificate, PEM.
    pub certificate: String,
    pub key_ref: KeyRef,
    pub validity: Validity,

    /// How many more CA levels may exist below this CA. `None` means
    /// unconstrained.
    pub path_len: Option<u32>,
    pub status: CaStatus,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl CertificateAuthority {
    pub fn is_active(&self) -> bool {
        self.status == CaStatus::Active
    }

    pub fn is_root(&self) -> bool {
        self.tier == CaTier::Root
    }

    pub fn certificate(&self) -> CustodyResult<Certificate> {
        Certificate::from_pem(self.certificate.as_bytes())
    }
}
