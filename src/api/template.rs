//! Certificate templates.
//!
//! A template says what an issued certificate looks like and how it is
//! obtained. Templates are immutable once published: a change means
//! publishing a new version under the same name.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::commons::crypto::KeyAlgorithm;
use crate::commons::error::Error;
use crate::commons::CustodyEmptyResult;


//------------ TemplateName --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct TemplateName(String);

impl TemplateName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TemplateName {
    fn from(s: &str) -> Self {
        TemplateName(s.to_string())
    }
}

impl From<String> for TemplateName {
    fn from(s: String) -> Self {
        TemplateName(s)
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ TemplateRef ---------------------------------------------------

/// A specific published version of a template.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct TemplateRef {
    pub name: TemplateName,
    pub version: u32,
}

impl TemplateRef {
    /// The storage key of this template version.
    pub fn storage_key(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}


//------------ KeyUsage ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            KeyUsage::DigitalSignature => "digitalSignature",
            KeyUsage::NonRepudiation => "nonRepudiation",
            KeyUsage::KeyEncipherment => "keyEncipherment",
            KeyUsage::DataEncipherment => "dataEncipherment",
            KeyUsage::KeyAgreement => "keyAgreement",
            KeyUsage::KeyCertSign => "keyCertSign",
            KeyUsage::CrlSign => "cRLSign",
        };
        f.write_str(s)
    }
}


//------------ ExtendedKeyUsage ----------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

impl fmt::Display for ExtendedKeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ExtendedKeyUsage::ServerAuth => "serverAuth",
            ExtendedKeyUsage::ClientAuth => "clientAuth",
            ExtendedKeyUsage::CodeSigning => "codeSigning",
            ExtendedKeyUsage::EmailProtection => "emailProtection",
            ExtendedKeyUsage::TimeStamping => "timeStamping",
            ExtendedKeyUsage::OcspSigning => "OCSPSigning",
        };
        f.write_str(s)
    }
}


//------------ SubjectNaming -------------------------------------------------

/// Who decides the subject distinguished name.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectNaming {
    /// The requester's subject attributes are used as given.
    #[default]
    Requester,

    /// The subject is the requested CN plus the template's attributes;
    /// anything else the requester supplied is ignored.
    Template,
}


//------------ EnrollmentMode ------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentMode {
    #[default]
    Automatic,

    /// Every request needs an operator's approval.
    Manual,
}


//------------ SubjectAttributes ---------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SubjectAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
}


//------------ CertificateTemplate -------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateTemplate {
    pub name: TemplateName,

    #[serde(default = "CertificateTemplate::dflt_version")]
    pub version: u32,

    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,

    /// Minimum RSA-equivalent key strength.
    pub min_key_bits: u32,

    #[serde(default)]
    pub key_usage: Vec<KeyUsage>,

    #[serde(default)]
    pub extended_key_usage: Vec<ExtendedKeyUsage>,

    pub validity_days: u32,

    /// Renew when the certificate has less than this left.
    pub renewal_overlap_days: u32,

    #[serde(default)]
    pub subject_naming: SubjectNaming,

    #[serde(default)]
    pub subject_defaults: SubjectAttributes,

    /// Whether the private key may leave the host that generated it.
    #[serde(default)]
    pub exportable_key: bool,

    #[serde(default)]
    pub enrollment_mode: EnrollmentMode,

    /// Name of the signing backend that issues for this template.
    pub backend: String,
}

impl CertificateTemplate {
    fn dflt_version() -> u32 {
        1
    }

    pub fn reference(&self) -> TemplateRef {
        TemplateRef { name: self.name.clone(), version: self.version }
    }

    pub fn validity(&self) -> Duration {
        Duration::days(self.validity_days.into())
    }

    pub fn renewal_overlap(&self) -> Duration {
        Duration::days(self.renewal_overlap_days.into())
    }

    /// Whether a certificate expiring at `not_after` should be renewed.
    pub fn is_due_for_renewal(&self, not_after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now + self.renewal_overlap() >= not_after
    }

    /// The RSA modulus to generate: the minimum, rounded up to the next
    /// commonly supported size.
    pub fn rsa_bits(&self) -> u32 {
        [2048, 3072, 4096, 8192]
            .into_iter()
            .find(|bits| *bits >= self.min_key_bits)
            .unwrap_or(self.min_key_bits)
    }

    pub fn verify(&self) -> CustodyEmptyResult {
        if self.name.as_str().is_empty()
            || !self
                .name
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::TemplateInvalid(format!("invalid template name '{}'", self.name)));
        }
        if self.version == 0 {
            return Err(Error::TemplateInvalid("version must be at least 1".into()));
        }
        if self.min_key_bits < 1024 {
            return Err(Error::TemplateInvalid("min_key_bits must be at least 1024".into()));
        }
        if self.validity_days == 0 {
            return Err(Error::TemplateInvalid("validity_days must be at least 1".into()));
        }
        if self.renewal_overlap_days >= self.validity_days {
            return Err(Error::TemplateInvalid(
                "renewal_overlap_days must be smaller than validity_days".into(),
            ));
        }
        if self.key_usage.contains(&KeyUsage::KeyCertSign) {
            return Err(Error::TemplateInvalid("end-entity templates cannot certify keys".into()));
        }
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
