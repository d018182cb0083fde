//! Enrollment requests and their state machine.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ca::KeyRef;
use crate::api::target::TargetId;
use crate::api::template::{SubjectAttributes, TemplateName, TemplateRef};
use crate::commons::crypto::{Certificate, Thumbprint, certificates_from_pem};
use crate::commons::error::{Error, ErrorKind};
use crate::commons::{CustodyEmptyResult, CustodyResult};


//------------ RequestId -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4())
    }

    pub fn storage_key(&self) -> String {
        self.0.to_string()
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(RequestId)
            .map_err(|_| Error::invalid_request(format!("'{}' is not a request id", s)))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}


//------------ PendingToken --------------------------------------------------

/// Opaque handle a signing backend returns for a request it has not
/// decided on yet.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PendingToken(String);

impl PendingToken {
    pub fn new(s: impl Into<String>) -> Self {
        PendingToken(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PendingToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Tokens can be long (EST uses the CSR itself).
        if self.0.chars().count() > 24 {
            let short: String = self.0.chars().take(24).collect();
            write!(f, "{}…", short)
        } else {
            f.write_str(&self.0)
        }
    }
}


//------------ SubjectName ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SubjectName {
    pub common_name: String,

    #[serde(default, flatten)]
    pub attributes: SubjectAttributes,
}

impl SubjectName {
    pub fn new(common_name: impl Into<String>) -> Self {
        SubjectName { common_name: common_name.into(), attributes: SubjectAttributes::default() }
    }

    pub fn with_attributes(mut self, attributes: SubjectAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl fmt::Display for SubjectName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CN={}", self.common_name)?;
        if let Some(ou) = &self.attributes.organizational_unit {
            write!(f, ", OU={}", ou)?;
        }
        if let Some(o) = &self.attributes.organization {
            write!(f, ", O={}", o)?;
        }
        if let Some(c) = &self.attributes.country {
            write!(f, ", C={}", c)?;
        }
        Ok(())
    }
}


//------------ SubjectAltName ------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
    Email(String),
}

impl SubjectAltName {
    pub fn validate(&self) -> CustodyEmptyResult {
        match self {
            SubjectAltName::Dns(name) if is_valid_dns_name(name) => Ok(()),
            SubjectAltName::Dns(name) => {
                Err(Error::invalid_request(format!("'{}' is not a valid DNS name", name)))
            }
            SubjectAltName::Ip(_) => Ok(()),
            SubjectAltName::Email(email) => match email.split_once('@') {
                Some((local, domain)) if !local.is_empty() && is_valid_dns_name(domain) => Ok(()),
                _ => Err(Error::invalid_request(format!("'{}' is not a valid e-mail address", email))),
            },
        }
    }
}

impl FromStr for SubjectAltName {
    type Err = Error;

    /// Parses `dns:name`, `ip:addr`, `email:addr`, or a bare value whose
    /// type is guessed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let san = match s.split_once(':') {
            Some(("dns", name)) => SubjectAltName::Dns(name.to_string()),
            Some(("email", email)) => SubjectAltName::Email(email.to_string()),
            Some(("ip", addr)) => SubjectAltName::Ip(
                addr.parse()
                    .map_err(|_| Error::invalid_request(format!("'{}' is not an IP address", addr)))?,
            ),
            _ => {
                if let Ok(addr) = s.parse() {
                    SubjectAltName::Ip(addr)
                } else if s.contains('@') {
                    SubjectAltName::Email(s.to_string())
                } else {
                    SubjectAltName::Dns(s.to_string())
                }
            }
        };
        san.validate()?;
        Ok(san)
    }
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubjectAltName::Dns(name) => write!(f, "dns:{}", name),
            SubjectAltName::Ip(addr) => write!(f, "ip:{}", addr),
            SubjectAltName::Email(email) => write!(f, "email:{}", email),
        }
    }
}

/// Checks host name syntax: dot separated labels of letters, digits and
/// hyphens, optionally starting with a `*.` wildcard.
pub fn is_valid_dns_name(name: &str) -> bool {
    let name = name.strip_prefix("*.").unwrap_or(name);
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}


//------------ SanSet --------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SanSet(BTreeSet<SubjectAltName>);

impl SanSet {
    pub fn insert(&mut self, san: SubjectAltName) {
        self.0.insert(san);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubjectAltName> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, san: &SubjectAltName) -> bool {
        self.0.contains(san)
    }

    pub fn is_subset(&self, other: &SanSet) -> bool {
        self.0.is_subset(&other.0)
    }
}

impl FromIterator<SubjectAltName> for SanSet {
    fn from_iter<T: IntoIterator<Item = SubjectAltName>>(iter: T) -> Self {
        SanSet(iter.into_iter().collect())
    }
}


//------------ IdentityKey ---------------------------------------------------

/// The (subject, template) pair of which at most one request may be in
/// flight.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct IdentityKey {
    pub subject: String,
    pub template: TemplateName,
}

impl IdentityKey {
    /// Common names compare case-insensitively.
    pub fn new(common_name: &str, template: &TemplateName) -> Self {
        IdentityKey { subject: common_name.to_ascii_lowercase(), template: template.clone() }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}", self.subject, self.template)
    }
}


//------------ FailureReason -------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Validation,
    Backend,
    Rejected,
    ApprovalTimeout,
    ChainValidation,
    Cancelled,
    Internal,
}

impl FailureReason {
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation | ErrorKind::NotFound => FailureReason::Validation,
            ErrorKind::Backend => FailureReason::Backend,
            ErrorKind::Rejected => FailureReason::Rejected,
            ErrorKind::ApprovalTimeout => FailureReason::ApprovalTimeout,
            ErrorKind::ChainValidation | ErrorKind::Hierarchy => FailureReason::ChainValidation,
            ErrorKind::Cancelled => FailureReason::Cancelled,
            ErrorKind::Distribution
            | ErrorKind::Conflict
            | ErrorKind::Storage
            | ErrorKind::Crypto
            | ErrorKind::Config
            | ErrorKind::Internal => FailureReason::Internal,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FailureReason::Validation => "validation",
            FailureReason::Backend => "backend",
            FailureReason::Rejected => "rejected",
            FailureReason::ApprovalTimeout => "approval_timeout",
            FailureReason::ChainValidation => "chain_validation",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Internal => "internal",
        };
        f.write_str(s)
    }
}


//------------ RequestState --------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RequestState {
    Drafted,
    KeyGenerated,
    CsrCreated,
    Submitted,
    PendingApproval,
    Issued,
    Rejected,
    Retrieved,
    ChainBuilt,
    Verified,
    Completed,
    Failed(FailureReason),
    Retrying,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed(_))
    }

    /// Whether the pipeline stops driving the request in this state,
    /// either for good or until the backend decides.
    pub fn is_resting(&self) -> bool {
        self.is_terminal() || *self == RequestState::PendingApproval
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: &RequestState) -> bool {
        use RequestState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_)) {
            return true;
        }
        match self {
            Drafted => matches!(next, KeyGenerated | Completed),
            KeyGenerated => *next == CsrCreated,
            CsrCreated => *next == Submitted,
            Submitted | PendingApproval => {
                matches!(next, PendingApproval | Issued | Rejected | Retrying)
            }
            Issued => *next == Retrieved,
            Retrieved => *next == ChainBuilt,
            ChainBuilt => *next == Verified,
            Verified => *next == Completed,
            Retrying => *next == CsrCreated,
            Rejected | Completed | Failed(_) => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RequestState::Drafted => "drafted",
            RequestState::KeyGenerated => "key_generated",
            RequestState::CsrCreated => "csr_created",
            RequestState::Submitted => "submitted",
            RequestState::PendingApproval => "pending_approval",
            RequestState::Issued => "issued",
            RequestState::Rejected => "rejected",
            RequestState::Retrieved => "retrieved",
            RequestState::ChainBuilt => "chain_built",
            RequestState::Verified => "verified",
            RequestState::Completed => "completed",
            RequestState::Failed(reason) => return write!(f, "failed({})", reason),
            RequestState::Retrying => "retrying",
        };
        f.write_str(s)
    }
}


//------------ NewEnrollment -------------------------------------------------

/// What a caller asks for.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NewEnrollment {
    pub subject: SubjectName,

    #[serde(default)]
    pub sans: SanSet,
    pub template: TemplateName,

    #[serde(default)]
    pub targets: Vec<TargetId>,

    /// Set by the renewal scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<RequestId>,
}

impl NewEnrollment {
    pub fn new(common_name: &str, template: &str) -> Self {
        NewEnrollment {
            subject: SubjectName::new(common_name),
            sans: SanSet::default(),
            template: TemplateName::from(template),
            targets: vec![],
            supersedes: None,
        }
    }

    pub fn with_san(mut self, san: SubjectAltName) -> Self {
        self.sans.insert(san);
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.targets.push(TargetId::from(target));
        self
    }

    pub fn with_attributes(mut self, attributes: SubjectAttributes) -> Self {
        self.subject.attributes = attributes;
        self
    }

    /// Syntax checks that need no other component.
    pub fn validate(&self) -> CustodyEmptyResult {
        if !is_valid_dns_name(&self.subject.common_name) {
            return Err(Error::invalid_request(format!(
                "common name '{}' is not a valid host name",
                self.subject.common_name
            )));
        }
        if let Some(country) = &self.subject.attributes.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(Error::invalid_request(format!(
                    "country '{}' must be a two letter code",
                    country
                )));
            }
        }
        for san in self.sans.iter() {
            san.validate()?;
        }
        Ok(())
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.subject.common_name, &self.template)
    }
}


//------------ EnrollmentRequest ---------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EnrollmentRequest {
    pub id: RequestId,
    pub subject: SubjectName,
    pub sans: SanSet,
    pub template: TemplateRef,
    pub backend: String,
    pub targets: Vec<TargetId>,
    pub state: RequestState,

    /// The current CSR, PEM.
    pub csr: Option<String>,

    /// Where the request's private key is kept.
    pub key_ref: Option<KeyRef>,

    /// The issued certificate, PEM.
    pub certificate: Option<String>,

    /// Issuer chain above the certificate up to the root, PEM each.
    pub chain: Vec<String>,
    pub thumbprint: Option<Thumbprint>,
    pub not_after: Option<DateTime<Utc>>,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    /// Submissions made so far, retries included.
    pub attempts: u32,

    /// The request this one renews.
    pub supersedes: Option<RequestId>,

    /// The completed request whose certificate this one reuses instead of
    /// issuing its own.
    pub reuses: Option<RequestId>,

    pub pending: Option<PendingToken>,
    pub pending_since: Option<DateTime<Utc>>,

    /// A pending submission given up on, kept for reconciliation.
    pub abandoned: Option<PendingToken>,
}

impl EnrollmentRequest {
    pub fn new(id: RequestId, new: NewEnrollment, template: TemplateRef, backend: String) -> Self {
        let now = Utc::now();
        EnrollmentRequest {
            id,
            subject: new.subject,
            sans: new.sans,
            template,
            backend,
            targets: new.targets,
            state: RequestState::Drafted,
            csr: None,
            key_ref: None,
            certificate: None,
            chain: vec![],
            thumbprint: None,
            not_after: None,
            created: now,
            updated: now,
            attempts: 0,
            supersedes: new.supersedes,
            reuses: None,
            pending: None,
            pending_since: None,
            abandoned: None,
        }
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.subject.common_name, &self.template.name)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        self.state == RequestState::Completed
    }

    pub fn certificate(&self) -> CustodyResult<Option<Certificate>> {
        self.certificate
            .as_ref()
            .map(|pem| Certificate::from_pem(pem.as_bytes()))
            .transpose()
    }

    /// The issuer chain above the leaf.
    pub fn chain(&self) -> CustodyResult<Vec<Certificate>> {
        let mut res = vec![];
        for pem in &self.chain {
            res.extend(certificates_from_pem(pem.as_bytes())?);
        }
        Ok(res)
    }

    /// The leaf followed by its issuers.
    pub fn full_chain(&self) -> CustodyResult<Vec<Certificate>> {
        let mut res = vec![];
        if let Some(cert) = self.certificate()? {
            res.push(cert);
        }
        res.extend(self.chain()?);
        Ok(res)
    }

    pub fn covers_targets(&self, targets: &[TargetId]) -> bool {
        targets.iter().all(|t| self.targets.contains(t))
    }

    pub fn is_valid_at(&self, time: DateTime<Utc>) -> bool {
        self.not_after.map(|not_after| time < not_after).unwrap_or(false)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_paths() {
        use RequestState::*;

        let happy = [
            Drafted, KeyGenerated, CsrCreated, Submitted, PendingApproval, PendingApproval, Issued,
            Retrieved, ChainBuilt, Verified, Completed,
        ];
        for pair in happy.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        let retry = [Submitted, Retrying, CsrCreated, Submitted, Issued];
        for pair in retry.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(Drafted.can_transition_to(&Completed));
        assert!(Rejected.can_transition_to(&Failed(FailureReason::Rejected)));
        assert!(!Rejected.can_transition_to(&Issued));
        assert!(!Drafted.can_transition_to(&Submitted));
        assert!(!Issued.can_transition_to(&Verified));
        assert!(!Retrying.can_transition_to(&Submitted));
        assert!(!Completed.can_transition_to(&Failed(FailureReason::Cancelled)));
        assert!(!Failed(FailureReason::Backend).can_transition_to(&Retrying));
    }

    #[test]
    fn state_serialization() {
        let failed = RequestState::Failed(FailureReason::ApprovalTimeout);
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"approval_timeout"}"#);
        assert_eq!(serde_json::from_str::<RequestState>(&json).unwrap(), failed);
        assert_eq!(failed.to_string(), "failed(approval_timeout)");
    }

    #[test]
    fn dns_names() {
        assert!(is_valid_dns_name("fw1.example.com"));
        assert!(is_valid_dns_name("localhost"));
        assert!(is_valid_dns_name("*.example.com"));
        assert!(!is_valid_dns_name(""));
        assert!(!is_valid_dns_name("bad name.example.com"));
        assert!(!is_valid_dns_name("-lead.example.com"));
        assert!(!is_valid_dns_name("a..b"));
    }

    #[test]
    fn parse_sans() {
        assert_eq!(
            SubjectAltName::from_str("10.1.2.3").unwrap(),
            SubjectAltName::Ip("10.1.2.3".parse().unwrap())
        );
        assert_eq!(
            SubjectAltName::from_str("dns:www.example.com").unwrap(),
            SubjectAltName::Dns("www.example.com".into())
        );
        assert_eq!(
            SubjectAltName::from_str("ops@example.com").unwrap(),
            SubjectAltName::Email("ops@example.com".into())
        );
        assert!(SubjectAltName::from_str("dns:not valid").is_err());
        assert!(SubjectAltName::from_str("ip:300.1.1.1").is_err());
    }

    #[test]
    fn validate_new_enrollment() {
        let ok = NewEnrollment::new("fw1.example.com", "WebServer")
            .with_san(SubjectAltName::Dns("fw1.example.com".into()))
            .with_target("applianceA");
        ok.validate().unwrap();
        assert_eq!(ok.identity(), IdentityKey::new("FW1.example.com", &TemplateName::from("WebServer")));

        let bad_cn = NewEnrollment::new("fw1 example", "WebServer");
        assert_eq!(bad_cn.validate().unwrap_err().kind(), ErrorKind::Validation);

        let bad_san = NewEnrollment::new("fw1.example.com", "WebServer")
            .with_san(SubjectAltName::Email("nobody".into()));
        assert_eq!(bad_san.validate().unwrap_err().kind(), ErrorKind::Validation);
    }
}
