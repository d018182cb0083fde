//! Signing backends.
//!
//! Every backend offers the same two capabilities: submit a CSR, and poll
//! a submission the backend did not decide on right away. Which variant
//! signs for a template is decided by configuration.

mod challenge;
mod direct;
mod est;
mod remote;

pub use self::challenge::{Challenge, ChallengeIssuer, ChallengeVerifier, HttpChallengeVerifier};
pub use self::direct::DirectSigner;
pub use self::est::EstClient;
pub use self::remote::{EnrollmentAuthority, ExistingRequest, RemoteEnroller};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::request::{IdentityKey, PendingToken, RequestId, SanSet, SubjectName};
use crate::api::template::CertificateTemplate;
use crate::commons::crypto::{Certificate, Csr};
use crate::commons::error::Error;


//------------ BackendError --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendError {
    /// The backend could not be reached.
    Unreachable(String),

    /// The backend answered with a server error.
    Server(String),

    /// The backend answered with something that makes no sense.
    Protocol(String),

    /// The backend does not know the submission, e.g. after it restarted.
    UnknownToken(PendingToken),

    Crypto(String),
}

impl BackendError {
    /// Whether submitting again may help.
    ///
    /// A forgotten submission is recovered by submitting anew.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unreachable(_) | BackendError::Server(_) | BackendError::UnknownToken(_)
        )
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendError::Unreachable(e) => write!(f, "backend unreachable: {}", e),
            BackendError::Server(e) => write!(f, "backend server error: {}", e),
            BackendError::Protocol(e) => write!(f, "unexpected backend response: {}", e),
            BackendError::UnknownToken(token) => write!(f, "backend does not know submission {}", token),
            BackendError::Crypto(e) => write!(f, "backend could not process certificate data: {}", e),
        }
    }
}

impl From<Error> for BackendError {
    fn from(e: Error) -> Self {
        BackendError::Crypto(e.to_string())
    }
}


//------------ SubmissionContext ---------------------------------------------

/// What a backend needs to know about a request besides its CSR.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmissionContext {
    pub request: RequestId,

    /// The subject to certify, after the template's naming mode was
    /// applied.
    pub subject: SubjectName,
    pub sans: SanSet,
    pub template: CertificateTemplate,
}

impl SubmissionContext {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.subject.common_name, &self.template.name)
    }
}


//------------ IssuedCertificate ---------------------------------------------

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IssuedCertificate {
    pub certificate: Certificate,

    /// Whatever issuer certificates the backend sent along.
    pub chain: Vec<Certificate>,
}

impl IssuedCertificate {
    pub fn new(certificate: Certificate) -> Self {
        IssuedCertificate { certificate, chain: vec![] }
    }

    /// Picks the certificate for `csr` out of a bundle of certificates.
    pub fn from_bundle(certs: Vec<Certificate>, csr: &Csr) -> Result<Self, BackendError> {
        let public_key = csr.public_key()?;
        let (leaf, chain): (Vec<_>, Vec<_>) = certs.into_iter().partition(|cert| {
            cert.x509()
                .public_key()
                .map(|key| key.public_eq(&public_key))
                .unwrap_or(false)
        });
        let certificate = leaf
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Protocol("no certificate for the submitted key".into()))?;
        Ok(IssuedCertificate { certificate, chain })
    }

    /// Whether this certifies the key in `csr`.
    pub fn matches(&self, csr: &Csr) -> bool {
        match (self.certificate.x509().public_key(), csr.public_key()) {
            (Ok(cert_key), Ok(csr_key)) => cert_key.public_eq(&csr_key),
            _ => false,
        }
    }
}


//------------ SubmitOutcome -------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    Issued(IssuedCertificate),
    Pending(PendingToken),
    Rejected(String),
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubmitOutcome::Issued(issued) => write!(
                f,
                "issued '{}'",
                issued.certificate.subject_cn().unwrap_or_default()
            ),
            SubmitOutcome::Pending(token) => write!(f, "pending {}", token),
            SubmitOutcome::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}


//------------ PollOutcome ---------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Issued(IssuedCertificate),
    StillPending,
    Rejected(String),
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PollOutcome::Issued(issued) => write!(
                f,
                "issued '{}'",
                issued.certificate.subject_cn().unwrap_or_default()
            ),
            PollOutcome::StillPending => write!(f, "still pending"),
            PollOutcome::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}


//------------ SigningBackendAdapter -----------------------------------------

/// A configured signing backend.
#[derive(Debug)]
pub enum SigningBackendAdapter {
    DirectSign(DirectSigner),
    RemoteEnroll(RemoteEnroller),
    ChallengeResponse(ChallengeIssuer),
}

impl SigningBackendAdapter {
    pub fn name(&self) -> &str {
        match self {
            SigningBackendAdapter::DirectSign(signer) => signer.name(),
            SigningBackendAdapter::RemoteEnroll(enroller) => enroller.name(),
            SigningBackendAdapter::ChallengeResponse(issuer) => issuer.name(),
        }
    }

    /// Submits a CSR.
    ///
    /// Each variant first looks for a submission it already has for the
    /// same subject and template, and answers with that instead of
    /// creating a second one.
    pub async fn submit(&self, csr: &Csr, ctx: &SubmissionContext) -> Result<SubmitOutcome, BackendError> {
        match self {
            SigningBackendAdapter::DirectSign(signer) => signer.submit(csr, ctx),
            SigningBackendAdapter::RemoteEnroll(enroller) => enroller.submit(csr, ctx).await,
            SigningBackendAdapter::ChallengeResponse(issuer) => issuer.submit(csr, ctx),
        }
    }

    pub async fn poll(&self, token: &PendingToken) -> Result<PollOutcome, BackendError> {
        match self {
            SigningBackendAdapter::DirectSign(signer) => signer.poll(token),
            SigningBackendAdapter::RemoteEnroll(enroller) => enroller.poll(token).await,
            SigningBackendAdapter::ChallengeResponse(issuer) => issuer.poll(token).await,
        }
    }

    /// The local signer, if this backend is one. Used for operator
    /// approval of manual enrollments.
    pub fn as_direct(&self) -> Option<&DirectSigner> {
        match self {
            SigningBackendAdapter::DirectSign(signer) => Some(signer),
            _ => None,
        }
    }

    pub fn as_challenge(&self) -> Option<&ChallengeIssuer> {
        match self {
            SigningBackendAdapter::ChallengeResponse(issuer) => Some(issuer),
            _ => None,
        }
    }
}
