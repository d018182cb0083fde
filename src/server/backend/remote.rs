//! Enrollment with an external authority.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::api::request::{IdentityKey, PendingToken};
use crate::api::template::TemplateName;
use crate::commons::crypto::Csr;

use super::{BackendError, IssuedCertificate, PollOutcome, SubmissionContext, SubmitOutcome};


//------------ ExistingRequest -----------------------------------------------

/// What an authority already has for a subject and template.
#[derive(Clone, Debug, PartialEq)]
pub enum ExistingRequest {
    /// A request awaiting a decision, with the hex SHA-256 of the public
    /// key in its CSR.
    Pending { token: PendingToken, key_thumbprint: String },
    Issued(IssuedCertificate),
}


//------------ EnrollmentAuthority -------------------------------------------

/// A remote enrollment service.
///
/// Whether a pending request is resolved by an automated check or by a
/// person clicking "approve" in a console is up to the service.
#[async_trait]
pub trait EnrollmentAuthority: Send + Sync {
    /// Requests the authority already knows for this subject and template.
    async fn find_existing(
        &self,
        subject: &str,
        template: &TemplateName,
    ) -> Result<Option<ExistingRequest>, BackendError>;

    async fn submit(&self, csr: &Csr, template: &TemplateName) -> Result<SubmitOutcome, BackendError>;

    async fn poll(&self, token: &PendingToken) -> Result<PollOutcome, BackendError>;
}


//------------ Outstanding ---------------------------------------------------

/// A pending submission and the key it asks to certify.
#[derive(Clone, Debug)]
struct Outstanding {
    token: PendingToken,
    key_thumbprint: String,
}


//------------ RemoteEnroller ------------------------------------------------

pub struct RemoteEnroller {
    name: String,
    authority: Arc<dyn EnrollmentAuthority>,

    /// Pending submissions made through this adapter, for authorities
    /// that cannot be queried.
    outstanding: Mutex<HashMap<IdentityKey, Outstanding>>,

    /// Submissions left pending at the authority for a key nobody holds
    /// any more.
    abandoned: Mutex<Vec<PendingToken>>,
}

impl RemoteEnroller {
    pub fn new(name: impl Into<String>, authority: Arc<dyn EnrollmentAuthority>) -> Self {
        RemoteEnroller {
            name: name.into(),
            authority,
            outstanding: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(vec![]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pending submissions the authority may still act on, but whose
    /// certificate nobody could use.
    pub fn abandoned(&self) -> Vec<PendingToken> {
        self.abandoned.lock().expect("poisoned lock").clone()
    }

    /// Submits a CSR, unless the authority already has a request for the
    /// same identity and key.
    ///
    /// A pending request for the identity under another key is never
    /// reused: what the authority issues for it would not match the key
    /// of this CSR.
    pub async fn submit(&self, csr: &Csr, ctx: &SubmissionContext) -> Result<SubmitOutcome, BackendError> {
        let identity = ctx.identity();
        let key_thumbprint = csr.key_thumbprint()?;

        let known = self.outstanding.lock().expect("poisoned lock").remove(&identity);
        if let Some(known) = known {
            if known.key_thumbprint == key_thumbprint {
                info!("Backend '{}' has pending submission {} for {}", self.name, known.token, identity);
                let token = known.token.clone();
                self.outstanding.lock().expect("poisoned lock").insert(identity, known);
                return Ok(SubmitOutcome::Pending(token));
            }
            self.abandon(&identity, known.token);
        }

        match self
            .authority
            .find_existing(&ctx.subject.common_name, &ctx.template.name)
            .await?
        {
            Some(ExistingRequest::Pending { token, key_thumbprint: pending_key }) if pending_key == key_thumbprint => {
                info!("Backend '{}' reports pending request {} for {}", self.name, token, identity);
                self.remember(identity, &token, key_thumbprint);
                return Ok(SubmitOutcome::Pending(token));
            }
            Some(ExistingRequest::Pending { token, .. }) => {
                if !self.abandoned.lock().expect("poisoned lock").contains(&token) {
                    self.abandon(&identity, token);
                }
            }
            Some(ExistingRequest::Issued(issued)) if issued.matches(csr) => {
                info!("Backend '{}' already issued for this key of {}", self.name, identity);
                return Ok(SubmitOutcome::Issued(issued));
            }
            Some(ExistingRequest::Issued(_)) => {
                debug!("Backend '{}' has an older certificate for {}, requesting a new one", self.name, identity);
            }
            None => {}
        }

        let outcome = self.authority.submit(csr, &ctx.template.name).await?;
        if let SubmitOutcome::Pending(token) = &outcome {
            self.remember(identity, token, key_thumbprint);
        }
        Ok(outcome)
    }

    pub async fn poll(&self, token: &PendingToken) -> Result<PollOutcome, BackendError> {
        let outcome = self.authority.poll(token).await?;
        if !matches!(outcome, PollOutcome::StillPending) {
            self.outstanding
                .lock()
                .expect("poisoned lock")
                .retain(|_, outstanding| &outstanding.token != token);
        }
        Ok(outcome)
    }

    fn remember(&self, identity: IdentityKey, token: &PendingToken, key_thumbprint: String) {
        self.outstanding
            .lock()
            .expect("poisoned lock")
            .insert(identity, Outstanding { token: token.clone(), key_thumbprint });
    }

    fn abandon(&self, identity: &IdentityKey, token: PendingToken) {
        warn!(
            "Backend '{}' keeps submission {} for {} pending under a key that was replaced, submitting anew",
            self.name, token, identity
        );
        self.abandoned.lock().expect("poisoned lock").push(token);
    }
}

impl fmt::Debug for RemoteEnroller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RemoteEnroller({})", self.name)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{self, FakeAuthority};

    #[tokio::test]
    async fn no_duplicate_submissions() {
        let authority = Arc::new(FakeAuthority::pending());
        let enroller = RemoteEnroller::new("est", authority.clone());
        let ctx = test::submission_context("dup.example.com", test::web_server_template("est"));
        let (_, csr) = test::csr_for("dup.example.com");

        let first = enroller.submit(&csr, &ctx).await.unwrap();
        let second = enroller.submit(&csr, &ctx).await.unwrap();
        assert!(matches!(first, SubmitOutcome::Pending(_)));
        assert_eq!(first, second);
        assert_eq!(authority.submissions(), 1);
    }

    #[tokio::test]
    async fn asks_authority_first() {
        let authority = Arc::new(FakeAuthority::pending());
        let enroller = RemoteEnroller::new("est", authority.clone());
        let ctx = test::submission_context("dup.example.com", test::web_server_template("est"));
        let (_, csr) = test::csr_for("dup.example.com");
        authority.set_existing(Some(ExistingRequest::Pending {
            token: PendingToken::new("elsewhere"),
            key_thumbprint: csr.key_thumbprint().unwrap(),
        }));

        assert_eq!(
            enroller.submit(&csr, &ctx).await.unwrap(),
            SubmitOutcome::Pending(PendingToken::new("elsewhere"))
        );
        assert_eq!(authority.submissions(), 0);
    }

    #[tokio::test]
    async fn new_key_is_submitted_anew() {
        let authority = Arc::new(FakeAuthority::pending());
        let enroller = RemoteEnroller::new("est", authority.clone());
        let ctx = test::submission_context("dup.example.com", test::web_server_template("est"));

        let (_, old_csr) = test::csr_for("dup.example.com");
        let SubmitOutcome::Pending(old) = enroller.submit(&old_csr, &ctx).await.unwrap() else {
            panic!("expected a pending submission");
        };

        let (key, csr) = test::csr_for("dup.example.com");
        let SubmitOutcome::Pending(new) = enroller.submit(&csr, &ctx).await.unwrap() else {
            panic!("expected a pending submission");
        };
        assert_ne!(old, new);
        assert_eq!(authority.submissions(), 2);
        assert_eq!(enroller.abandoned(), vec![old]);

        authority.approve_all();
        match enroller.poll(&new).await.unwrap() {
            PollOutcome::Issued(issued) => assert!(issued.certificate.matches_key(&key)),
            other => panic!("expected a certificate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pending_elsewhere_under_other_key() {
        let authority = Arc::new(FakeAuthority::pending());
        let enroller = RemoteEnroller::new("est", authority.clone());
        let ctx = test::submission_context("dup.example.com", test::web_server_template("est"));
        let (_, csr) = test::csr_for("dup.example.com");
        authority.set_existing(Some(ExistingRequest::Pending {
            token: PendingToken::new("before-restart"),
            key_thumbprint: "00".repeat(32),
        }));

        let outcome = enroller.submit(&csr, &ctx).await.unwrap();
        assert_ne!(outcome, SubmitOutcome::Pending(PendingToken::new("before-restart")));
        assert_eq!(authority.submissions(), 1);
        assert_eq!(enroller.abandoned(), vec![PendingToken::new("before-restart")]);
    }
}
