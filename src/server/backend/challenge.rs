//! Issuance gated on proving control of the subject.
//!
//! A submission yields a token. The subject host has to serve
//! `<token>.<key thumbprint>` at
//! `http://<subject>/.well-known/pki-validation/<token>`; every poll
//! checks for it and the local CA signs once it is there.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use rand::Rng;
use rand::distr::Alphanumeric;
use reqwest::StatusCode;

use crate::api::ca::CaId;
use crate::api::request::{IdentityKey, PendingToken};
use crate::commons::crypto::Csr;
use crate::commons::error::ErrorKind;
use crate::commons::util::httpclient;
use crate::constants::{CHALLENGE_TOKEN_LEN, CHALLENGE_VALIDITY_HOURS, CHALLENGE_WELL_KNOWN_PATH};
use crate::server::hierarchy::CaHierarchyManager;

use super::{BackendError, IssuedCertificate, PollOutcome, SubmissionContext, SubmitOutcome};


//------------ Challenge -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Challenge {
    pub token: String,

    /// The host that has to answer the challenge.
    pub subject: String,

    /// What the host has to serve.
    pub key_authorization: String,
    pub expires: DateTime<Utc>,
}

impl Challenge {
    fn new(subject: &str, csr: &Csr) -> Result<Self, BackendError> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(CHALLENGE_TOKEN_LEN)
            .map(char::from)
            .collect();
        let key_authorization = format!("{}.{}", token, csr.key_thumbprint()?);
        Ok(Challenge {
            token,
            subject: subject.to_string(),
            key_authorization,
            expires: Utc::now() + Duration::hours(CHALLENGE_VALIDITY_HOURS),
        })
    }

    /// The URI at which the subject has to serve the key authorization.
    pub fn uri(&self) -> String {
        format!("http://{}{}{}", self.subject, CHALLENGE_WELL_KNOWN_PATH, self.token)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }
}


//------------ ChallengeVerifier ---------------------------------------------

#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    /// Whether the subject answers the challenge right now.
    async fn verify(&self, challenge: &Challenge) -> Result<bool, BackendError>;
}


//------------ HttpChallengeVerifier -----------------------------------------

pub struct HttpChallengeVerifier {
    client: reqwest::Client,
}

impl HttpChallengeVerifier {
    pub fn new() -> Result<Self, BackendError> {
        let client = httpclient::client("http://").map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(HttpChallengeVerifier { client })
    }
}

#[async_trait]
impl ChallengeVerifier for HttpChallengeVerifier {
    async fn verify(&self, challenge: &Challenge) -> Result<bool, BackendError> {
        let uri = challenge.uri();
        // A host that is down or does not serve the token yet has simply
        // not answered the challenge yet.
        let res = match self.client.get(&uri).send().await {
            Ok(res) => res,
            Err(e) => {
                debug!("Challenge {} not reachable: {}", uri, e);
                return Ok(false);
            }
        };
        if res.status() != StatusCode::OK {
            debug!("Challenge {} answered {}", uri, res.status());
            return Ok(false);
        }
        let body = res.text().await.unwrap_or_default();
        Ok(body.trim() == challenge.key_authorization)
    }
}

impl fmt::Debug for HttpChallengeVerifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HttpChallengeVerifier")
    }
}


//------------ ChallengeIssuer -----------------------------------------------

struct Outstanding {
    identity: IdentityKey,
    challenge: Challenge,
    csr: String,
    ctx: SubmissionContext,
    issued: Option<IssuedCertificate>,
}

pub struct ChallengeIssuer {
    name: String,
    ca: CaId,
    hierarchy: Arc<CaHierarchyManager>,
    verifier: Arc<dyn ChallengeVerifier>,
    outstanding: Mutex<HashMap<PendingToken, Outstanding>>,
}

impl ChallengeIssuer {
    pub fn new(
        name: impl Into<String>,
        ca: CaId,
        hierarchy: Arc<CaHierarchyManager>,
        verifier: Arc<dyn ChallengeVerifier>,
    ) -> Self {
        ChallengeIssuer {
            name: name.into(),
            ca,
            hierarchy,
            verifier,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a challenge for the CSR, or hands back the outstanding one
    /// for the same subject, template and key.
    pub fn submit(&self, csr: &Csr, ctx: &SubmissionContext) -> Result<SubmitOutcome, BackendError> {
        let identity = ctx.identity();
        let thumbprint = csr.key_thumbprint()?;
        let mut outstanding = self.outstanding.lock().expect("poisoned lock");

        let existing = outstanding
            .iter()
            .find(|(_, o)| o.identity == identity)
            .map(|(token, o)| (token.clone(), o.challenge.key_authorization.ends_with(&thumbprint)));
        match existing {
            Some((token, true)) => {
                info!("Backend '{}' reuses challenge {} for {}", self.name, token, identity);
                return Ok(SubmitOutcome::Pending(token));
            }
            Some((token, false)) => {
                // A new key needs a new key authorization.
                outstanding.remove(&token);
            }
            None => {}
        }

        let challenge = Challenge::new(&ctx.subject.common_name, csr)?;
        info!(
            "Request {} must serve '{}' at {}",
            ctx.request,
            challenge.key_authorization,
            challenge.uri()
        );
        let token = PendingToken::new(challenge.token.clone());
        outstanding.insert(
            token.clone(),
            Outstanding { identity, challenge, csr: csr.to_pem()?, ctx: ctx.clone(), issued: None },
        );
        Ok(SubmitOutcome::Pending(token))
    }

    pub async fn poll(&self, token: &PendingToken) -> Result<PollOutcome, BackendError> {
        let challenge = {
            let outstanding = self.outstanding.lock().expect("poisoned lock");
            let entry = outstanding
                .get(token)
                .ok_or_else(|| BackendError::UnknownToken(token.clone()))?;
            if let Some(issued) = &entry.issued {
                return Ok(PollOutcome::Issued(issued.clone()));
            }
            entry.challenge.clone()
        };

        if challenge.is_expired() {
            self.outstanding.lock().expect("poisoned lock").remove(token);
            return Ok(PollOutcome::Rejected(format!("challenge for '{}' expired", challenge.subject)));
        }
        if !self.verifier.verify(&challenge).await? {
            return Ok(PollOutcome::StillPending);
        }

        let mut outstanding = self.outstanding.lock().expect("poisoned lock");
        let Some(entry) = outstanding.get_mut(token) else {
            return Err(BackendError::UnknownToken(token.clone()));
        };
        let csr = Csr::from_pem(entry.csr.as_bytes())?;
        let issued = self.hierarchy.signer(&self.ca).and_then(|signer| {
            let certificate = signer.issue(&csr, &entry.ctx.subject, &entry.ctx.sans, &entry.ctx.template)?;
            Ok(IssuedCertificate { certificate, chain: vec![signer.certificate().clone()] })
        });
        match issued {
            Ok(issued) => {
                info!("Challenge for '{}' answered, certificate issued", challenge.subject);
                entry.issued = Some(issued.clone());
                Ok(PollOutcome::Issued(issued))
            }
            Err(e) if matches!(e.kind(), ErrorKind::Hierarchy | ErrorKind::Validation) => {
                outstanding.remove(token);
                Ok(PollOutcome::Rejected(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The challenge behind a token, for whoever deploys it.
    pub fn challenge(&self, token: &PendingToken) -> Option<Challenge> {
        self.outstanding
            .lock()
            .expect("poisoned lock")
            .get(token)
            .map(|o| o.challenge.clone())
    }
}

impl fmt::Debug for ChallengeIssuer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChallengeIssuer({})", self.name)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{self, FakeVerifier};

    #[tokio::test]
    async fn issues_once_answered() {
        let (hierarchy, issuing) = test::hierarchy();
        let verifier = Arc::new(FakeVerifier::default());
        let issuer = ChallengeIssuer::new("http-01", issuing, hierarchy, verifier.clone());
        let ctx = test::submission_context("www.example.com", test::web_server_template("http-01"));
        let (_, csr) = test::csr_for("www.example.com");

        let SubmitOutcome::Pending(token) = issuer.submit(&csr, &ctx).unwrap() else {
            panic!("expected a challenge");
        };
        let challenge = issuer.challenge(&token).unwrap();
        assert_eq!(challenge.uri(), format!("http://www.example.com/.well-known/pki-validation/{}", token.as_str()));
        assert!(challenge.key_authorization.starts_with(token.as_str()));

        // Same key, same challenge.
        assert_eq!(issuer.submit(&csr, &ctx).unwrap(), SubmitOutcome::Pending(token.clone()));

        assert_eq!(issuer.poll(&token).await.unwrap(), PollOutcome::StillPending);
        verifier.answer(&challenge.key_authorization);
        match issuer.poll(&token).await.unwrap() {
            PollOutcome::Issued(issued) => assert!(issued.matches(&csr)),
            other => panic!("unexpected {}", other),
        }
    }

    #[tokio::test]
    async fn new_key_new_challenge() {
        let (hierarchy, issuing) = test::hierarchy();
        let issuer = ChallengeIssuer::new("http-01", issuing, hierarchy, Arc::new(FakeVerifier::default()));
        let ctx = test::submission_context("www.example.com", test::web_server_template("http-01"));
        let (_, first) = test::csr_for("www.example.com");
        let (_, second) = test::csr_for("www.example.com");

        let SubmitOutcome::Pending(old) = issuer.submit(&first, &ctx).unwrap() else { panic!() };
        let SubmitOutcome::Pending(new) = issuer.submit(&second, &ctx).unwrap() else { panic!() };
        assert_ne!(old, new);
        assert!(matches!(issuer.poll(&old).await, Err(BackendError::UnknownToken(_))));
    }
}
