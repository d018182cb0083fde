//! Signing with a CA of the local hierarchy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::api::ca::CaId;
use crate::api::request::{IdentityKey, PendingToken, RequestId, SubjectName};
use crate::api::template::{EnrollmentMode, TemplateName};
use crate::commons::crypto::Csr;
use crate::commons::error::{Error, ErrorKind};
use crate::commons::storage::KeyValueStore;
use crate::commons::{CustodyEmptyResult, CustodyResult};
use crate::constants::DIRECT_LEDGER_NS;
use crate::server::hierarchy::CaHierarchyManager;

use super::{BackendError, IssuedCertificate, PollOutcome, SubmissionContext, SubmitOutcome};


//------------ Submission ----------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
enum Submission {
    /// Waiting for an operator.
    Pending { csr: String, ctx: SubmissionContext },
    Issued(IssuedCertificate),
    Denied(String),
}

/// Kept under its token, so that decisions survive a restart.
#[derive(Debug, Deserialize, Serialize)]
struct LedgerEntry {
    backend: String,
    identity: IdentityKey,
    request: RequestId,
    token: PendingToken,
    submission: Submission,
}


//------------ DirectSigner --------------------------------------------------

/// Issues with a local CA through its exclusively owned signer.
///
/// Templates in manual enrollment mode are held until an operator
/// approves or denies them.
#[derive(Debug)]
pub struct DirectSigner {
    name: String,
    ca: CaId,
    hierarchy: Arc<CaHierarchyManager>,

    /// The last submission per identity.
    ledger: Mutex<HashMap<IdentityKey, LedgerEntry>>,
    store: KeyValueStore,
}

impl DirectSigner {
    /// Picks up the submissions this backend made before a restart.
    pub fn build(
        name: impl Into<String>,
        ca: CaId,
        hierarchy: Arc<CaHierarchyManager>,
        storage_uri: &Url,
    ) -> CustodyResult<Self> {
        let name = name.into();
        let store = KeyValueStore::create(storage_uri, DIRECT_LEDGER_NS)?;
        let ledger: HashMap<_, _> = store
            .values::<LedgerEntry>()?
            .into_iter()
            .filter(|entry| entry.backend == name)
            .map(|entry| (entry.identity.clone(), entry))
            .collect();
        if !ledger.is_empty() {
            info!("Backend '{}' resumes {} submissions", name, ledger.len());
        }
        Ok(DirectSigner { name, ca, hierarchy, ledger: Mutex::new(ledger), store })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ca(&self) -> &CaId {
        &self.ca
    }

    pub fn submit(&self, csr: &Csr, ctx: &SubmissionContext) -> Result<SubmitOutcome, BackendError> {
        let identity = ctx.identity();
        let mut ledger = self.ledger.lock().expect("poisoned lock");

        if let Some(entry) = ledger.get_mut(&identity) {
            match &entry.submission {
                Submission::Pending { .. } => {
                    // Still undecided: carry on with this submission, but
                    // make sure an approval certifies the newest key.
                    info!(
                        "Backend '{}' already has pending submission {} for {}",
                        self.name, entry.token, identity
                    );
                    entry.request = ctx.request;
                    entry.submission = Submission::Pending { csr: csr.to_pem()?, ctx: ctx.clone() };
                    self.save(entry)?;
                    return Ok(SubmitOutcome::Pending(entry.token.clone()));
                }
                Submission::Issued(issued) if entry.request == ctx.request && issued.matches(csr) => {
                    info!("Backend '{}' already issued for request {}", self.name, ctx.request);
                    return Ok(SubmitOutcome::Issued(issued.clone()));
                }
                _ => {}
            }
        }

        let token = PendingToken::new(format!("direct-{}", Uuid::new_v4()));
        let (submission, outcome) = if ctx.template.enrollment_mode == EnrollmentMode::Manual {
            info!(
                "Request {} for '{}' awaits approval at backend '{}' ({})",
                ctx.request, ctx.subject.common_name, self.name, token
            );
            (
                Submission::Pending { csr: csr.to_pem()?, ctx: ctx.clone() },
                SubmitOutcome::Pending(token.clone()),
            )
        } else {
            match self.sign(csr, ctx)? {
                Ok(issued) => (Submission::Issued(issued.clone()), SubmitOutcome::Issued(issued)),
                Err(reason) => (Submission::Denied(reason.clone()), SubmitOutcome::Rejected(reason)),
            }
        };

        let entry = LedgerEntry {
            backend: self.name.clone(),
            identity: identity.clone(),
            request: ctx.request,
            token,
            submission,
        };
        self.save(&entry)?;
        if let Some(replaced) = ledger.insert(identity, entry) {
            self.store.delete(replaced.token.as_str()).map_err(Error::from)?;
        }
        Ok(outcome)
    }

    pub fn poll(&self, token: &PendingToken) -> Result<PollOutcome, BackendError> {
        let ledger = self.ledger.lock().expect("poisoned lock");
        let entry = ledger
            .values()
            .find(|entry| &entry.token == token)
            .ok_or_else(|| BackendError::UnknownToken(token.clone()))?;

        Ok(match &entry.submission {
            Submission::Pending { .. } => PollOutcome::StillPending,
            Submission::Issued(issued) => PollOutcome::Issued(issued.clone()),
            Submission::Denied(reason) => PollOutcome::Rejected(reason.clone()),
        })
    }

    /// Signs a submission that waits for approval.
    pub fn approve(&self, token: &PendingToken) -> CustodyEmptyResult {
        let mut ledger = self.ledger.lock().expect("poisoned lock");
        let entry = Self::pending_entry(&mut ledger, token)?;
        let Submission::Pending { csr, ctx } = &entry.submission else {
            return Err(Error::invalid_request(format!("submission {} is not pending", token)));
        };

        let csr = Csr::from_pem(csr.as_bytes())?;
        entry.submission = match self.sign(&csr, ctx)? {
            Ok(issued) => {
                info!("Approved submission {} for '{}'", token, ctx.subject.common_name);
                Submission::Issued(issued)
            }
            Err(reason) => Submission::Denied(reason),
        };
        self.save(entry)
    }

    pub fn deny(&self, token: &PendingToken, reason: &str) -> CustodyEmptyResult {
        let mut ledger = self.ledger.lock().expect("poisoned lock");
        let entry = Self::pending_entry(&mut ledger, token)?;
        if !matches!(entry.submission, Submission::Pending { .. }) {
            return Err(Error::invalid_request(format!("submission {} is not pending", token)));
        }
        info!("Denied submission {}: {}", token, reason);
        entry.submission = Submission::Denied(reason.to_string());
        self.save(entry)
    }

    /// Submissions waiting for an operator.
    pub fn pending(&self) -> Vec<(PendingToken, SubjectName, TemplateName)> {
        let ledger = self.ledger.lock().expect("poisoned lock");
        let mut res: Vec<_> = ledger
            .values()
            .filter_map(|entry| match &entry.submission {
                Submission::Pending { ctx, .. } => {
                    Some((entry.token.clone(), ctx.subject.clone(), ctx.template.name.clone()))
                }
                _ => None,
            })
            .collect();
        res.sort_by(|a, b| a.1.common_name.cmp(&b.1.common_name));
        res
    }

    fn save(&self, entry: &LedgerEntry) -> CustodyEmptyResult {
        self.store.store(entry.token.as_str(), entry)?;
        Ok(())
    }

    fn pending_entry<'a>(
        ledger: &'a mut HashMap<IdentityKey, LedgerEntry>,
        token: &PendingToken,
    ) -> CustodyResult<&'a mut LedgerEntry> {
        ledger
            .values_mut()
            .find(|entry| &entry.token == token)
            .ok_or_else(|| Error::invalid_request(format!("unknown submission {}", token)))
    }

    /// Issues, or returns why the CA refuses to.
    fn sign(&self, csr: &Csr, ctx: &SubmissionContext) -> Result<Result<IssuedCertificate, String>, BackendError> {
        let issued = self
            .hierarchy
            .signer(&self.ca)
            .and_then(|signer| {
                let certificate = signer.issue(csr, &ctx.subject, &ctx.sans, &ctx.template)?;
                Ok(IssuedCertificate { certificate, chain: vec![signer.certificate().clone()] })
            });

        match issued {
            Ok(issued) => {
                debug!("Backend '{}' signed for request {}", self.name, ctx.request);
                Ok(Ok(issued))
            }
            Err(e) if Self::is_refusal(&e) => Ok(Err(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn is_refusal(e: &Error) -> bool {
        matches!(e.kind(), ErrorKind::Hierarchy | ErrorKind::Validation | ErrorKind::NotFound)
    }
}


//------------ Tests ---------------------------------------------------------
