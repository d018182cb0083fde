//! Drives enrollment requests through their state machine.
//!
//! A request is driven by one task at a time. That task holds the lock of
//! the request's identity (subject and template) for as long as the
//! request is not terminal, which includes waiting for a backend to
//! approve it. A second request for the same identity therefore queues
//! behind the first, and usually finds the first one's certificate when
//! it gets its turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use url::Url;

use crate::api::audit::{AuditAction, AuditEvent};
use crate::api::request::{
    EnrollmentRequest, FailureReason, IdentityKey, NewEnrollment, PendingToken, RequestId, RequestState,
    SubjectAltName, SubjectName,
};
use crate::api::template::{CertificateTemplate, SubjectNaming};
use crate::commons::actor::Actor;
use crate::commons::crypto::{ChainVerifier, Csr, KeyPair};
use crate::commons::error::{Error, ErrorKind};
use crate::commons::storage::KeyValueStore;
use crate::commons::{CustodyEmptyResult, CustodyResult};
use crate::config::PipelineConfig;
use crate::constants::{KEYS_NS, REQUESTS_NS};
use crate::server::audit::AuditLog;
use crate::server::backend::{
    BackendError, IssuedCertificate, PollOutcome, SigningBackendAdapter, SubmissionContext, SubmitOutcome,
};
use crate::server::hierarchy::CaHierarchyManager;
use crate::server::keys::KeyVault;
use crate::server::locks::{KeyedGuard, KeyedLocks};
use crate::server::targets::TargetRegistry;
use crate::server::templates::TemplateRegistry;


//------------ CertificateRequestPipeline ------------------------------------

pub struct CertificateRequestPipeline {
    config: PipelineConfig,
    requests: KeyValueStore,
    keys: KeyVault,
    hierarchy: Arc<CaHierarchyManager>,
    templates: Arc<TemplateRegistry>,
    targets: Arc<TargetRegistry>,
    backends: HashMap<String, Arc<SigningBackendAdapter>>,
    audit: AuditLog,

    /// At most one request per identity is being driven.
    identities: KeyedLocks<IdentityKey>,

    /// Cancellation flags of the requests currently being driven.
    drivers: Mutex<HashMap<RequestId, watch::Sender<bool>>>,

    /// State updates for whoever waits on a request.
    states: Mutex<HashMap<RequestId, watch::Sender<RequestState>>>,
}

impl CertificateRequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: PipelineConfig,
        storage_uri: &Url,
        hierarchy: Arc<CaHierarchyManager>,
        templates: Arc<TemplateRegistry>,
        targets: Arc<TargetRegistry>,
        backends: Vec<SigningBackendAdapter>,
        audit: AuditLog,
    ) -> CustodyResult<Self> {
        let backends = backends
            .into_iter()
            .map(|backend| (backend.name().to_string(), Arc::new(backend)))
            .collect();

        Ok(CertificateRequestPipeline {
            config,
            requests: KeyValueStore::create(storage_uri, REQUESTS_NS)?,
            keys: KeyVault::create(storage_uri, KEYS_NS)?,
            hierarchy,
            templates,
            targets,
            backends,
            audit,
            identities: KeyedLocks::default(),
            drivers: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn backend(&self, name: &str) -> CustodyResult<Arc<SigningBackendAdapter>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BackendUnknown(name.to_string()))
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// The vault holding request keys, for distribution.
    pub fn keys(&self) -> &KeyVault {
        &self.keys
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    pub fn hierarchy(&self) -> &Arc<CaHierarchyManager> {
        &self.hierarchy
    }
}

/// # Requests
///
impl CertificateRequestPipeline {
    /// Validates a new enrollment and stores it as drafted.
    pub fn submit(&self, new: NewEnrollment, actor: &Actor) -> CustodyResult<RequestId> {
        let mut new = new;
        new.validate()?;

        let template = self.templates.get(&new.template)?;
        if !self.backends.contains_key(&template.backend) {
            return Err(Error::BackendUnknown(template.backend.clone()));
        }
        for target in &new.targets {
            self.targets.get(target)?;
        }
        new.targets.sort();
        new.targets.dedup();
        if let Some(superseded) = new.supersedes {
            self.get(superseded)?;
        }
        if new.sans.is_empty() {
            new.sans.insert(SubjectAltName::Dns(new.subject.common_name.clone()));
        }

        let id = RequestId::generate();
        let request = EnrollmentRequest::new(id, new, template.reference(), template.backend.clone());
        self.save(&request)?;
        self.audit.record(
            actor,
            AuditAction::RequestCreated {
                subject: request.subject.common_name.clone(),
                template: request.template.clone(),
            },
            Some(id),
        );
        info!(
            "Request {} created for '{}' with template {} by {}",
            id, request.subject.common_name, request.template, actor
        );
        Ok(id)
    }

    /// Submits and drives a request until it rests.
    pub async fn enroll(self: &Arc<Self>, new: NewEnrollment, actor: &Actor) -> CustodyResult<EnrollmentRequest> {
        let id = self.submit(new, actor)?;
        self.process(id, actor).await?;
        self.get(id)
    }

    pub fn get(&self, id: RequestId) -> CustodyResult<EnrollmentRequest> {
        self.requests
            .get(&id.storage_key())?
            .ok_or(Error::RequestUnknown(id))
    }

    /// All requests, oldest first.
    pub fn list(&self) -> CustodyResult<Vec<EnrollmentRequest>> {
        let mut requests: Vec<EnrollmentRequest> = self.requests.values()?;
        requests.sort_by_key(|request| request.created);
        Ok(requests)
    }

    pub fn history(&self, id: RequestId) -> Vec<AuditEvent> {
        self.audit.for_request(id)
    }

    /// Drives the request as an independent task.
    pub fn spawn(self: &Arc<Self>, id: RequestId, actor: &Actor) -> JoinHandle<CustodyResult<RequestState>> {
        let pipeline = self.clone();
        let actor = actor.clone();
        tokio::spawn(async move { pipeline.process(id, &actor).await })
    }

    /// Picks up every request that is not terminal, e.g. after a restart.
    pub fn resume(self: &Arc<Self>, actor: &Actor) -> CustodyResult<usize> {
        let mut resumed = 0;
        for request in self.list()?.into_iter().filter(|request| !request.is_terminal()) {
            debug!("Resuming request {} in state {}", request.id, request.state);
            self.spawn(request.id, actor);
            resumed += 1;
        }
        if resumed > 0 {
            info!("Resumed {} unfinished request(s)", resumed);
        }
        Ok(resumed)
    }

    /// Drives a request until it is completed, failed, or waits for its
    /// backend to decide.
    ///
    /// When the backend needs time, polling continues in the background
    /// and this returns `PendingApproval`. If another task drives the
    /// request already, this waits for that task to let it rest.
    pub async fn process(self: &Arc<Self>, id: RequestId, actor: &Actor) -> CustodyResult<RequestState> {
        let request = self.get(id)?;
        if request.is_terminal() {
            return Ok(request.state);
        }

        let Some((driver, mut cancel)) = self.register_driver(id) else {
            debug!("Request {} is driven elsewhere, waiting for it", id);
            return self.wait_until(id, None, RequestState::is_resting).await;
        };

        let identity = request.identity();
        let guard = match self.identities.try_lock(&identity) {
            Some(guard) => guard,
            None => {
                info!("Request {} queued behind another request for {}", id, identity);
                tokio::select! {
                    guard = self.identities.lock(&identity) => guard,
                    _ = cancelled(&mut cancel) => {
                        let request = self.get(id)?;
                        return self.fail(request, Error::Cancelled(id), actor);
                    }
                }
            }
        };

        let state = self.drive(id, actor, &mut cancel).await?;
        if state == RequestState::PendingApproval {
            self.spawn_poller(id, actor.clone(), guard, driver, cancel);
        }
        Ok(state)
    }

    /// Cancels a request that is not terminal.
    ///
    /// A request that is being driven stops at its next step. A backend
    /// submission that is outstanding is recorded as abandoned.
    pub fn cancel(&self, id: RequestId, actor: &Actor) -> CustodyEmptyResult {
        let drivers = self.drivers.lock().expect("poisoned lock");
        let request = self.get(id)?;
        if request.is_terminal() {
            return Err(Error::InvalidTransition {
                request: id,
                from: request.state,
                to: RequestState::Failed(FailureReason::Cancelled),
            });
        }

        info!("Cancelling request {} on behalf of {}", id, actor);
        if let Some(flag) = drivers.get(&id) {
            flag.send_replace(true);
            return Ok(());
        }

        // Nobody drives it, and holding the drivers lock keeps it that way
        // while the request is failed here.
        self.fail(request, Error::Cancelled(id), actor)?;
        Ok(())
    }

    /// Operator approval of a manual enrollment at a local CA.
    pub fn approve(&self, id: RequestId, actor: &Actor) -> CustodyEmptyResult {
        let (token, backend) = self.pending_at_local_ca(id)?;
        if let Some(signer) = backend.as_direct() {
            signer.approve(&token)?;
        }
        info!("Request {} approved by {}", id, actor);
        Ok(())
    }

    pub fn deny(&self, id: RequestId, reason: &str, actor: &Actor) -> CustodyEmptyResult {
        let (token, backend) = self.pending_at_local_ca(id)?;
        if let Some(signer) = backend.as_direct() {
            signer.deny(&token, reason)?;
        }
        info!("Request {} denied by {}: {}", id, actor, reason);
        Ok(())
    }

    fn pending_at_local_ca(&self, id: RequestId) -> CustodyResult<(PendingToken, Arc<SigningBackendAdapter>)> {
        let request = self.get(id)?;
        let token = request
            .pending
            .clone()
            .ok_or_else(|| Error::invalid_request(format!("request {} is not awaiting approval", id)))?;
        let backend = self.backend(&request.backend)?;
        if backend.as_direct().is_none() {
            return Err(Error::invalid_request(format!(
                "backend '{}' decides on its own requests",
                request.backend
            )));
        }
        Ok((token, backend))
    }

    /// Waits until the request rests, or the timeout passes.
    ///
    /// Returns the state at that point.
    pub async fn wait_for_rest(&self, id: RequestId, timeout: Duration) -> CustodyResult<RequestState> {
        self.wait_until(id, Some(timeout), RequestState::is_resting).await
    }

    pub async fn wait_for_terminal(&self, id: RequestId, timeout: Duration) -> CustodyResult<RequestState> {
        self.wait_until(id, Some(timeout), RequestState::is_terminal).await
    }

    async fn wait_until(
        &self,
        id: RequestId,
        timeout: Option<Duration>,
        done: fn(&RequestState) -> bool,
    ) -> CustodyResult<RequestState> {
        let mut rx = self.subscribe(id)?;
        let waited = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx.wait_for(done))
                .await
                .ok()
                .and_then(|res| res.ok().map(|state| *state)),
            None => rx.wait_for(done).await.ok().map(|state| *state),
        };
        match waited {
            Some(state) => Ok(state),
            None => Ok(self.get(id)?.state),
        }
    }

    /// Gives up polling submissions of failed requests.
    ///
    /// A backend that issued after all is recorded as an orphaned
    /// issuance, unless some request holds that certificate anyway.
    /// Returns how many abandoned submissions were resolved.
    pub async fn reconcile_abandoned(&self, actor: &Actor) -> CustodyResult<usize> {
        let requests = self.list()?;
        let mut resolved = 0;

        for mut request in requests.iter().filter(|request| request.abandoned.is_some()).cloned() {
            let Some(token) = request.abandoned.clone() else { continue };
            let Ok(backend) = self.backend(&request.backend) else { continue };

            match backend.poll(&token).await {
                Ok(PollOutcome::Issued(issued)) => {
                    let thumbprint = issued.certificate.thumbprint().ok();
                    let known = thumbprint
                        .as_ref()
                        .map(|thumbprint| requests.iter().any(|r| r.thumbprint.as_ref() == Some(thumbprint)))
                        .unwrap_or(false);
                    if !known {
                        warn!(
                            "Backend '{}' issued a certificate for abandoned request {}, needs manual reconciliation",
                            request.backend, request.id
                        );
                        self.audit.append(
                            AuditEvent::new(
                                actor,
                                AuditAction::OrphanedIssuance { backend: request.backend.clone(), thumbprint },
                                Some(request.id),
                            )
                            .with_detail(format!("submission {}", token)),
                        );
                    }
                }
                Ok(PollOutcome::Rejected(reason)) => {
                    debug!("Abandoned submission {} was rejected: {}", token, reason);
                }
                Err(BackendError::UnknownToken(_)) => {
                    debug!("Backend '{}' no longer knows submission {}", request.backend, token);
                }
                Ok(PollOutcome::StillPending) => continue,
                Err(e) => {
                    debug!("Cannot reconcile submission {} yet: {}", token, e);
                    continue;
                }
            }

            request.abandoned = None;
            self.save(&request)?;
            resolved += 1;
        }
        Ok(resolved)
    }
}

/// # Driving
///
impl CertificateRequestPipeline {
    /// Takes the request through its steps until it rests.
    async fn drive(
        &self,
        id: RequestId,
        actor: &Actor,
        cancel: &mut watch::Receiver<bool>,
    ) -> CustodyResult<RequestState> {
        loop {
            let mut request = self.get(id)?;
            if request.state.is_resting() {
                return Ok(request.state);
            }
            if *cancel.borrow() {
                return self.fail(request, Error::Cancelled(id), actor);
            }

            trace!("Request {} at {}", id, request.state);
            let step = match request.state {
                RequestState::Drafted => self.generate_key(&mut request, actor),
                RequestState::KeyGenerated => self.create_csr(&mut request, actor),
                RequestState::CsrCreated => self.submit_csr(&mut request, actor, cancel).await,
                RequestState::Submitted => self.resume_submitted(&mut request, actor),
                RequestState::Retrying => self.retry(&mut request, actor, cancel).await,
                RequestState::Issued => self.retrieve(&mut request, actor),
                RequestState::Retrieved => self.build_chain(&mut request, actor),
                RequestState::ChainBuilt => self.verify(&mut request, actor),
                RequestState::Verified => self.complete(&mut request, actor),
                RequestState::Rejected => Err(Error::Rejected("rejected by the backend".into())),
                RequestState::PendingApproval | RequestState::Completed | RequestState::Failed(_) => {
                    return Ok(request.state);
                }
            };

            if let Err(err) = step {
                let request = self.get(id)?;
                if !request.is_terminal() {
                    self.fail(request, err, actor)?;
                }
            }
        }
    }

    /// Drafted: reuse a certificate that already satisfies the request, or
    /// generate a key.
    fn generate_key(&self, request: &mut EnrollmentRequest, actor: &Actor) -> CustodyEmptyResult {
        let template = self.templates.get_version(&request.template)?;

        if let Some(existing) = self.find_reusable(request, &template)? {
            info!(
                "Request {} reuses the certificate of completed request {} for '{}'",
                request.id, existing.id, request.subject.common_name
            );
            request.certificate = existing.certificate;
            request.chain = existing.chain;
            request.thumbprint = existing.thumbprint;
            request.not_after = existing.not_after;
            request.key_ref = existing.key_ref;
            request.reuses = Some(existing.id);
            return self.transition(request, RequestState::Completed, actor);
        }

        let key = self.new_key(request, &template)?;
        debug!("Generated {} bit key for request {}", key.strength(), request.id);
        self.transition(request, RequestState::KeyGenerated, actor)
    }

    /// KeyGenerated: build the CSR.
    fn create_csr(&self, request: &mut EnrollmentRequest, actor: &Actor) -> CustodyEmptyResult {
        let template = self.templates.get_version(&request.template)?;
        let key = self.request_key(request)?;
        let csr = Csr::build(&key, &effective_subject(&request.subject, &template), &request.sans)?;
        request.csr = Some(csr.to_pem()?);
        self.transition(request, RequestState::CsrCreated, actor)
    }

    /// CsrCreated: hand the CSR to the backend.
    ///
    /// A submission in progress is not interrupted by cancellation: the
    /// backend may act on it anyway, so its answer is needed to record
    /// what was left behind.
    async fn submit_csr(
        &self,
        request: &mut EnrollmentRequest,
        actor: &Actor,
        cancel: &mut watch::Receiver<bool>,
    ) -> CustodyEmptyResult {
        let template = self.templates.get_version(&request.template)?;
        let backend = self.backend(&request.backend)?;
        let csr = self.request_csr(request)?;
        let ctx = SubmissionContext {
            request: request.id,
            subject: effective_subject(&request.subject, &template),
            sans: request.sans.clone(),
            template,
        };

        request.attempts += 1;
        self.transition(request, RequestState::Submitted, actor)?;
        self.audit.record(
            actor,
            AuditAction::BackendSubmitted { backend: request.backend.clone(), attempt: request.attempts },
            Some(request.id),
        );
        info!(
            "Request {} submitted to backend '{}' (attempt {})",
            request.id, request.backend, request.attempts
        );

        let result = backend.submit(&csr, &ctx).await;
        self.record_response(request, actor, &result);

        if *cancel.borrow() {
            match result {
                Ok(SubmitOutcome::Issued(issued)) => self.record_orphan(request, &issued, actor),
                Ok(SubmitOutcome::Pending(token)) => request.pending = Some(token),
                _ => {}
            }
            let id = request.id;
            self.fail(request.clone(), Error::Cancelled(id), actor)?;
            return Ok(());
        }

        match result {
            Ok(SubmitOutcome::Issued(issued)) => self.issued(request, issued, actor),
            Ok(SubmitOutcome::Pending(token)) => {
                info!("Request {} awaits approval at '{}' as {}", request.id, request.backend, token);
                request.pending = Some(token);
                request.pending_since = Some(Utc::now());
                self.transition(request, RequestState::PendingApproval, actor)
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                self.transition(request, RequestState::Rejected, actor)?;
                Err(Error::Rejected(reason))
            }
            Err(e) => self.backend_failed(request, e, actor),
        }
    }

    /// Submitted, found after a restart: whether the backend got the CSR
    /// is unknown, so it is submitted again with a new key.
    fn resume_submitted(&self, request: &mut EnrollmentRequest, actor: &Actor) -> CustodyEmptyResult {
        self.backend_failed(
            request,
            BackendError::Unreachable("no answer recorded for the last submission".into()),
            actor,
        )
    }

    /// Retrying: wait, then start over with a fresh key and CSR.
    async fn retry(
        &self,
        request: &mut EnrollmentRequest,
        actor: &Actor,
        cancel: &mut watch::Receiver<bool>,
    ) -> CustodyEmptyResult {
        tokio::select! {
            _ = sleep(self.config.retry_delay()) => {}
            _ = cancelled(cancel) => return Ok(()),
        }

        let template = self.templates.get_version(&request.template)?;
        if let Some(old) = request.key_ref.take() {
            self.keys.delete(&old)?;
        }
        let key = self.new_key(request, &template)?;
        let csr = Csr::build(&key, &effective_subject(&request.subject, &template), &request.sans)?;
        request.csr = Some(csr.to_pem()?);
        self.transition(request, RequestState::CsrCreated, actor)
    }

    /// Issued: check that the certificate is for the request's key.
    fn retrieve(&self, request: &mut EnrollmentRequest, actor: &Actor) -> CustodyEmptyResult {
        let certificate = request
            .certificate()?
            .ok_or_else(|| Error::custom(format!("request {} is issued but has no certificate", request.id)))?;
        let key = self.request_key(request)?;
        if !certificate.matches_key(&key) {
            return Err(Error::ChainValidation(format!(
                "certificate issued for request {} does not match its key",
                request.id
            )));
        }
        request.thumbprint = Some(certificate.thumbprint()?);
        request.not_after = Some(certificate.info()?.not_after);
        self.transition(request, RequestState::Retrieved, actor)
    }

    /// Retrieved: the chain as the hierarchy knows it.
    fn build_chain(&self, request: &mut EnrollmentRequest, actor: &Actor) -> CustodyEmptyResult {
        let certificate = request
            .certificate()?
            .ok_or_else(|| Error::custom(format!("request {} has no certificate", request.id)))?;
        let chain = self.hierarchy.chain_for(&certificate)?;
        request.chain = chain
            .iter()
            .skip(1)
            .map(|cert| cert.to_pem())
            .collect::<CustodyResult<Vec<_>>>()?;
        self.transition(request, RequestState::ChainBuilt, actor)
    }

    /// ChainBuilt: path validation against the trust anchors.
    fn verify(&self, request: &mut EnrollmentRequest, actor: &Actor) -> CustodyEmptyResult {
        let template = self.templates.get_version(&request.template)?;
        let chain = request.full_chain()?;
        let anchors = self.hierarchy.trust_anchors();
        ChainVerifier::new(&anchors).verify(&chain, Some(&template), Utc::now())?;

        let cn = chain.first().and_then(|leaf| leaf.subject_cn()).unwrap_or_default();
        if !cn.eq_ignore_ascii_case(&request.subject.common_name) {
            return Err(Error::ChainValidation(format!(
                "certificate is for '{}', not '{}'",
                cn, request.subject.common_name
            )));
        }
        self.transition(request, RequestState::Verified, actor)
    }

    fn complete(&self, request: &mut EnrollmentRequest, actor: &Actor) -> CustodyEmptyResult {
        self.transition(request, RequestState::Completed, actor)?;
        info!(
            "Request {} completed, certificate {} for '{}' valid until {}",
            request.id,
            request.thumbprint.as_ref().map(|t| t.to_string()).unwrap_or_default(),
            request.subject.common_name,
            request.not_after.map(|t| t.to_rfc3339()).unwrap_or_default()
        );
        Ok(())
    }

    fn issued(&self, request: &mut EnrollmentRequest, issued: IssuedCertificate, actor: &Actor) -> CustodyEmptyResult {
        request.certificate = Some(issued.certificate.to_pem()?);
        request.chain = issued
            .chain
            .iter()
            .map(|cert| cert.to_pem())
            .collect::<CustodyResult<Vec<_>>>()?;
        request.pending = None;
        self.transition(request, RequestState::Issued, actor)
    }

    /// Transient failures are retried until attempts run out.
    fn backend_failed(&self, request: &mut EnrollmentRequest, err: BackendError, actor: &Actor) -> CustodyEmptyResult {
        let err = Error::Backend(err);
        if err.is_transient() && request.attempts < self.config.max_attempts {
            warn!(
                "Request {} attempt {} of {} failed, will retry: {}",
                request.id, request.attempts, self.config.max_attempts, err
            );
            self.transition(request, RequestState::Retrying, actor)
        } else {
            Err(err)
        }
    }

    fn record_response<T: std::fmt::Display>(
        &self,
        request: &EnrollmentRequest,
        actor: &Actor,
        result: &Result<T, BackendError>,
    ) {
        let action = |response: String| AuditAction::BackendResponse { backend: request.backend.clone(), response };
        let event = match result {
            Ok(outcome) => AuditEvent::new(actor, action(outcome.to_string()), Some(request.id)),
            Err(e) => AuditEvent::new(actor, action(e.to_string()), Some(request.id))
                .with_failure(&Error::Backend(e.clone())),
        };
        self.audit.append(event);
    }

    fn record_orphan(&self, request: &EnrollmentRequest, issued: &IssuedCertificate, actor: &Actor) {
        let thumbprint = issued.certificate.thumbprint().ok();
        warn!(
            "Backend '{}' issued for cancelled request {}, needs manual reconciliation",
            request.backend, request.id
        );
        self.audit.record(
            actor,
            AuditAction::OrphanedIssuance { backend: request.backend.clone(), thumbprint },
            Some(request.id),
        );
    }
}

/// # Awaiting approval
///
impl CertificateRequestPipeline {
    fn spawn_poller(
        self: &Arc<Self>,
        id: RequestId,
        actor: Actor,
        guard: KeyedGuard,
        driver: DriverGuard,
        cancel: watch::Receiver<bool>,
    ) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let _identity = guard;
            let _driver = driver;
            let mut cancel = cancel;
            loop {
                match pipeline.poll_pending(id, &actor, &mut cancel).await {
                    Ok(RequestState::PendingApproval) => continue,
                    Ok(state) => {
                        debug!("Stopped polling for request {}, now {}", id, state);
                        break;
                    }
                    Err(e) => {
                        error!("Polling for request {} stopped: {}", id, e);
                        break;
                    }
                }
            }
        });
    }

    /// Polls the backend until it decides or the approval timeout
    /// passes, then drives the request on.
    ///
    /// Polls back off exponentially. The approval timeout counts from the
    /// original submission, so it survives restarts.
    async fn poll_pending(
        &self,
        id: RequestId,
        actor: &Actor,
        cancel: &mut watch::Receiver<bool>,
    ) -> CustodyResult<RequestState> {
        let mut request = self.get(id)?;
        if request.state != RequestState::PendingApproval {
            return Ok(request.state);
        }
        let backend = self.backend(&request.backend)?;
        let token = request
            .pending
            .clone()
            .ok_or_else(|| Error::custom(format!("request {} awaits approval without a token", id)))?;

        let waited = request
            .pending_since
            .and_then(|since| (Utc::now() - since).to_std().ok())
            .unwrap_or_default();
        let deadline = Instant::now() + self.config.approval_timeout().saturating_sub(waited);
        let mut backoff = self.config.poll_backoff();

        loop {
            let delay = backoff.next_backoff().unwrap_or(self.config.poll_max_interval());
            let wake = (Instant::now() + delay).min(deadline);
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = cancelled(cancel) => return self.fail(request, Error::Cancelled(id), actor),
            }

            let result = backend.poll(&token).await;
            if !matches!(result, Ok(PollOutcome::StillPending)) {
                self.record_response(&request, actor, &result);
            }

            if *cancel.borrow() {
                if let Ok(PollOutcome::Issued(issued)) = &result {
                    self.record_orphan(&request, issued, actor);
                    request.pending = None;
                }
                return self.fail(request, Error::Cancelled(id), actor);
            }

            match result {
                Ok(PollOutcome::Issued(issued)) => {
                    info!("Request {} approved at '{}'", id, request.backend);
                    self.issued(&mut request, issued, actor)?;
                    return self.drive(id, actor, cancel).await;
                }
                Ok(PollOutcome::StillPending) => {
                    trace!("Request {} still pending at '{}'", id, request.backend);
                }
                Ok(PollOutcome::Rejected(reason)) => {
                    request.pending = None;
                    self.transition(&mut request, RequestState::Rejected, actor)?;
                    return self.fail(request, Error::Rejected(reason), actor);
                }
                Err(BackendError::UnknownToken(token)) => {
                    warn!("Backend '{}' lost submission {} of request {}", request.backend, token, id);
                    request.pending = None;
                    if let Err(err) = self.backend_failed(&mut request, BackendError::UnknownToken(token), actor) {
                        return self.fail(request, err, actor);
                    }
                    return self.drive(id, actor, cancel).await;
                }
                Err(e) if e.is_transient() => {
                    warn!("Polling '{}' for request {} failed, will try again: {}", request.backend, id, e);
                }
                Err(e) => return self.fail(request, Error::Backend(e), actor),
            }

            if Instant::now() >= deadline {
                warn!(
                    "Request {} not approved within {}s, giving up",
                    id,
                    self.config.approval_timeout().as_secs()
                );
                return self.fail(request, Error::ApprovalTimeout(id), actor);
            }
        }
    }
}

/// # Bookkeeping
///
impl CertificateRequestPipeline {
    fn save(&self, request: &EnrollmentRequest) -> CustodyEmptyResult {
        Ok(self.requests.store(&request.id.storage_key(), request)?)
    }

    /// Moves the request to its next state.
    fn transition(&self, request: &mut EnrollmentRequest, to: RequestState, actor: &Actor) -> CustodyEmptyResult {
        let from = request.state;
        if !from.can_transition_to(&to) {
            return Err(Error::InvalidTransition { request: request.id, from, to });
        }
        request.state = to;
        request.updated = Utc::now();
        self.save(request)?;
        self.audit.record(actor, AuditAction::Transition { from, to }, Some(request.id));
        debug!("Request {} moved from {} to {}", request.id, from, to);
        self.publish(request.id, to);
        Ok(())
    }

    /// Terminates a request.
    ///
    /// An outstanding submission is kept as abandoned so that a late
    /// issuance can still be found.
    fn fail(&self, request: EnrollmentRequest, err: Error, actor: &Actor) -> CustodyResult<RequestState> {
        let mut request = request;
        let from = request.state;
        let reason = FailureReason::from_kind(err.kind());
        let to = RequestState::Failed(reason);
        if !from.can_transition_to(&to) {
            return Err(Error::InvalidTransition { request: request.id, from, to });
        }

        if let Some(token) = request.pending.take() {
            self.audit.record(
                actor,
                AuditAction::SubmissionAbandoned { backend: request.backend.clone(), token: token.clone() },
                Some(request.id),
            );
            request.abandoned = Some(token);
        }
        request.state = to;
        request.updated = Utc::now();
        self.save(&request)?;

        self.audit.append(
            AuditEvent::new(actor, AuditAction::Transition { from, to }, Some(request.id)).with_failure(&err),
        );
        if reason == FailureReason::ChainValidation {
            error!("ALERT: chain validation failed for request {}: {}", request.id, err);
            self.audit.append(
                AuditEvent::new(actor, AuditAction::ChainValidationAlert { reason: err.to_string() }, Some(request.id))
                    .with_failure(&err),
            );
        } else if err.kind() == ErrorKind::Cancelled {
            info!("Request {} cancelled", request.id);
        } else {
            warn!("Request {} failed: {}", request.id, err);
        }

        self.publish(request.id, to);
        Ok(to)
    }

    fn new_key(&self, request: &mut EnrollmentRequest, template: &CertificateTemplate) -> CustodyResult<KeyPair> {
        let (key_ref, key) = self.keys.generate(template.key_algorithm, template.rsa_bits())?;
        if key.strength() < template.min_key_bits {
            self.keys.delete(&key_ref)?;
            return Err(Error::KeyTooWeak { required: template.min_key_bits, actual: key.strength() });
        }
        request.key_ref = Some(key_ref);
        Ok(key)
    }

    fn request_key(&self, request: &EnrollmentRequest) -> CustodyResult<KeyPair> {
        let key_ref = request
            .key_ref
            .as_ref()
            .ok_or_else(|| Error::custom(format!("request {} has no key", request.id)))?;
        self.keys.load(key_ref)
    }

    fn request_csr(&self, request: &EnrollmentRequest) -> CustodyResult<Csr> {
        let pem = request
            .csr
            .as_ref()
            .ok_or_else(|| Error::custom(format!("request {} has no CSR", request.id)))?;
        Csr::from_pem(pem.as_bytes())
    }

    /// A completed request whose certificate can serve this request too.
    ///
    /// It must be for the same identity and SANs, cover at least the same
    /// targets, still verify, and not be up for renewal. The request a
    /// renewal supersedes never qualifies.
    fn find_reusable(
        &self,
        request: &EnrollmentRequest,
        template: &CertificateTemplate,
    ) -> CustodyResult<Option<EnrollmentRequest>> {
        let now = Utc::now();
        let identity = request.identity();

        let mut candidates: Vec<EnrollmentRequest> = self
            .list()?
            .into_iter()
            .filter(|other| {
                other.id != request.id
                    && Some(other.id) != request.supersedes
                    && other.is_completed()
                    && other.identity() == identity
                    && other.sans == request.sans
                    && other.covers_targets(&request.targets)
                    && other.is_valid_at(now)
                    && other
                        .not_after
                        .map(|not_after| !template.is_due_for_renewal(not_after, now))
                        .unwrap_or(false)
            })
            .collect();
        candidates.sort_by_key(|other| other.not_after);

        while let Some(candidate) = candidates.pop() {
            let verifies = candidate
                .certificate()
                .ok()
                .flatten()
                .map(|cert| self.hierarchy.verify(&cert, Some(template)).is_ok())
                .unwrap_or(false);
            if verifies {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// # State updates
///
impl CertificateRequestPipeline {
    fn register_driver(self: &Arc<Self>, id: RequestId) -> Option<(DriverGuard, watch::Receiver<bool>)> {
        let mut drivers = self.drivers.lock().expect("poisoned lock");
        if drivers.contains_key(&id) {
            return None;
        }
        let (tx, rx) = watch::channel(false);
        drivers.insert(id, tx);
        Some((DriverGuard { id, pipeline: self.clone() }, rx))
    }

    fn subscribe(&self, id: RequestId) -> CustodyResult<watch::Receiver<RequestState>> {
        let mut states = self.states.lock().expect("poisoned lock");
        if let Some(tx) = states.get(&id) {
            return Ok(tx.subscribe());
        }
        let state = self.get(id)?.state;
        let (tx, rx) = watch::channel(state);
        if !state.is_terminal() {
            states.insert(id, tx);
        }
        Ok(rx)
    }

    fn publish(&self, id: RequestId, state: RequestState) {
        let mut states = self.states.lock().expect("poisoned lock");
        if let Some(tx) = states.get(&id) {
            tx.send_replace(state);
        }
        if state.is_terminal() {
            states.remove(&id);
        }
    }
}


//------------ DriverGuard ---------------------------------------------------

/// Marks a request as being driven until dropped.
struct DriverGuard {
    id: RequestId,
    pipeline: Arc<CertificateRequestPipeline>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        if let Ok(mut drivers) = self.pipeline.drivers.lock() {
            drivers.remove(&self.id);
        }
    }
}


//------------ Helpers -------------------------------------------------------

/// Resolves once the flag is raised.
async fn cancelled(flag: &mut watch::Receiver<bool>) {
    if flag.wait_for(|cancelled| *cancelled).await.is_err() {
        // The sender lives as long as the driver.
        std::future::pending::<()>().await
    }
}

/// The subject to put in the CSR.
fn effective_subject(requested: &SubjectName, template: &CertificateTemplate) -> SubjectName {
    match template.subject_naming {
        SubjectNaming::Requester => requested.clone(),
        SubjectNaming::Template => {
            SubjectName::new(requested.common_name.clone()).with_attributes(template.subject_defaults.clone())
        }
    }
}


//------------ Tests ---------------------------------------------------------
