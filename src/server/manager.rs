//! Wires all components together from the configuration.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::audit::AuditEvent;
use crate::api::ca::{CaId, CertificateAuthority, Validity};
use crate::api::request::{EnrollmentRequest, NewEnrollment, RequestId, RequestState};
use crate::api::target::{DistributionOutcome, DistributionTarget, TargetBackup, TargetId};
use crate::api::template::{CertificateTemplate, TemplateRef};
use crate::commons::actor::Actor;
use crate::commons::crypto::Certificate;
use crate::commons::error::Error;
use crate::commons::util::file;
use crate::commons::{CustodyEmptyResult, CustodyResult};
use crate::config::{BackendConfig, Config};
use crate::constants::*;
use crate::server::audit::AuditLog;
use crate::server::backend::{
    ChallengeIssuer, ChallengeVerifier, DirectSigner, EnrollmentAuthority, EstClient, HttpChallengeVerifier,
    RemoteEnroller, SigningBackendAdapter,
};
use crate::server::distribution::{ApplianceApi, DistributionEngine, HealthProbe, RemoteChannel};
use crate::server::hierarchy::{CaHierarchyManager, CaKeySpec};
use crate::server::pipeline::CertificateRequestPipeline;
use crate::server::renewal::{RenewalReport, RenewalScheduler};
use crate::server::secrets::{EnvSecretStore, SecretStore};
use crate::server::targets::TargetRegistry;
use crate::server::templates::TemplateRegistry;


//------------ ManagerBuilder ------------------------------------------------

/// Builds a [`CustodyManager`], optionally with collaborators that would
/// otherwise be created from the configuration.
pub struct ManagerBuilder {
    config: Arc<Config>,
    secrets: Option<Arc<dyn SecretStore>>,

    /// Enrollment authorities by the name of the backend they serve.
    authorities: HashMap<String, Arc<dyn EnrollmentAuthority>>,
    verifier: Option<Arc<dyn ChallengeVerifier>>,
    appliances: Vec<(TargetId, Arc<dyn ApplianceApi>)>,
    channels: Vec<(TargetId, Arc<dyn RemoteChannel>)>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl ManagerBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        ManagerBuilder {
            config,
            secrets: None,
            authorities: HashMap::new(),
            verifier: None,
            appliances: vec![],
            channels: vec![],
            probe: None,
        }
    }

    pub fn with_secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Uses `authority` for the EST backend named `backend`.
    pub fn with_enrollment_authority(mut self, backend: &str, authority: Arc<dyn EnrollmentAuthority>) -> Self {
        self.authorities.insert(backend.to_string(), authority);
        self
    }

    pub fn with_challenge_verifier(mut self, verifier: Arc<dyn ChallengeVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_appliance_api(mut self, target: &str, api: Arc<dyn ApplianceApi>) -> Self {
        self.appliances.push((TargetId::from(target), api));
        self
    }

    pub fn with_channel(mut self, target: &str, channel: Arc<dyn RemoteChannel>) -> Self {
        self.channels.push((TargetId::from(target), channel));
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> CustodyResult<CustodyManager> {
        let config = self.config.clone();
        config.verify()?;

        info!("Starting {} v{}", CUSTODIAN_SERVER_APP, env!("CARGO_PKG_VERSION"));
        info!("{} uses storage: {}", CUSTODIAN_SERVER_APP, config.storage_uri);
        if config.dry_run {
            info!("Dry run: distributions are validated but never committed");
        }

        let uri = &config.storage_uri;
        let audit = AuditLog::create(uri)?;
        let secrets: Arc<dyn SecretStore> = match &self.secrets {
            Some(secrets) => secrets.clone(),
            None => Arc::new(EnvSecretStore::new()),
        };

        let hierarchy = Arc::new(CaHierarchyManager::build(uri, audit.clone())?);
        bootstrap_authorities(&config, &hierarchy)?;

        let templates = Arc::new(TemplateRegistry::build(uri, audit.clone())?);
        for template in &config.templates {
            templates.publish(template.clone(), &ACTOR_DEF_CUSTODIAN)?;
        }

        let targets = Arc::new(TargetRegistry::build(uri)?);
        for target in &config.targets {
            targets.configure(target.clone())?;
        }

        let backends = config
            .backends
            .iter()
            .map(|backend| self.backend(backend, &hierarchy, secrets.as_ref()))
            .collect::<CustodyResult<Vec<_>>>()?;

        let pipeline = Arc::new(CertificateRequestPipeline::build(
            config.pipeline.clone(),
            uri,
            hierarchy.clone(),
            templates.clone(),
            targets.clone(),
            backends,
            audit.clone(),
        )?);

        let mut distribution = DistributionEngine::build(
            config.distribution.clone(),
            uri,
            pipeline.clone(),
            targets.clone(),
            secrets,
            audit.clone(),
        )?
        .with_dry_run(config.dry_run);
        if let Some(probe) = self.probe {
            distribution = distribution.with_probe(probe);
        }
        for (target, api) in self.appliances {
            distribution = distribution.with_appliance_api(target, api);
        }
        for (target, channel) in self.channels {
            distribution = distribution.with_channel(target, channel);
        }
        let distribution = Arc::new(distribution);

        let renewal = Arc::new(RenewalScheduler::new(
            config.renewal.clone(),
            pipeline.clone(),
            distribution.clone(),
            audit.clone(),
        ));

        Ok(CustodyManager { config, hierarchy, templates, targets, pipeline, distribution, renewal, audit })
    }

    fn backend(
        &self,
        backend: &BackendConfig,
        hierarchy: &Arc<CaHierarchyManager>,
        secrets: &dyn SecretStore,
    ) -> CustodyResult<SigningBackendAdapter> {
        let res = match backend {
            BackendConfig::Direct { name, authority } => SigningBackendAdapter::DirectSign(DirectSigner::build(
                name.clone(),
                ca_named(hierarchy, authority)?,
                hierarchy.clone(),
                &self.config.storage_uri,
            )?),
            BackendConfig::Est { name, url, template_labels, credential_ref } => {
                let authority = match self.authorities.get(name) {
                    Some(authority) => authority.clone(),
                    None => {
                        let credential = credential_ref
                            .as_ref()
                            .map(|reference| secrets.get_credential(reference))
                            .transpose()?;
                        Arc::new(EstClient::new(url.clone(), *template_labels, credential)?)
                            as Arc<dyn EnrollmentAuthority>
                    }
                };
                SigningBackendAdapter::RemoteEnroll(RemoteEnroller::new(name.clone(), authority))
            }
            BackendConfig::Challenge { name, authority } => {
                let verifier = match &self.verifier {
                    Some(verifier) => verifier.clone(),
                    None => Arc::new(HttpChallengeVerifier::new()?) as Arc<dyn ChallengeVerifier>,
                };
                SigningBackendAdapter::ChallengeResponse(ChallengeIssuer::new(
                    name.clone(),
                    ca_named(hierarchy, authority)?,
                    hierarchy.clone(),
                    verifier,
                ))
            }
        };
        debug!("Configured backend '{}'", res.name());
        Ok(res)
    }
}

/// Creates the configured CAs that storage does not have yet, and imports
/// those operated elsewhere.
///
/// A CA is recognised by its common name, so bootstrapping again after
/// a restart leaves the hierarchy as it is.
fn bootstrap_authorities(config: &Config, hierarchy: &CaHierarchyManager) -> CustodyEmptyResult {
    for authority in &config.authorities {
        if let Some(existing) = hierarchy.find_by_name(&authority.name) {
            debug!("CA '{}' exists as {}", authority.name, existing.id);
            continue;
        }
        let parent = match &authority.parent {
            Some(parent) => Some(ca_named(hierarchy, parent)?),
            None => None,
        };
        match &authority.certificate {
            Some(path) => {
                let certificate = read_ca_certificate(path)?;
                if certificate.subject_cn().as_deref() != Some(authority.name.as_str()) {
                    return Err(Error::ConfigError(format!(
                        "certificate in '{}' is not for CA '{}'",
                        path.display(),
                        authority.name
                    )));
                }
                hierarchy.import_ca(parent.as_ref(), &certificate, &ACTOR_DEF_CUSTODIAN)?;
            }
            None => {
                hierarchy.register_ca(
                    parent.as_ref(),
                    &authority.name,
                    Validity::days_from_now(authority.validity_days),
                    authority.path_len,
                    CaKeySpec { algorithm: authority.key_algorithm, rsa_bits: authority.key_bits },
                    &ACTOR_DEF_CUSTODIAN,
                )?;
            }
        }
    }
    Ok(())
}

fn read_ca_certificate(path: &Path) -> CustodyResult<Certificate> {
    let pem = file::read_optional(path)?
        .ok_or_else(|| Error::ConfigError(format!("CA certificate '{}' does not exist", path.display())))?;
    Certificate::from_pem(&pem)
}

fn ca_named(hierarchy: &CaHierarchyManager, name: &str) -> CustodyResult<CaId> {
    hierarchy
        .find_by_name(name)
        .map(|ca| ca.id)
        .ok_or_else(|| Error::CaNameUnknown(name.to_string()))
}


//------------ CustodyManager ------------------------------------------------

/// The custodian: everything needed to get certificates issued, installed
/// and renewed.
pub struct CustodyManager {
    config: Arc<Config>,
    hierarchy: Arc<CaHierarchyManager>,
    templates: Arc<TemplateRegistry>,
    targets: Arc<TargetRegistry>,
    pipeline: Arc<CertificateRequestPipeline>,
    distribution: Arc<DistributionEngine>,
    renewal: Arc<RenewalScheduler>,
    audit: AuditLog,
}

/// # Set up and components
///
impl CustodyManager {
    /// Builds a manager with everything created from the configuration.
    pub fn build(config: Arc<Config>) -> CustodyResult<Self> {
        ManagerBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hierarchy(&self) -> &Arc<CaHierarchyManager> {
        &self.hierarchy
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    pub fn pipeline(&self) -> &Arc<CertificateRequestPipeline> {
        &self.pipeline
    }

    pub fn distribution(&self) -> &Arc<DistributionEngine> {
        &self.distribution
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Picks up the requests a previous run left unfinished.
    pub fn resume(&self) -> CustodyResult<usize> {
        self.pipeline.resume(&ACTOR_DEF_CUSTODIAN)
    }

    /// Starts the renewal scheduler. It stops when `shutdown` turns true.
    pub fn start_renewals(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let renewal = self.renewal.clone();
        tokio::spawn(renewal.run(ACTOR_DEF_SCHEDULER, shutdown))
    }

    /// Writes out pending audit events.
    pub fn shutdown(&self) {
        self.audit.flush();
        info!("{} stopped", CUSTODIAN_SERVER_APP);
    }
}

/// # Authorities and templates
///
impl CustodyManager {
    pub fn list_cas(&self) -> Vec<CertificateAuthority> {
        self.hierarchy.list()
    }

    pub fn revoke_ca(&self, ca: &CaId, actor: &Actor) -> CustodyEmptyResult {
        self.hierarchy.revoke(ca, actor)
    }

    pub fn publish_template(&self, template: CertificateTemplate, actor: &Actor) -> CustodyResult<TemplateRef> {
        self.templates.publish(template, actor)
    }

    pub fn configure_target(&self, target: DistributionTarget) -> CustodyEmptyResult {
        self.targets.configure(target)
    }
}

/// # Requests
///
impl CustodyManager {
    pub fn submit(&self, new: NewEnrollment, actor: &Actor) -> CustodyResult<RequestId> {
        self.pipeline.submit(new, actor)
    }

    /// Submits and drives a request until it rests.
    pub async fn enroll(&self, new: NewEnrollment, actor: &Actor) -> CustodyResult<EnrollmentRequest> {
        self.pipeline.enroll(new, actor).await
    }

    pub async fn process(&self, id: RequestId, actor: &Actor) -> CustodyResult<RequestState> {
        self.pipeline.process(id, actor).await
    }

    pub async fn wait_for_terminal(&self, id: RequestId, timeout: Duration) -> CustodyResult<RequestState> {
        self.pipeline.wait_for_terminal(id, timeout).await
    }

    pub fn cancel(&self, id: RequestId, actor: &Actor) -> CustodyEmptyResult {
        self.pipeline.cancel(id, actor)
    }

    pub fn approve(&self, id: RequestId, actor: &Actor) -> CustodyEmptyResult {
        self.pipeline.approve(id, actor)
    }

    pub fn deny(&self, id: RequestId, reason: &str, actor: &Actor) -> CustodyEmptyResult {
        self.pipeline.deny(id, reason, actor)
    }

    pub fn get_request(&self, id: RequestId) -> CustodyResult<EnrollmentRequest> {
        self.pipeline.get(id)
    }

    pub fn list_requests(&self) -> CustodyResult<Vec<EnrollmentRequest>> {
        self.pipeline.list()
    }

    pub fn history(&self, id: RequestId) -> Vec<AuditEvent> {
        self.pipeline.history(id)
    }

    /// Checks the recorded transitions of a request against the state
    /// machine.
    pub fn verify_history(&self, id: RequestId) -> CustodyEmptyResult {
        self.audit.verify_transitions(id)
    }

    /// The validated chain of a completed request, leaf first and trust
    /// anchor last.
    pub fn chain_for(&self, id: RequestId) -> CustodyResult<Vec<Certificate>> {
        let request = self.pipeline.get(id)?;
        let certificate = match (request.is_completed(), request.certificate()?) {
            (true, Some(certificate)) => certificate,
            _ => return Err(Error::RequestNotCompleted(id)),
        };
        let template = self.templates.get_version(&request.template)?;
        self.hierarchy.verify(&certificate, Some(&template))
    }
}

/// # Distribution and renewal
///
impl CustodyManager {
    pub async fn distribute(
        &self,
        request: RequestId,
        target: &TargetId,
        actor: &Actor,
    ) -> CustodyResult<DistributionOutcome> {
        self.distribution.distribute(request, target, actor).await
    }

    pub async fn distribute_all(
        &self,
        request: RequestId,
        actor: &Actor,
    ) -> CustodyResult<Vec<(TargetId, DistributionOutcome)>> {
        self.distribution.distribute_all(request, actor).await
    }

    pub fn list_backups(&self, target: &TargetId) -> CustodyResult<Vec<TargetBackup>> {
        self.distribution.list_backups(target)
    }

    /// Runs a renewal sweep now rather than waiting for the scheduler.
    pub async fn sweep_renewals(&self, actor: &Actor) -> CustodyResult<RenewalReport> {
        self.renewal.sweep(actor).await
    }
}

impl fmt::Debug for CustodyManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CustodyManager({})", self.config.storage_uri)
    }
}


//------------ Tests ---------------------------------------------------------
