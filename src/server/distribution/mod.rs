//! Installing issued certificates on the systems that serve them.
//!
//! Every install takes a backup of what the target has first. After the
//! new material is committed the service is probed until it serves the
//! new certificate; if it does not within the grace period the backup
//! goes back on.

mod appliance;
mod channel;
mod directory;
mod panos;
mod probe;
mod unix;

pub use self::appliance::{ApplianceAdapter, ApplianceApi};
pub use self::channel::{CommandOutput, FileMode, LocalChannel, RemoteChannel, SshChannel, shell_quote};
pub use self::directory::DirectoryHostAdapter;
pub use self::panos::PanOsClient;
pub use self::probe::{HealthProbe, NoProbe, TlsHandshakeProbe};
pub use self::unix::{UnixFiles, UnixHostAdapter};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use backoff::backoff::Backoff;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use secrecy::SecretString;
use tokio::time::{Instant, sleep, sleep_until};
use url::Url;

use crate::api::audit::{AuditAction, AuditEvent};
use crate::api::request::{EnrollmentRequest, RequestId};
use crate::api::target::{
    DistributionOutcome, DistributionTarget, SkipReason, TargetBackup, TargetId, TargetMaterial, TargetSettings,
    UnixChannelKind,
};
use crate::commons::actor::Actor;
use crate::commons::crypto::{
    Certificate, KeyPair, Thumbprint, certificates_from_pem, certificates_to_pem, parse_pkcs12, pkcs12_bundle,
};
use crate::commons::error::Error;
use crate::commons::storage::KeyValueStore;
use crate::commons::CustodyResult;
use crate::config::{DistributionConfig, ProbeKind};
use crate::constants::BACKUPS_NS;
use crate::server::audit::AuditLog;
use crate::server::locks::KeyedLocks;
use crate::server::pipeline::CertificateRequestPipeline;
use crate::server::secrets::SecretStore;
use crate::server::targets::TargetRegistry;


//------------ DistributionError ---------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DistributionError {
    Unreachable(String),
    Authentication(String),

    /// The target refused the material or the configuration change.
    Rejected(String),

    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The service does not serve the new certificate.
    HealthCheck(String),

    Unsupported(String),

    /// Certificate material could not be prepared or read back.
    Material(String),

    Io(String),
}

impl DistributionError {
    /// Whether trying the same step again may help.
    pub fn is_transient(&self) -> bool {
        matches!(self, DistributionError::Unreachable(_) | DistributionError::Authentication(_))
    }
}

impl fmt::Display for DistributionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DistributionError::Unreachable(e) => write!(f, "target unreachable: {}", e),
            DistributionError::Authentication(e) => write!(f, "target refused our credentials: {}", e),
            DistributionError::Rejected(e) => write!(f, "target rejected the change: {}", e),
            DistributionError::Command { command, status, stderr } => {
                match status {
                    Some(status) => write!(f, "'{}' exited with {}", command, status)?,
                    None => write!(f, "'{}' was killed", command)?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            DistributionError::HealthCheck(e) => write!(f, "health check failed: {}", e),
            DistributionError::Unsupported(e) => write!(f, "not supported by target: {}", e),
            DistributionError::Material(e) => write!(f, "certificate material: {}", e),
            DistributionError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl From<Error> for DistributionError {
    fn from(e: Error) -> Self {
        DistributionError::Material(e.to_string())
    }
}


//------------ InstallMaterial -----------------------------------------------

/// What gets installed on a target.
#[derive(Debug)]
pub struct InstallMaterial {
    pub certificate: Certificate,

    /// The issuers above the leaf, root last.
    pub chain: Vec<Certificate>,

    /// Absent if the key may not leave this host for the target.
    pub key: Option<KeyPair>,
}

impl InstallMaterial {
    pub fn thumbprint(&self) -> Result<Thumbprint, DistributionError> {
        Ok(self.certificate.thumbprint()?)
    }

    pub fn certificate_pem(&self) -> Result<String, DistributionError> {
        Ok(self.certificate.to_pem()?)
    }

    pub fn chain_pem(&self) -> Result<String, DistributionError> {
        Ok(certificates_to_pem(&self.chain)?)
    }

    pub fn key_pem(&self) -> Result<Option<String>, DistributionError> {
        Ok(self.key.as_ref().map(|key| key.private_key_pem()).transpose()?)
    }

    /// Leaf, key and chain in one PKCS#12 file. `None` without a key.
    pub fn pkcs12(&self, friendly_name: &str, passphrase: &SecretString) -> Result<Option<Vec<u8>>, DistributionError> {
        match &self.key {
            Some(key) => Ok(Some(pkcs12_bundle(friendly_name, &self.certificate, key, &self.chain, passphrase)?)),
            None => Ok(None),
        }
    }

    /// The material a backup holds, `None` if the target had nothing.
    pub fn from_backup(material: &TargetMaterial, passphrase: &SecretString) -> Result<Option<Self>, DistributionError> {
        match material {
            TargetMaterial::Empty => Ok(None),
            TargetMaterial::Pem { certificate, chain, private_key } => {
                let certificate = Certificate::from_pem(certificate.as_bytes())?;
                let chain = match chain {
                    Some(chain) => certificates_from_pem(chain.as_bytes())?,
                    None => vec![],
                };
                let key = private_key.as_ref().map(|pem| KeyPair::from_pem(pem.as_bytes())).transpose()?;
                Ok(Some(InstallMaterial { certificate, chain, key }))
            }
            TargetMaterial::Pkcs12 { bundle } => {
                let der = STANDARD
                    .decode(bundle)
                    .map_err(|e| DistributionError::Material(format!("backup is not base64: {}", e)))?;
                let contents = parse_pkcs12(&der, passphrase)?;
                let certificate = contents
                    .certificate
                    .ok_or_else(|| DistributionError::Material("backup holds no certificate".into()))?;
                Ok(Some(InstallMaterial { certificate, chain: contents.chain, key: contents.key }))
            }
        }
    }
}

/// The thumbprint of the certificate in captured material.
fn material_thumbprint(material: &TargetMaterial, passphrase: Option<&SecretString>) -> Option<Thumbprint> {
    match material {
        TargetMaterial::Empty => None,
        TargetMaterial::Pem { certificate, .. } => Certificate::from_pem(certificate.as_bytes())
            .and_then(|cert| cert.thumbprint())
            .ok(),
        TargetMaterial::Pkcs12 { .. } => {
            let passphrase = passphrase?;
            let material = InstallMaterial::from_backup(material, passphrase).ok()??;
            material.thumbprint().ok()
        }
    }
}


//------------ TargetAdapter -------------------------------------------------

/// What a target can do: import and commit, capture and clear.
pub enum TargetAdapter {
    NetworkAppliance(ApplianceAdapter),
    DirectoryHost(DirectoryHostAdapter),
    UnixHost(UnixHostAdapter),
}

impl TargetAdapter {
    /// Whether the private key goes along.
    pub fn receives_keys(&self, exportable: bool) -> bool {
        exportable
            || match self {
                TargetAdapter::UnixHost(adapter) => adapter.is_local(),
                _ => false,
            }
    }

    /// The passphrase captured bundles are encrypted with, if any.
    fn passphrase(&self) -> Option<&SecretString> {
        match self {
            TargetAdapter::NetworkAppliance(adapter) => Some(adapter.passphrase()),
            TargetAdapter::DirectoryHost(adapter) => Some(adapter.passphrase()),
            TargetAdapter::UnixHost(_) => None,
        }
    }

    /// What the target has for the service right now.
    pub async fn capture(&self) -> Result<TargetMaterial, DistributionError> {
        match self {
            TargetAdapter::NetworkAppliance(adapter) => adapter.capture().await,
            TargetAdapter::DirectoryHost(adapter) => adapter.capture().await,
            TargetAdapter::UnixHost(adapter) => adapter.capture().await,
        }
    }

    /// Imports and commits. A dry run stops short of the commit.
    pub async fn install(&self, material: &InstallMaterial, dry_run: bool) -> Result<(), DistributionError> {
        match self {
            TargetAdapter::NetworkAppliance(adapter) => adapter.install(material, dry_run).await,
            TargetAdapter::DirectoryHost(adapter) => adapter.install(material, dry_run).await,
            TargetAdapter::UnixHost(adapter) => adapter.install(material, dry_run).await,
        }
    }

    /// Puts captured material back. A target that had nothing loses
    /// what was installed since.
    pub async fn restore(&self, backup: &TargetMaterial) -> Result<(), DistributionError> {
        let passphrase = self.passphrase().cloned().unwrap_or_else(|| SecretString::new(String::new()));
        match InstallMaterial::from_backup(backup, &passphrase)? {
            Some(material) => self.install(&material, false).await,
            None => match self {
                TargetAdapter::NetworkAppliance(adapter) => adapter.remove().await,
                TargetAdapter::DirectoryHost(adapter) => adapter.remove().await,
                TargetAdapter::UnixHost(adapter) => adapter.clear().await,
            },
        }
    }
}


//------------ DistributionEngine --------------------------------------------

pub struct DistributionEngine {
    config: DistributionConfig,
    dry_run: bool,
    pipeline: Arc<CertificateRequestPipeline>,
    targets: Arc<TargetRegistry>,
    secrets: Arc<dyn SecretStore>,
    probe: Arc<dyn HealthProbe>,
    backups: KeyValueStore,
    audit: AuditLog,

    /// One distribution per target at a time.
    locks: KeyedLocks<TargetId>,

    /// Injected appliance clients, by target. Others get a PAN-OS client.
    appliances: HashMap<TargetId, Arc<dyn ApplianceApi>>,

    /// Injected channels, by target. Others get one from their settings.
    channels: HashMap<TargetId, Arc<dyn RemoteChannel>>,
}

impl DistributionEngine {
    pub fn build(
        config: DistributionConfig,
        storage_uri: &Url,
        pipeline: Arc<CertificateRequestPipeline>,
        targets: Arc<TargetRegistry>,
        secrets: Arc<dyn SecretStore>,
        audit: AuditLog,
    ) -> CustodyResult<Self> {
        let probe: Arc<dyn HealthProbe> = match config.probe {
            ProbeKind::Tls => Arc::new(TlsHandshakeProbe::new(pipeline.hierarchy().clone())),
            ProbeKind::None => Arc::new(NoProbe),
        };
        Ok(DistributionEngine {
            config,
            dry_run: false,
            pipeline,
            targets,
            secrets,
            probe,
            backups: KeyValueStore::create(storage_uri, BACKUPS_NS)?,
            audit,
            locks: KeyedLocks::default(),
            appliances: HashMap::new(),
            channels: HashMap::new(),
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_appliance_api(mut self, target: TargetId, api: Arc<dyn ApplianceApi>) -> Self {
        self.appliances.insert(target, api);
        self
    }

    pub fn with_channel(mut self, target: TargetId, channel: Arc<dyn RemoteChannel>) -> Self {
        self.channels.insert(target, channel);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    /// Backups taken of a target, oldest first.
    pub fn list_backups(&self, target: &TargetId) -> CustodyResult<Vec<TargetBackup>> {
        let mut res: Vec<TargetBackup> = self
            .backups
            .values::<TargetBackup>()?
            .into_iter()
            .filter(|backup| &backup.target == target)
            .collect();
        res.sort_by_key(|backup| backup.taken_at);
        Ok(res)
    }
}

/// # Distributing
///
impl DistributionEngine {
    /// Installs the certificate of a completed request on one target.
    ///
    /// Fails outright only if the request is not completed or the target
    /// unknown. Anything going wrong on the target is reported in the
    /// outcome.
    pub async fn distribute(
        &self,
        request: RequestId,
        target: &TargetId,
        actor: &Actor,
    ) -> CustodyResult<DistributionOutcome> {
        let request = self.pipeline.get(request)?;
        let thumbprint = match (&request.thumbprint, request.is_completed()) {
            (Some(thumbprint), true) => thumbprint.clone(),
            _ => return Err(Error::RequestNotCompleted(request.id)),
        };
        self.targets.get(target)?;

        let _guard = self.locks.lock(target).await;
        let target = self.targets.get(target)?;

        if target.last_thumbprint.as_ref() == Some(&thumbprint) {
            debug!("Target '{}' already has {}", target.id, thumbprint);
            return Ok(self.skipped(&target, &request, SkipReason::AlreadyInstalled, actor));
        }

        info!(
            "Distributing {} for '{}' to {} '{}'",
            thumbprint,
            request.subject.common_name,
            target.target_type(),
            target.id
        );
        Ok(self.install(&request, &target, thumbprint, actor).await)
    }

    /// Distributes to every target of the request, concurrently.
    pub async fn distribute_all(
        &self,
        request: RequestId,
        actor: &Actor,
    ) -> CustodyResult<Vec<(TargetId, DistributionOutcome)>> {
        let targets = self.pipeline.get(request)?.targets;
        let outcomes = join_all(targets.iter().map(|target| self.distribute(request, target, actor))).await;

        let mut res = vec![];
        for (target, outcome) in targets.into_iter().zip(outcomes) {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(Error::RequestNotCompleted(id)) => return Err(Error::RequestNotCompleted(id)),
                Err(e) => self.failed(&target, request, e, false, actor),
            };
            res.push((target, outcome));
        }
        Ok(res)
    }

    async fn install(
        &self,
        request: &EnrollmentRequest,
        target: &DistributionTarget,
        thumbprint: Thumbprint,
        actor: &Actor,
    ) -> DistributionOutcome {
        let prepared = self.adapter(target).and_then(|adapter| {
            let material = self.material(request, &adapter)?;
            Ok((adapter, material))
        });
        let (adapter, material) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.failed(&target.id, request.id, e, false, actor),
        };
        let (adapter, material) = (&adapter, &material);

        let captured = match self.with_retry(&target.id, "backup", move || adapter.capture()).await {
            Ok(captured) => captured,
            Err(e) => return self.failed(&target.id, request.id, Error::distribution(&target.id, e), false, actor),
        };
        let backup = TargetBackup {
            key: format!("{}-{}", target.id, Utc::now().format("%Y%m%dT%H%M%S%3fZ")),
            target: target.id.clone(),
            taken_at: Utc::now(),
            thumbprint: material_thumbprint(&captured, adapter.passphrase()),
            material: captured,
        };
        if !self.dry_run {
            if let Err(e) = self.backups.store(&backup.key, &backup) {
                return self.failed(&target.id, request.id, e.into(), false, actor);
            }
            debug!("Stored backup {} of target '{}'", backup.key, target.id);
        }

        let dry_run = self.dry_run;
        let installed = self
            .with_retry(&target.id, "install", move || adapter.install(material, dry_run))
            .await;
        if let Err(e) = installed {
            let rolled_back = !dry_run && self.roll_back(adapter, target, &backup, request.id, actor).await;
            return self.failed(&target.id, request.id, Error::distribution(&target.id, e), rolled_back, actor);
        }

        if dry_run {
            info!("Dry run for target '{}' passed, nothing committed", target.id);
            return self.skipped(target, request, SkipReason::DryRun, actor);
        }

        if let Err(e) = self.await_healthy(target, material).await {
            error!("Target '{}' does not serve {} after install: {}", target.id, thumbprint, e);
            let rolled_back = self.roll_back(adapter, target, &backup, request.id, actor).await;
            return self.failed(&target.id, request.id, Error::distribution(&target.id, e), rolled_back, actor);
        }

        if let Err(e) = self.targets.record_install(&target.id, thumbprint.clone(), request.id) {
            return self.failed(&target.id, request.id, e, false, actor);
        }
        info!("Installed {} on target '{}'", thumbprint, target.id);
        self.audit.append(AuditEvent::new(
            actor,
            AuditAction::Installed { target: target.id.clone(), thumbprint: thumbprint.clone() },
            Some(request.id),
        ));
        DistributionOutcome::Installed { thumbprint }
    }

    /// Runs a step, again after a delay while it fails transiently.
    async fn with_retry<T, F, Fut>(&self, target: &TargetId, step: &str, mut op: F) -> Result<T, DistributionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DistributionError>>,
    {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(res) => return Ok(res),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or_else(|| self.config.retry_delay());
                    warn!(
                        "{} on target '{}' failed (attempt {}), trying again in {}s: {}",
                        step,
                        target,
                        attempt,
                        delay.as_secs(),
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Probes until the service serves the new certificate or the grace
    /// period is over.
    async fn await_healthy(
        &self,
        target: &DistributionTarget,
        material: &InstallMaterial,
    ) -> Result<(), DistributionError> {
        let deadline = Instant::now() + self.config.grace_period();
        loop {
            match self.probe.check(target, material).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let next = Instant::now() + self.config.probe_interval();
                    if next > deadline {
                        return Err(e);
                    }
                    debug!("Target '{}' not healthy yet: {}", target.id, e);
                    sleep_until(next).await;
                }
            }
        }
    }

    async fn roll_back(
        &self,
        adapter: &TargetAdapter,
        target: &DistributionTarget,
        backup: &TargetBackup,
        request: RequestId,
        actor: &Actor,
    ) -> bool {
        match adapter.restore(&backup.material).await {
            Ok(()) => {
                warn!("Restored backup {} on target '{}'", backup.key, target.id);
                if let Err(e) = self.targets.record_restore(&target.id, backup.thumbprint.clone()) {
                    error!("Could not record restore of target '{}': {}", target.id, e);
                }
                self.audit.append(AuditEvent::new(
                    actor,
                    AuditAction::RolledBack { target: target.id.clone(), backup: backup.key.clone() },
                    Some(request),
                ));
                true
            }
            Err(e) => {
                error!("Could not restore backup {} on target '{}': {}", backup.key, target.id, e);
                false
            }
        }
    }

    fn skipped(
        &self,
        target: &DistributionTarget,
        request: &EnrollmentRequest,
        reason: SkipReason,
        actor: &Actor,
    ) -> DistributionOutcome {
        self.audit.append(AuditEvent::new(
            actor,
            AuditAction::Skipped { target: target.id.clone(), reason },
            Some(request.id),
        ));
        DistributionOutcome::Skipped { reason }
    }

    fn failed(
        &self,
        target: &TargetId,
        request: RequestId,
        err: Error,
        rolled_back: bool,
        actor: &Actor,
    ) -> DistributionOutcome {
        warn!("Distribution of request {} to '{}' failed: {}", request, target, err);
        self.audit.append(
            AuditEvent::new(actor, AuditAction::DistributionFailed { target: target.clone() }, Some(request))
                .with_failure(&err),
        );
        DistributionOutcome::Failed { kind: err.kind(), message: err.to_string(), rolled_back }
    }
}

/// # Adapters
///
impl DistributionEngine {
    fn passphrase(&self) -> CustodyResult<SecretString> {
        Ok(self.secrets.get_credential(&self.config.pkcs12_passphrase_ref)?.secret)
    }

    fn adapter(&self, target: &DistributionTarget) -> CustodyResult<TargetAdapter> {
        match &target.settings {
            TargetSettings::NetworkAppliance { certificate_name } => {
                let api = match self.appliances.get(&target.id) {
                    Some(api) => api.clone(),
                    None => {
                        let credential = self.secrets.get_credential(target.credential_ref())?;
                        Arc::new(PanOsClient::new(&target.address, credential)?) as Arc<dyn ApplianceApi>
                    }
                };
                let name = certificate_name.clone().unwrap_or_else(|| target.service_name.clone());
                Ok(TargetAdapter::NetworkAppliance(ApplianceAdapter::new(api, name, self.passphrase()?)))
            }
            TargetSettings::DirectoryHost { store } => {
                let channel = match self.channels.get(&target.id) {
                    Some(channel) => channel.clone(),
                    None => {
                        let user = match &target.credential_ref {
                            Some(reference) => Some(self.secrets.get_credential(reference)?.username),
                            None => None,
                        };
                        Arc::new(SshChannel::new(&target.address).with_user(user)) as Arc<dyn RemoteChannel>
                    }
                };
                Ok(TargetAdapter::DirectoryHost(DirectoryHostAdapter::new(
                    channel,
                    store,
                    &target.service_name,
                    self.passphrase()?,
                )))
            }
            TargetSettings::UnixHost { channel: kind, ssh_user, ssh_port, .. } => {
                let channel = match self.channels.get(&target.id) {
                    Some(channel) => channel.clone(),
                    None => match kind {
                        UnixChannelKind::Local => Arc::new(LocalChannel) as Arc<dyn RemoteChannel>,
                        UnixChannelKind::Ssh => Arc::new(
                            SshChannel::new(&target.address)
                                .with_user(ssh_user.clone())
                                .with_port(*ssh_port),
                        ),
                    },
                };
                let files = UnixFiles::from_settings(&target.settings)
                    .ok_or_else(|| Error::custom(format!("target '{}' has no file settings", target.id)))?;
                Ok(TargetAdapter::UnixHost(UnixHostAdapter::new(channel, files)))
            }
        }
    }

    fn material(&self, request: &EnrollmentRequest, adapter: &TargetAdapter) -> CustodyResult<InstallMaterial> {
        let certificate = request
            .certificate()?
            .ok_or(Error::RequestNotCompleted(request.id))?;
        let chain = request.chain()?;
        let template = self.pipeline.templates().get_version(&request.template)?;

        let key = if adapter.receives_keys(template.exportable_key) {
            let key_ref = request.key_ref.as_ref().ok_or(Error::RequestNotCompleted(request.id))?;
            Some(self.pipeline.keys().load(key_ref)?)
        } else {
            debug!("Key of request {} is not exportable, sending certificate only", request.id);
            None
        };
        Ok(InstallMaterial { certificate, chain, key })
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::request::{NewEnrollment, RequestState};
    use crate::commons::error::ErrorKind;
    use crate::constants::ACTOR_DEF_TEST;
    use crate::test::{DistributionFixture, FakeProbe};

    async fn completed(fixture: &DistributionFixture) -> EnrollmentRequest {
        let new = NewEnrollment::new("fw1.example.com", "WebServer").with_target("applianceA");
        let request = fixture.pipeline.enroll(new, &ACTOR_DEF_TEST).await.unwrap();
        assert_eq!(request.state, RequestState::Completed);
        request
    }

    #[test]
    fn transient_errors() {
        assert!(DistributionError::Unreachable("x".into()).is_transient());
        assert!(DistributionError::Authentication("x".into()).is_transient());
        assert!(!DistributionError::Rejected("x".into()).is_transient());
        assert!(!DistributionError::HealthCheck("x".into()).is_transient());
    }

    #[tokio::test]
    async fn installs_then_skips_the_same_certificate() {
        let fixture = DistributionFixture::new();
        let request = completed(&fixture).await;
        let target = TargetId::from("applianceA");

        let outcome = fixture.engine.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap();
        let thumbprint = request.thumbprint.clone().unwrap();
        assert_eq!(outcome, DistributionOutcome::Installed { thumbprint: thumbprint.clone() });
        assert_eq!(fixture.appliance.installed(), Some(thumbprint.clone()));
        assert_eq!(fixture.appliance.commits(), 1);
        assert_eq!(fixture.targets.get(&target).unwrap().last_thumbprint, Some(thumbprint));

        let again = fixture.engine.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap();
        assert_eq!(again, DistributionOutcome::Skipped { reason: SkipReason::AlreadyInstalled });
        assert_eq!(fixture.appliance.commits(), 1);
        assert_eq!(fixture.engine.list_backups(&target).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_requests_are_refused() {
        let fixture = DistributionFixture::new();
        let id = fixture
            .pipeline
            .submit(NewEnrollment::new("fw1.example.com", "WebServer"), &ACTOR_DEF_TEST)
            .unwrap();
        let err = fixture
            .engine
            .distribute(id, &TargetId::from("applianceA"), &ACTOR_DEF_TEST)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_restores_backup() {
        let fixture = DistributionFixture::with_probe(FakeProbe::failing());
        let target = TargetId::from("applianceA");
        let previous = fixture.appliance.preinstall("fw1.example.com");

        let request = completed(&fixture).await;
        let outcome = fixture.engine.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap();
        match outcome {
            DistributionOutcome::Failed { kind, rolled_back, .. } => {
                assert_eq!(kind, ErrorKind::Distribution);
                assert!(rolled_back);
            }
            other => panic!("unexpected {}", other),
        }
        assert_eq!(fixture.appliance.installed(), Some(previous.clone()));
        assert_eq!(fixture.targets.get(&target).unwrap().last_thumbprint, Some(previous));

        let backups = fixture.engine.list_backups(&target).unwrap();
        assert_eq!(backups.len(), 1);
        assert!(fixture.audit.for_request(request.id).iter().any(|event| matches!(
            &event.action,
            AuditAction::RolledBack { backup, .. } if backup == &backups[0].key
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_on_empty_target_removes_certificate() {
        let fixture = DistributionFixture::with_probe(FakeProbe::failing());
        let target = TargetId::from("applianceA");

        let request = completed(&fixture).await;
        let outcome = fixture.engine.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap();
        assert!(matches!(outcome, DistributionOutcome::Failed { rolled_back: true, .. }), "{}", outcome);

        assert_eq!(fixture.appliance.installed(), None);
        assert_eq!(fixture.appliance.commits(), 2);
        assert_eq!(fixture.targets.get(&target).unwrap().last_thumbprint, None);
        let backups = fixture.engine.list_backups(&target).unwrap();
        assert_eq!(backups[0].material, TargetMaterial::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_targets_are_retried() {
        let fixture = DistributionFixture::new();
        fixture.appliance.fail_next_imports(2);
        let request = completed(&fixture).await;
        let outcome = fixture
            .engine
            .distribute(request.id, &TargetId::from("applianceA"), &ACTOR_DEF_TEST)
            .await
            .unwrap();
        assert!(outcome.is_installed());
        assert_eq!(fixture.appliance.imports(), 3);
    }

    #[tokio::test]
    async fn dry_run_commits_nothing() {
        let fixture = DistributionFixture::dry_run();
        let target = TargetId::from("applianceA");
        let request = completed(&fixture).await;

        let outcome = fixture.engine.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap();
        assert_eq!(outcome, DistributionOutcome::Skipped { reason: SkipReason::DryRun });
        assert_eq!(fixture.appliance.installed(), None);
        assert_eq!(fixture.appliance.validations(), 1);
        assert_eq!(fixture.targets.get(&target).unwrap().last_thumbprint, None);
        assert!(fixture.engine.list_backups(&target).unwrap().is_empty());
    }

    #[tokio::test]
    async fn fans_out_to_all_targets() {
        let fixture = DistributionFixture::new();
        let new = NewEnrollment::new("www.example.com", "WebServer")
            .with_target("applianceA")
            .with_target("web1");
        let request = fixture.pipeline.enroll(new, &ACTOR_DEF_TEST).await.unwrap();

        let outcomes = fixture.engine.distribute_all(request.id, &ACTOR_DEF_TEST).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_installed()), "{:?}", outcomes);

        let files = fixture.web1_files();
        let cert = std::fs::read(&files.cert_path).unwrap();
        assert_eq!(Certificate::from_pem(&cert).unwrap().thumbprint().unwrap(), request.thumbprint.unwrap());
        assert!(files.key_path.exists());
    }
}
