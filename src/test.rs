//! Helper functions and fakes for testing Custodian.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tempfile::TempDir;
use url::Url;

use crate::api::ca::{CaId, Validity};
use crate::api::request::{EnrollmentRequest, PendingToken, RequestId, SanSet, SubjectAltName, SubjectName};
use crate::api::target::{DistributionTarget, TargetId, TargetSettings, UnixChannelKind};
use crate::api::template::{
    CertificateTemplate, EnrollmentMode, ExtendedKeyUsage, KeyUsage, SubjectAttributes, SubjectNaming,
    TemplateName,
};
use crate::commons::crypto::{Certificate, Csr, KeyAlgorithm, KeyPair, Thumbprint, pkcs12_bundle};
use crate::commons::storage::KeyValueStore;
use crate::config::{DistributionConfig, PipelineConfig, ProbeKind, RenewalConfig};
use crate::constants::{ACTOR_DEF_TEST, DISTRIBUTION_PKCS12_PASSPHRASE_REF, REQUESTS_NS};
use crate::server::audit::AuditLog;
use crate::server::backend::{
    BackendError, Challenge, ChallengeVerifier, DirectSigner, EnrollmentAuthority, ExistingRequest,
    IssuedCertificate, PollOutcome, RemoteEnroller, SigningBackendAdapter, SubmissionContext, SubmitOutcome,
};
use crate::server::distribution::{
    ApplianceApi, CommandOutput, DistributionEngine, DistributionError, FileMode, HealthProbe, InstallMaterial,
    RemoteChannel, UnixFiles,
};
use crate::server::hierarchy::{CaHierarchyManager, CaKeySpec, CaSigner};
use crate::server::pipeline::CertificateRequestPipeline;
use crate::server::renewal::RenewalScheduler;
use crate::server::secrets::{Credential, StaticSecretStore};
use crate::server::targets::TargetRegistry;
use crate::server::templates::TemplateRegistry;

/// What test PKCS#12 bundles are encrypted with.
pub const TEST_PKCS12_PASSPHRASE: &str = "test-bundle-passphrase";

/// A memory storage location nobody else uses.
pub fn mem_storage() -> Url {
    Url::parse(&format!("memory://{}", uuid::Uuid::new_v4())).unwrap()
}

pub fn tmp_storage(dir: &Path) -> Url {
    Url::parse(&format!("local://{}", dir.display())).unwrap()
}


//------------ Templates and targets -----------------------------------------

/// A TLS server template: RSA 2048, 90 days, renewed 30 days ahead.
pub fn web_server_template(backend: &str) -> CertificateTemplate {
    CertificateTemplate {
        name: TemplateName::from("WebServer"),
        version: 1,
        key_algorithm: KeyAlgorithm::Rsa,
        min_key_bits: 2048,
        key_usage: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
        extended_key_usage: vec![ExtendedKeyUsage::ServerAuth],
        validity_days: 90,
        renewal_overlap_days: 30,
        subject_naming: SubjectNaming::Requester,
        subject_defaults: SubjectAttributes::default(),
        exportable_key: true,
        enrollment_mode: EnrollmentMode::Automatic,
        backend: backend.to_string(),
    }
}

pub fn appliance_target(id: &str) -> DistributionTarget {
    DistributionTarget {
        id: TargetId::from(id),
        settings: TargetSettings::NetworkAppliance { certificate_name: None },
        address: format!("{}.mgmt.example.net", id),
        probe_address: None,
        credential_ref: None,
        service_name: format!("{}-tls", id),
        last_thumbprint: None,
        installed_request: None,
        installed_at: None,
    }
}

/// A target on this host keeping `<id>.pem` and `<id>.key` in `dir`.
pub fn unix_target(id: &str, dir: &Path) -> DistributionTarget {
    DistributionTarget {
        id: TargetId::from(id),
        settings: TargetSettings::UnixHost {
            cert_path: dir.join(format!("{}.pem", id)),
            key_path: dir.join(format!("{}.key", id)),
            chain_path: None,
            owner: None,
            group: None,
            cert_mode: 0o644,
            key_mode: 0o600,
            reload_command: None,
            channel: UnixChannelKind::Local,
            ssh_user: None,
            ssh_port: None,
        },
        address: "localhost".to_string(),
        probe_address: None,
        credential_ref: None,
        service_name: id.to_string(),
        last_thumbprint: None,
        installed_request: None,
        installed_at: None,
    }
}


//------------ Keys and certificates -----------------------------------------

fn ec() -> CaKeySpec {
    CaKeySpec { algorithm: KeyAlgorithm::EcP256, rsa_bits: 0 }
}

/// Registers a root and an issuing CA below it, returns the issuing one.
pub fn register_test_cas(hierarchy: &CaHierarchyManager) -> CaId {
    register_cas(hierarchy, "Test Root CA", "Test Issuing CA")
}

pub fn register_cas(hierarchy: &CaHierarchyManager, root: &str, issuing: &str) -> CaId {
    let root = hierarchy
        .register_ca(None, root, Validity::days_from_now(3650), Some(1), ec(), &ACTOR_DEF_TEST)
        .unwrap();
    hierarchy
        .register_ca(Some(&root), issuing, Validity::days_from_now(730), None, ec(), &ACTOR_DEF_TEST)
        .unwrap()
}

/// A fresh two tier hierarchy and its issuing CA.
pub fn hierarchy() -> (Arc<CaHierarchyManager>, CaId) {
    let hierarchy = CaHierarchyManager::build(&mem_storage(), AuditLog::in_memory()).unwrap();
    let issuing = register_test_cas(&hierarchy);
    (Arc::new(hierarchy), issuing)
}

fn dns_sans(cn: &str) -> SanSet {
    SanSet::from_iter([SubjectAltName::Dns(cn.to_string())])
}

pub fn csr_for(cn: &str) -> (KeyPair, Csr) {
    let key = KeyPair::generate(KeyAlgorithm::Rsa, 2048).unwrap();
    let csr = Csr::build(&key, &SubjectName::new(cn), &dns_sans(cn)).unwrap();
    (key, csr)
}

pub fn submission_context(cn: &str, template: CertificateTemplate) -> SubmissionContext {
    SubmissionContext {
        request: RequestId::generate(),
        subject: SubjectName::new(cn),
        sans: dns_sans(cn),
        template,
    }
}

/// A server certificate issued by `ca`, its key, and its chain.
pub fn issued_by(hierarchy: &CaHierarchyManager, ca: &CaId, cn: &str) -> (Certificate, KeyPair, Vec<Certificate>) {
    let (key, csr) = csr_for(cn);
    let cert = hierarchy
        .signer(ca)
        .unwrap()
        .issue(&csr, &SubjectName::new(cn), &dns_sans(cn), &web_server_template("local"))
        .unwrap();
    let chain = hierarchy.chain_for(&cert).unwrap().into_iter().skip(1).collect();
    (cert, key, chain)
}

/// A server certificate from a hierarchy of its own.
pub fn issued_material(cn: &str) -> (Certificate, KeyPair, Vec<Certificate>) {
    let (hierarchy, issuing) = hierarchy();
    issued_by(&hierarchy, &issuing, cn)
}


//------------ FakeAuthority -------------------------------------------------

/// An enrollment authority that keeps everything pending until told to
/// approve.
pub struct FakeAuthority {
    issuer: Arc<CaSigner>,

    /// The issuing CA's certificate and those above it.
    ca_certificates: Vec<Certificate>,
    state: Mutex<AuthorityState>,
}

#[derive(Default)]
struct AuthorityState {
    existing: Option<ExistingRequest>,
    approved: bool,
    fail_next: usize,
    submitted: Vec<String>,
    polls: usize,

    /// CSRs by the token they are pending under.
    pending: HashMap<PendingToken, String>,
}

impl FakeAuthority {
    /// Issues from `ca` once approved.
    pub fn issuing_from(hierarchy: &CaHierarchyManager, ca: &CaId) -> Self {
        let ca_certificates = hierarchy
            .ca_path(ca)
            .unwrap()
            .iter()
            .map(|ca| ca.certificate().unwrap())
            .collect();
        FakeAuthority {
            issuer: hierarchy.signer(ca).unwrap(),
            ca_certificates,
            state: Mutex::new(AuthorityState::default()),
        }
    }

    pub fn pending() -> Self {
        let (hierarchy, issuing) = hierarchy();
        Self::issuing_from(&hierarchy, &issuing)
    }

    /// Issues from CAs of its own, "Corp Root CA" and "Corp Issuing CA".
    pub fn corporate() -> Self {
        let hierarchy = CaHierarchyManager::build(&mem_storage(), AuditLog::in_memory()).unwrap();
        let issuing = register_cas(&hierarchy, "Corp Root CA", "Corp Issuing CA");
        Self::issuing_from(&hierarchy, &issuing)
    }

    /// The issuing CA's certificate first, the root last.
    pub fn ca_certificates(&self) -> &[Certificate] {
        &self.ca_certificates
    }

    pub fn set_existing(&self, existing: Option<ExistingRequest>) {
        self.state.lock().unwrap().existing = existing;
    }

    /// Approves everything pending now and everything submitted later.
    pub fn approve_all(&self) {
        self.state.lock().unwrap().approved = true;
    }

    /// The next `n` submissions fail as if the authority were down.
    pub fn fail_next_submissions(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Every CSR submitted, failed submissions included, as PEM.
    pub fn submitted_csrs(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    pub fn polls(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    fn issue(&self, csr_pem: &str) -> Result<IssuedCertificate, BackendError> {
        let csr = Csr::from_pem(csr_pem.as_bytes())?;
        let cn = csr.subject_cn().unwrap_or_default();
        let certificate = self
            .issuer
            .issue(&csr, &SubjectName::new(cn.as_str()), &dns_sans(&cn), &web_server_template("remote"))?;
        Ok(IssuedCertificate { certificate, chain: vec![self.issuer.certificate().clone()] })
    }
}

#[async_trait]
impl EnrollmentAuthority for FakeAuthority {
    async fn find_existing(
        &self,
        _subject: &str,
        _template: &TemplateName,
    ) -> Result<Option<ExistingRequest>, BackendError> {
        Ok(self.state.lock().unwrap().existing.clone())
    }

    async fn submit(&self, csr: &Csr, _template: &TemplateName) -> Result<SubmitOutcome, BackendError> {
        let pem = csr.to_pem()?;
        {
            let mut state = self.state.lock().unwrap();
            state.submitted.push(pem.clone());
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(BackendError::Unreachable("connection refused".into()));
            }
            if !state.approved {
                let token = PendingToken::new(format!("fake-{}", state.submitted.len()));
                state.pending.insert(token.clone(), pem.clone());
                return Ok(SubmitOutcome::Pending(token));
            }
        }
        Ok(SubmitOutcome::Issued(self.issue(&pem)?))
    }

    async fn poll(&self, token: &PendingToken) -> Result<PollOutcome, BackendError> {
        let pem = {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            let Some(pem) = state.pending.get(token).cloned() else {
                return Err(BackendError::UnknownToken(token.clone()));
            };
            if !state.approved {
                return Ok(PollOutcome::StillPending);
            }
            pem
        };
        Ok(PollOutcome::Issued(self.issue(&pem)?))
    }
}


//------------ FakeVerifier --------------------------------------------------

/// A subject host that serves whatever key authorizations it was given.
#[derive(Default)]
pub struct FakeVerifier {
    answers: Mutex<HashSet<String>>,
}

impl FakeVerifier {
    pub fn answer(&self, key_authorization: &str) {
        self.answers.lock().unwrap().insert(key_authorization.to_string());
    }
}

#[async_trait]
impl ChallengeVerifier for FakeVerifier {
    async fn verify(&self, challenge: &Challenge) -> Result<bool, BackendError> {
        Ok(self.answers.lock().unwrap().contains(&challenge.key_authorization))
    }
}


//------------ FakeAppliance -------------------------------------------------

/// An appliance with a candidate and a running configuration holding one
/// certificate.
#[derive(Default)]
pub struct FakeAppliance {
    state: Mutex<ApplianceState>,
}

#[derive(Clone, Default)]
struct ApplianceCert {
    thumbprint: Option<Thumbprint>,
    bundle: Option<Vec<u8>>,
}

#[derive(Default)]
struct ApplianceState {
    candidate: Option<ApplianceCert>,

    /// A deletion waits for the commit.
    delete: bool,
    running: Option<ApplianceCert>,
    fail_next: usize,
    imports: usize,
    commits: usize,
    validations: usize,
}

impl FakeAppliance {
    /// Puts a certificate for `cn` in place as if installed earlier.
    pub fn preinstall(&self, cn: &str) -> Thumbprint {
        let (cert, key, chain) = issued_material(cn);
        let passphrase = SecretString::new(TEST_PKCS12_PASSPHRASE.into());
        let bundle = pkcs12_bundle(cn, &cert, &key, &chain, &passphrase).unwrap();
        let thumbprint = cert.thumbprint().unwrap();
        self.state.lock().unwrap().running =
            Some(ApplianceCert { thumbprint: Some(thumbprint.clone()), bundle: Some(bundle) });
        thumbprint
    }

    pub fn fail_next_imports(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// The thumbprint of the running certificate.
    pub fn installed(&self) -> Option<Thumbprint> {
        self.state.lock().unwrap().running.as_ref().and_then(|cert| cert.thumbprint.clone())
    }

    pub fn imports(&self) -> usize {
        self.state.lock().unwrap().imports
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn validations(&self) -> usize {
        self.state.lock().unwrap().validations
    }
}

#[async_trait]
impl ApplianceApi for FakeAppliance {
    async fn import_certificate(
        &self,
        name: &str,
        material: &InstallMaterial,
        passphrase: &SecretString,
        _dry_run: bool,
    ) -> Result<(), DistributionError> {
        let cert = ApplianceCert {
            thumbprint: Some(material.thumbprint()?),
            bundle: material.pkcs12(name, passphrase)?,
        };
        let mut state = self.state.lock().unwrap();
        state.imports += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DistributionError::Unreachable("management interface timed out".into()));
        }
        state.candidate = Some(cert);
        state.delete = false;
        Ok(())
    }

    async fn delete_certificate(&self, _name: &str) -> Result<(), DistributionError> {
        let mut state = self.state.lock().unwrap();
        state.candidate = None;
        state.delete = true;
        Ok(())
    }

    async fn commit_configuration(&self, dry_run: bool) -> Result<(), DistributionError> {
        let mut state = self.state.lock().unwrap();
        let candidate = state.candidate.take();
        let delete = std::mem::take(&mut state.delete);
        if dry_run {
            state.validations += 1;
        } else {
            state.commits += 1;
            if delete {
                state.running = None;
            } else if candidate.is_some() {
                state.running = candidate;
            }
        }
        Ok(())
    }

    async fn fetch_certificate(
        &self,
        _name: &str,
        _passphrase: &SecretString,
    ) -> Result<Option<Vec<u8>>, DistributionError> {
        Ok(self.state.lock().unwrap().running.as_ref().and_then(|cert| cert.bundle.clone()))
    }
}


//------------ FakeChannel ---------------------------------------------------

/// A host that records commands and keeps files in memory.
pub struct FakeChannel {
    local: bool,
    runs: Mutex<Vec<(String, Vec<u8>)>>,
    responses: Mutex<VecDeque<CommandOutput>>,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl FakeChannel {
    fn new(local: bool) -> Self {
        FakeChannel {
            local,
            runs: Mutex::new(vec![]),
            responses: Mutex::new(VecDeque::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn local() -> Self {
        Self::new(true)
    }

    pub fn remote() -> Self {
        Self::new(false)
    }

    /// Queues the output of a later command. Without one, commands
    /// succeed silently.
    pub fn respond(&self, output: CommandOutput) {
        self.responses.lock().unwrap().push_back(output);
    }

    /// Commands run so far, with what they got on stdin.
    pub fn runs(&self) -> Vec<(String, Vec<u8>)> {
        self.runs.lock().unwrap().clone()
    }

    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    fn is_local(&self) -> bool {
        self.local
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, DistributionError> {
        self.runs
            .lock()
            .unwrap()
            .push((command.to_string(), stdin.map(<[u8]>::to_vec).unwrap_or_default()));
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CommandOutput { status: Some(0), ..Default::default() }))
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, DistributionError> {
        Ok(self.file(path))
    }

    async fn write_file(&self, path: &Path, content: &[u8], _mode: &FileMode) -> Result<(), DistributionError> {
        self.files.lock().unwrap().insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<(), DistributionError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }
}


//------------ FakeProbe -----------------------------------------------------

pub struct FakeProbe {
    healthy: bool,
    checks: Mutex<usize>,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        FakeProbe { healthy: true, checks: Mutex::new(0) }
    }

    /// A service that never picks up a new certificate.
    pub fn failing() -> Self {
        FakeProbe { healthy: false, checks: Mutex::new(0) }
    }

    pub fn checks(&self) -> usize {
        *self.checks.lock().unwrap()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check(&self, target: &DistributionTarget, _expected: &InstallMaterial) -> Result<(), DistributionError> {
        *self.checks.lock().unwrap() += 1;
        if self.healthy {
            Ok(())
        } else {
            Err(DistributionError::HealthCheck(format!("{} still serves the old certificate", target.address)))
        }
    }
}


//------------ PipelineFixture -----------------------------------------------

/// A pipeline on memory storage with two templates: "WebServer" signed by
/// a local CA and "Remote" enrolled with a [`FakeAuthority`], and a target
/// "applianceA".
pub struct PipelineFixture {
    pub storage_uri: Url,
    pub config: PipelineConfig,
    pub audit: AuditLog,
    pub hierarchy: Arc<CaHierarchyManager>,
    pub templates: Arc<TemplateRegistry>,
    pub targets: Arc<TargetRegistry>,
    pub authority: Arc<FakeAuthority>,
    pub pipeline: Arc<CertificateRequestPipeline>,
}

impl PipelineFixture {
    pub fn new() -> Self {
        let storage_uri = mem_storage();
        let audit = AuditLog::in_memory();
        let config = PipelineConfig {
            max_attempts: 3,
            retry_delay_seconds: 5,
            poll_initial_seconds: 5,
            poll_max_interval_seconds: 30,
            poll_multiplier: 2.0,
            approval_timeout_seconds: 120,
        };

        let hierarchy = Arc::new(CaHierarchyManager::build(&storage_uri, audit.clone()).unwrap());
        let issuing = register_test_cas(&hierarchy);

        let templates = Arc::new(TemplateRegistry::build(&storage_uri, audit.clone()).unwrap());
        templates.publish(web_server_template("local"), &ACTOR_DEF_TEST).unwrap();
        let mut remote = web_server_template("remote");
        remote.name = TemplateName::from("Remote");
        templates.publish(remote, &ACTOR_DEF_TEST).unwrap();

        let targets = Arc::new(TargetRegistry::build(&storage_uri).unwrap());
        targets.configure(appliance_target("applianceA")).unwrap();

        let authority = Arc::new(FakeAuthority::issuing_from(&hierarchy, &issuing));
        let backends = vec![
            SigningBackendAdapter::DirectSign(DirectSigner::build("local", issuing, hierarchy.clone(), &storage_uri).unwrap()),
            SigningBackendAdapter::RemoteEnroll(RemoteEnroller::new("remote", authority.clone())),
        ];
        let pipeline = CertificateRequestPipeline::build(
            config.clone(),
            &storage_uri,
            hierarchy.clone(),
            templates.clone(),
            targets.clone(),
            backends,
            audit.clone(),
        )
        .unwrap();

        PipelineFixture {
            storage_uri,
            config,
            audit,
            hierarchy,
            templates,
            targets,
            authority,
            pipeline: Arc::new(pipeline),
        }
    }
}

impl Default for PipelineFixture {
    fn default() -> Self {
        Self::new()
    }
}


//------------ DistributionFixture -------------------------------------------

/// A [`PipelineFixture`] with a distribution engine and renewal scheduler
/// on top. "applianceA" is a [`FakeAppliance`], "web1" a directory of
/// PEM files on this host.
pub struct DistributionFixture {
    pub storage_uri: Url,
    pub audit: AuditLog,
    pub pipeline: Arc<CertificateRequestPipeline>,
    pub targets: Arc<TargetRegistry>,
    pub appliance: Arc<FakeAppliance>,
    pub engine: Arc<DistributionEngine>,
    pub renewal: RenewalScheduler,
    dir: TempDir,
}

impl DistributionFixture {
    pub fn new() -> Self {
        Self::build(FakeProbe::healthy(), false)
    }

    pub fn with_probe(probe: FakeProbe) -> Self {
        Self::build(probe, false)
    }

    pub fn dry_run() -> Self {
        Self::build(FakeProbe::healthy(), true)
    }

    fn build(probe: FakeProbe, dry_run: bool) -> Self {
        let base = PipelineFixture::new();
        let dir = tempfile::tempdir().unwrap();
        base.targets.configure(unix_target("web1", dir.path())).unwrap();

        let secrets = StaticSecretStore::new().with(
            DISTRIBUTION_PKCS12_PASSPHRASE_REF,
            Credential::api_key(TEST_PKCS12_PASSPHRASE),
        );
        let config = DistributionConfig {
            grace_seconds: 60,
            probe_interval_seconds: 5,
            max_attempts: 3,
            retry_delay_seconds: 5,
            probe: ProbeKind::None,
            ..Default::default()
        };
        let appliance = Arc::new(FakeAppliance::default());
        let engine = DistributionEngine::build(
            config,
            &base.storage_uri,
            base.pipeline.clone(),
            base.targets.clone(),
            Arc::new(secrets),
            base.audit.clone(),
        )
        .unwrap()
        .with_dry_run(dry_run)
        .with_probe(Arc::new(probe))
        .with_appliance_api(TargetId::from("applianceA"), appliance.clone());
        let engine = Arc::new(engine);

        let renewal = RenewalScheduler::new(
            RenewalConfig { interval_seconds: 3600, auto_distribute: true },
            base.pipeline.clone(),
            engine.clone(),
            base.audit.clone(),
        );

        DistributionFixture {
            storage_uri: base.storage_uri,
            audit: base.audit,
            pipeline: base.pipeline,
            targets: base.targets,
            appliance,
            engine,
            renewal,
            dir,
        }
    }

    /// Where "web1" keeps its files.
    pub fn web1_files(&self) -> UnixFiles {
        UnixFiles::from_settings(&unix_target("web1", self.dir.path()).settings).unwrap()
    }

    /// Pretends the certificate of a request expires in `left`.
    pub fn expire_soon(&self, id: RequestId, left: chrono::Duration) {
        let store = KeyValueStore::create(&self.storage_uri, REQUESTS_NS).unwrap();
        let mut request: EnrollmentRequest = store.get(&id.storage_key()).unwrap().unwrap();
        request.not_after = Some(Utc::now() + left);
        store.store(&id.storage_key(), &request).unwrap();
    }
}

impl Default for DistributionFixture {
    fn default() -> Self {
        Self::new()
    }
}
