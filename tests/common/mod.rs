#![allow(dead_code)] // Different tests use different parts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use url::Url;

use custodian::api::request::{EnrollmentRequest, NewEnrollment, RequestId, RequestState};
use custodian::api::target::TargetId;
use custodian::api::template::TemplateName;
use custodian::commons::crypto::KeyAlgorithm;
use custodian::commons::storage::KeyValueStore;
use custodian::config::{AuthorityConfig, BackendConfig, Config, PipelineConfig, ProbeKind};
use custodian::constants::{ACTOR_DEF_TEST, DISTRIBUTION_PKCS12_PASSPHRASE_REF, REQUESTS_NS};
use custodian::server::manager::{CustodyManager, ManagerBuilder};
use custodian::server::secrets::{Credential, StaticSecretStore};
use custodian::test::{self, FakeAppliance, FakeAuthority, FakeProbe};

pub const WAIT: Duration = Duration::from_secs(600);

pub const ROOT_CA: &str = "Test Root CA";
pub const ISSUING_CA: &str = "Test Issuing CA";

/// The CAs of the remote authority, imported by certificate.
pub const CORP_ROOT_CA: &str = "Corp Root CA";
pub const CORP_ISSUING_CA: &str = "Corp Issuing CA";

pub fn init_logging() {
    let _ = stderrlog::new().verbosity(3).init();
}


//------------ Custodian -----------------------------------------------------

/// A custodian with fake outside parties.
///
/// Template "WebServer" is signed by the local issuing CA, template
/// "Remote" goes to a [`FakeAuthority`] that needs approval and issues
/// from CAs of its own. Target "applianceA" is a [`FakeAppliance`],
/// "web1" a directory of PEM files.
pub struct Custodian {
    pub manager: CustodyManager,
    pub authority: Arc<FakeAuthority>,
    pub appliance: Arc<FakeAppliance>,
    pub storage_uri: Url,
    dir: TempDir,
}

impl Custodian {
    pub fn start() -> Self {
        Self::start_with(test::mem_storage(), FakeProbe::healthy(), tempfile::tempdir().unwrap())
    }

    pub fn with_probe(probe: FakeProbe) -> Self {
        Self::start_with(test::mem_storage(), probe, tempfile::tempdir().unwrap())
    }

    /// Starts on disk storage in `dir`, picking up what is there.
    pub fn on_disk(dir: TempDir) -> Self {
        let storage_uri = test::tmp_storage(dir.path());
        Self::start_with(storage_uri, FakeProbe::healthy(), dir)
    }

    fn start_with(storage_uri: Url, probe: FakeProbe, dir: TempDir) -> Self {
        init_logging();

        let authority = Arc::new(FakeAuthority::corporate());
        let appliance = Arc::new(FakeAppliance::default());

        let config = config(storage_uri.clone(), &dir, &authority);
        let secrets = StaticSecretStore::new().with(
            DISTRIBUTION_PKCS12_PASSPHRASE_REF,
            Credential::api_key(test::TEST_PKCS12_PASSPHRASE),
        );
        let manager = ManagerBuilder::new(Arc::new(config))
            .with_secret_store(Arc::new(secrets))
            .with_enrollment_authority("remote", authority.clone())
            .with_appliance_api("applianceA", appliance.clone())
            .with_probe(Arc::new(probe))
            .build()
            .unwrap();

        Custodian { manager, authority, appliance, storage_uri, dir }
    }

    /// Stops the custodian, handing back its directory.
    pub fn stop(self) -> TempDir {
        self.manager.shutdown();
        self.dir
    }

    pub async fn completed(&self, cn: &str) -> EnrollmentRequest {
        let new = NewEnrollment::new(cn, "WebServer").with_target("applianceA");
        let request = self.manager.enroll(new, &ACTOR_DEF_TEST).await.unwrap();
        assert_eq!(request.state, RequestState::Completed);
        request
    }

    /// Pretends the certificate of a request expires in `left`.
    pub fn expire_soon(&self, id: RequestId, left: chrono::Duration) {
        let store = KeyValueStore::create(&self.storage_uri, REQUESTS_NS).unwrap();
        let mut request: EnrollmentRequest = store.get(&id.storage_key()).unwrap().unwrap();
        request.not_after = Some(Utc::now() + left);
        store.store(&id.storage_key(), &request).unwrap();
    }
}

pub fn appliance() -> TargetId {
    TargetId::from("applianceA")
}

fn authority(name: &str, parent: Option<&str>, validity_days: u32) -> AuthorityConfig {
    AuthorityConfig {
        validity_days,
        key_algorithm: KeyAlgorithm::EcP256,
        key_bits: 0,
        ..AuthorityConfig::local(name, parent)
    }
}

/// Writes the remote authority's CA certificates where the config finds
/// them.
fn imported_authorities(dir: &TempDir, authority: &FakeAuthority) -> Vec<AuthorityConfig> {
    let [issuing, root] = authority.ca_certificates() else {
        panic!("expected an issuing and a root CA");
    };
    let issuing_pem = dir.path().join("corp-issuing.pem");
    let root_pem = dir.path().join("corp-root.pem");
    std::fs::write(&issuing_pem, issuing.to_pem().unwrap()).unwrap();
    std::fs::write(&root_pem, root.to_pem().unwrap()).unwrap();
    vec![
        AuthorityConfig::imported(CORP_ROOT_CA, None, root_pem),
        AuthorityConfig::imported(CORP_ISSUING_CA, Some(CORP_ROOT_CA), issuing_pem),
    ]
}

fn config(storage_uri: Url, dir: &TempDir, remote: &FakeAuthority) -> Config {
    let mut config = Config::test(storage_uri);
    config.pipeline = PipelineConfig {
        max_attempts: 3,
        retry_delay_seconds: 5,
        poll_initial_seconds: 5,
        poll_max_interval_seconds: 30,
        poll_multiplier: 2.0,
        approval_timeout_seconds: 120,
    };
    config.distribution.probe = ProbeKind::None;
    config.distribution.grace_seconds = 60;
    config.distribution.probe_interval_seconds = 5;
    config.distribution.retry_delay_seconds = 5;
    config.authorities = vec![authority(ROOT_CA, None, 3650), authority(ISSUING_CA, Some(ROOT_CA), 730)];
    config.authorities.extend(imported_authorities(dir, remote));
    config.backends = vec![
        BackendConfig::Direct { name: "local".into(), authority: ISSUING_CA.into() },
        BackendConfig::Est {
            name: "remote".into(),
            url: Url::parse("https://est.example.com/.well-known/est/").unwrap(),
            template_labels: false,
            credential_ref: None,
        },
    ];
    let mut remote = test::web_server_template("remote");
    remote.name = TemplateName::from("Remote");
    config.templates = vec![test::web_server_template("local"), remote];
    config.targets = vec![test::appliance_target("applianceA"), test::unix_target("web1", dir.path())];
    config
}
