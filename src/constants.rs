//! Various Custodian-wide constants.

use crate::commons::actor::Actor;


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `custodiand` binary.
pub const CUSTODIAN_SERVER_APP: &str = "Custodian";


//------------ Config Files Paths -------------------------------------------

/// The default path to the Custodian config file.
pub const CUSTODIAN_DEFAULT_CONFIG_FILE: &str = "/etc/custodian.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const CUSTODIAN_ENV_LOG_LEVEL: &str = "CUSTODIAN_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::config::LogType]. It will be overwritten by the
/// config file. The default is “stderr.”
pub const CUSTODIAN_ENV_LOG_TYPE: &str = "CUSTODIAN_LOG_TYPE";

/// The environment variable indicating the default storage URI.
///
/// The URI given in the config file takes precedence.
pub const CUSTODIAN_ENV_STORAGE_URI: &str = "CUSTODIAN_STORAGE_URI";

/// The prefix of environment variables read by the environment secret
/// store.
///
/// A credential reference `fw-a` is looked up as `CUSTODIAN_FW_A_API_KEY`,
/// or as the pair `CUSTODIAN_FW_A_USERNAME` and `CUSTODIAN_FW_A_PASSWORD`.
pub const CUSTODIAN_ENV_SECRET_PREFIX: &str = "CUSTODIAN_";

/// Colon separated list of PEM files with extra HTTPS root certificates
/// for outgoing requests.
pub const CUSTODIAN_HTTPS_ROOT_CERTS_ENV: &str = "CUSTODIAN_HTTPS_ROOT_CERTS";

/// The default storage location if neither config nor environment set one.
pub const CUSTODIAN_DEFAULT_STORAGE_URI: &str = "local:///var/lib/custodian/data";


//------------ HTTP Client --------------------------------------------------

pub const HTTP_CLIENT_TIMEOUT_SECS: u64 = 120;
pub const HTTP_USER_AGENT: &str = concat!("custodian/", env!("CARGO_PKG_VERSION"));


//------------ Storage Namespaces -------------------------------------------

pub const CAS_NS: &str = "cas";
pub const CA_KEYS_NS: &str = "ca_keys";
pub const TEMPLATES_NS: &str = "templates";
pub const REQUESTS_NS: &str = "requests";
pub const KEYS_NS: &str = "keys";
pub const TARGETS_NS: &str = "targets";
pub const BACKUPS_NS: &str = "backups";
pub const DIRECT_LEDGER_NS: &str = "direct_ledger";

/// Directory under the storage root that holds the audit log.
pub const AUDIT_DIR: &str = "audit";

/// The audit log file, one JSON event per line.
pub const AUDIT_FILE: &str = "audit.log";


//------------ Pipeline Defaults --------------------------------------------

pub const PIPELINE_MAX_ATTEMPTS: u32 = 3;
pub const PIPELINE_RETRY_DELAY_SECONDS: u64 = 5;
pub const PIPELINE_POLL_INITIAL_SECONDS: u64 = 5;
pub const PIPELINE_POLL_MAX_INTERVAL_SECONDS: u64 = 300;
pub const PIPELINE_POLL_MULTIPLIER: f64 = 2.0;
pub const PIPELINE_APPROVAL_TIMEOUT_SECONDS: u64 = 86_400;


//------------ Distribution Defaults ----------------------------------------

pub const DISTRIBUTION_GRACE_SECONDS: u64 = 60;
pub const DISTRIBUTION_PROBE_INTERVAL_SECONDS: u64 = 5;
pub const DISTRIBUTION_MAX_ATTEMPTS: u32 = 3;
pub const DISTRIBUTION_RETRY_DELAY_SECONDS: u64 = 5;

/// The default secret store reference for the PKCS#12 bundle passphrase.
pub const DISTRIBUTION_PKCS12_PASSPHRASE_REF: &str = "pkcs12";

/// The port probed when a target's probe address carries none.
pub const DEFAULT_PROBE_PORT: u16 = 443;


//------------ Renewal Defaults ---------------------------------------------

pub const RENEWAL_INTERVAL_SECONDS: u64 = 3600;


//------------ Crypto -------------------------------------------------------

/// Number of random bits in serial numbers issued by local CAs.
///
/// Keeps the DER integer positive and at most 20 octets.
pub const SERIAL_BITS: i32 = 159;

/// The default RSA modulus size for CA keys.
pub const CA_DEFAULT_KEY_BITS: u32 = 4096;

/// Validity of a CA certificate unless configured otherwise.
pub const CA_DEFAULT_VALIDITY_DAYS: u32 = 3650;


//------------ Challenges ---------------------------------------------------

/// Where an HTTP challenge token must be served on the subject host.
pub const CHALLENGE_WELL_KNOWN_PATH: &str = "/.well-known/pki-validation/";

/// How long an outstanding challenge stays valid.
pub const CHALLENGE_VALIDITY_HOURS: i64 = 24;

/// Length of generated challenge tokens.
pub const CHALLENGE_TOKEN_LEN: usize = 32;


//------------ Actors -------------------------------------------------------

pub const ACTOR_DEF_CUSTODIAN: Actor = Actor::system("custodian");
pub const ACTOR_DEF_SCHEDULER: Actor = Actor::system("renewal-scheduler");
pub const ACTOR_DEF_TEST: Actor = Actor::system("test");
