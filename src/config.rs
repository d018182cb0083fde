//! The daemon configuration, read from a TOML file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, fs, io};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use log::{LevelFilter, info};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;
use url::Url;

use crate::api::target::DistributionTarget;
use crate::api::template::CertificateTemplate;
use crate::commons::crypto::KeyAlgorithm;
use crate::commons::error::Error;
use crate::commons::storage::StorageUri;
use crate::constants::*;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn storage_uri() -> Url {
        let uri = env::var(CUSTODIAN_ENV_STORAGE_URI).unwrap_or_else(|_| CUSTODIAN_DEFAULT_STORAGE_URI.to_string());
        match Url::parse(&uri) {
            Ok(uri) => uri,
            Err(e) => {
                eprintln!("Invalid storage URI '{}': {}", uri, e);
                ::std::process::exit(1);
            }
        }
    }

    fn log_level() -> LevelFilter {
        match env::var(CUSTODIAN_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {}", CUSTODIAN_ENV_LOG_LEVEL);
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(CUSTODIAN_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(e) => {
                    eprintln!("{} in env var {}", e, CUSTODIAN_ENV_LOG_TYPE);
                    ::std::process::exit(1);
                }
            },
            _ => LogType::Stderr,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./custodian.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }
}


//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::storage_uri")]
    pub storage_uri: Url,

    #[serde(default = "ConfigDefaults::log_level", deserialize_with = "de_level_filter")]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    /// Validate every distribution, commit none.
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub renewal: RenewalConfig,

    /// The CA hierarchy, parents before their children.
    #[serde(default)]
    pub authorities: Vec<AuthorityConfig>,

    #[serde(default)]
    pub templates: Vec<CertificateTemplate>,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub targets: Vec<DistributionTarget>,
}

/// # Loading
///
impl Config {
    /// Reads the config file, sets up logging and checks the result.
    pub fn create(config_file: &str) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Err(e) => {
                if config_file == CUSTODIAN_DEFAULT_CONFIG_FILE {
                    Err(ConfigError::Other(format!(
                        "Cannot read config file {}: {}. Please use --config to specify its location.",
                        config_file, e
                    )))
                } else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {}, error: {}",
                        config_file, e
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!("{} uses configuration file: {}", CUSTODIAN_SERVER_APP, config_file);
                Ok(config)
            }
        }?;
        config
            .verify()
            .map_err(|e| ConfigError::Other(format!("Error in config file: {}, error: {}", config_file, e)))?;
        Ok(config)
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// A configuration for tests, on the given storage and without any
    /// authorities, templates or targets.
    pub fn test(storage_uri: Url) -> Self {
        Config {
            storage_uri,
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            dry_run: false,
            pipeline: PipelineConfig::default(),
            distribution: DistributionConfig { probe: ProbeKind::None, ..Default::default() },
            renewal: RenewalConfig::default(),
            authorities: vec![],
            templates: vec![],
            backends: vec![],
            targets: vec![],
        }
    }

    /// Checks values and that everything refers to something that
    /// exists.
    pub fn verify(&self) -> Result<(), ConfigError> {
        StorageUri::parse(&self.storage_uri).map_err(|e| ConfigError::Other(e.to_string()))?;
        self.pipeline.verify()?;
        self.distribution.verify()?;
        self.renewal.verify()?;

        let mut authorities = HashSet::new();
        let mut imported = HashSet::new();
        for authority in &self.authorities {
            if let Some(parent) = &authority.parent {
                if !authorities.contains(parent.as_str()) {
                    return Err(ConfigError::Other(format!(
                        "authority '{}' has parent '{}', which must be listed before it",
                        authority.name, parent
                    )));
                }
            }
            if authority.validity_days == 0 {
                return Err(ConfigError::Other(format!(
                    "authority '{}' needs a validity of at least one day",
                    authority.name
                )));
            }
            if !authorities.insert(authority.name.as_str()) {
                return Err(ConfigError::Other(format!("authority '{}' is listed twice", authority.name)));
            }
            if authority.is_imported() {
                imported.insert(authority.name.as_str());
            }
        }

        let mut backends = HashSet::new();
        for backend in &self.backends {
            if let Some(authority) = backend.authority() {
                if !authorities.contains(authority) {
                    return Err(ConfigError::Other(format!(
                        "backend '{}' uses unknown authority '{}'",
                        backend.name(),
                        authority
                    )));
                }
                if imported.contains(authority) {
                    return Err(ConfigError::Other(format!(
                        "backend '{}' cannot sign with '{}', its key is held elsewhere",
                        backend.name(),
                        authority
                    )));
                }
            }
            if !backends.insert(backend.name()) {
                return Err(ConfigError::Other(format!("backend '{}' is listed twice", backend.name())));
            }
        }

        for template in &self.templates {
            template.verify().map_err(|e| ConfigError::Other(e.to_string()))?;
            if !backends.contains(template.backend.as_str()) {
                return Err(ConfigError::Other(format!(
                    "template '{}' uses unknown backend '{}'",
                    template.name, template.backend
                )));
            }
        }

        let mut targets = HashSet::new();
        for target in &self.targets {
            if !targets.insert(&target.id) {
                return Err(ConfigError::Other(format!("target '{}' is listed twice", target.id)));
            }
        }

        Ok(())
    }
}

/// # Logging
///
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::Other(format!("Invalid syslog_facility '{}'", self.syslog_facility)))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("syslog is only supported on unix")),
        }
    }

    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = fern::log_file(path)
            .map_err(|e| ConfigError::Other(format!("Failed to open log file '{}': {}", path.display(), e)))?;
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| path.file_name().and_then(std::ffi::OsStr::to_str).map(ToString::to_string))
            .unwrap_or_else(|| String::from("custodiand"));
        let formatter = syslog::Formatter3164 { facility, hostname: None, process, pid: std::process::id() };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => Err(ConfigError::Other(format!("Cannot connect to syslog: {}", err))),
        }
    }

    /// A dispatch with the configured level, and framework noise capped
    /// at warnings.
    fn fern_logger(&self) -> fern::Dispatch {
        let framework_level = self.log_level.min(LevelFilter::Warn);
        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;

        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("reqwest", framework_level)
            .level_for("rustls", framework_level)
            .level_for("tokio_rustls", framework_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("h2", framework_level)
            .level_for("mio", framework_level)
            .level_for("want", framework_level)
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ PipelineConfig ------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    /// Submissions per request, the first included.
    #[serde(default = "PipelineConfig::dflt_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "PipelineConfig::dflt_retry_delay_seconds")]
    pub retry_delay_seconds: u64,

    #[serde(default = "PipelineConfig::dflt_poll_initial_seconds")]
    pub poll_initial_seconds: u64,

    #[serde(default = "PipelineConfig::dflt_poll_max_interval_seconds")]
    pub poll_max_interval_seconds: u64,

    #[serde(default = "PipelineConfig::dflt_poll_multiplier")]
    pub poll_multiplier: f64,

    /// How long a backend may keep a request pending.
    #[serde(default = "PipelineConfig::dflt_approval_timeout_seconds")]
    pub approval_timeout_seconds: u64,
}

impl PipelineConfig {
    fn dflt_max_attempts() -> u32 {
        PIPELINE_MAX_ATTEMPTS
    }

    fn dflt_retry_delay_seconds() -> u64 {
        PIPELINE_RETRY_DELAY_SECONDS
    }

    fn dflt_poll_initial_seconds() -> u64 {
        PIPELINE_POLL_INITIAL_SECONDS
    }

    fn dflt_poll_max_interval_seconds() -> u64 {
        PIPELINE_POLL_MAX_INTERVAL_SECONDS
    }

    fn dflt_poll_multiplier() -> f64 {
        PIPELINE_POLL_MULTIPLIER
    }

    fn dflt_approval_timeout_seconds() -> u64 {
        PIPELINE_APPROVAL_TIMEOUT_SECONDS
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_seconds)
    }

    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_secs(self.poll_max_interval_seconds)
    }

    /// Delays between polls of a pending request. Never runs out: the
    /// approval timeout bounds the total wait.
    pub fn poll_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(self.poll_initial_seconds),
            max_interval: self.poll_max_interval(),
            multiplier: self.poll_multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::other("pipeline.max_attempts must be at least 1"));
        }
        if self.poll_initial_seconds == 0 || self.poll_initial_seconds > self.poll_max_interval_seconds {
            return Err(ConfigError::other(
                "pipeline.poll_initial_seconds must be at least 1 and at most poll_max_interval_seconds",
            ));
        }
        if self.poll_multiplier < 1.0 {
            return Err(ConfigError::other("pipeline.poll_multiplier must be at least 1.0"));
        }
        if self.approval_timeout_seconds == 0 {
            return Err(ConfigError::other("pipeline.approval_timeout_seconds must be at least 1"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_attempts: Self::dflt_max_attempts(),
            retry_delay_seconds: Self::dflt_retry_delay_seconds(),
            poll_initial_seconds: Self::dflt_poll_initial_seconds(),
            poll_max_interval_seconds: Self::dflt_poll_max_interval_seconds(),
            poll_multiplier: Self::dflt_poll_multiplier(),
            approval_timeout_seconds: Self::dflt_approval_timeout_seconds(),
        }
    }
}


//------------ ProbeKind -----------------------------------------------------

/// How a service is checked after an install.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    #[default]
    Tls,
    None,
}


//------------ DistributionConfig --------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct DistributionConfig {
    /// How long a service gets to serve a new certificate.
    #[serde(default = "DistributionConfig::dflt_grace_seconds")]
    pub grace_seconds: u64,

    #[serde(default = "DistributionConfig::dflt_probe_interval_seconds")]
    pub probe_interval_seconds: u64,

    /// Attempts per target operation, the first included.
    #[serde(default = "DistributionConfig::dflt_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "DistributionConfig::dflt_retry_delay_seconds")]
    pub retry_delay_seconds: u64,

    #[serde(default)]
    pub probe: ProbeKind,

    #[serde(default = "DistributionConfig::dflt_pkcs12_passphrase_ref")]
    pub pkcs12_passphrase_ref: String,
}

impl DistributionConfig {
    fn dflt_grace_seconds() -> u64 {
        DISTRIBUTION_GRACE_SECONDS
    }

    fn dflt_probe_interval_seconds() -> u64 {
        DISTRIBUTION_PROBE_INTERVAL_SECONDS
    }

    fn dflt_max_attempts() -> u32 {
        DISTRIBUTION_MAX_ATTEMPTS
    }

    fn dflt_retry_delay_seconds() -> u64 {
        DISTRIBUTION_RETRY_DELAY_SECONDS
    }

    fn dflt_pkcs12_passphrase_ref() -> String {
        DISTRIBUTION_PKCS12_PASSPHRASE_REF.to_string()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Delays between attempts on a target, doubling from the retry
    /// delay.
    pub fn retry_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry_delay(),
            max_interval: self.retry_delay() * 8,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::other("distribution.max_attempts must be at least 1"));
        }
        if self.probe == ProbeKind::Tls && self.probe_interval_seconds == 0 {
            return Err(ConfigError::other("distribution.probe_interval_seconds must be at least 1"));
        }
        Ok(())
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig {
            grace_seconds: Self::dflt_grace_seconds(),
            probe_interval_seconds: Self::dflt_probe_interval_seconds(),
            max_attempts: Self::dflt_max_attempts(),
            retry_delay_seconds: Self::dflt_retry_delay_seconds(),
            probe: ProbeKind::default(),
            pkcs12_passphrase_ref: Self::dflt_pkcs12_passphrase_ref(),
        }
    }
}


//------------ RenewalConfig -------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct RenewalConfig {
    #[serde(default = "RenewalConfig::dflt_interval_seconds")]
    pub interval_seconds: u64,

    /// Install renewed certificates on the targets of the request they
    /// replace.
    #[serde(default = "RenewalConfig::dflt_auto_distribute")]
    pub auto_distribute: bool,
}

impl RenewalConfig {
    fn dflt_interval_seconds() -> u64 {
        RENEWAL_INTERVAL_SECONDS
    }

    fn dflt_auto_distribute() -> bool {
        true
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.interval_seconds == 0 {
            return Err(ConfigError::other("renewal.interval_seconds must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        RenewalConfig {
            interval_seconds: Self::dflt_interval_seconds(),
            auto_distribute: Self::dflt_auto_distribute(),
        }
    }
}


//------------ AuthorityConfig -----------------------------------------------

/// A CA to create at startup, unless one with this name exists.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct AuthorityConfig {
    /// The common name of the CA.
    pub name: String,

    /// The name of the parent CA. A CA without one is a root.
    #[serde(default)]
    pub parent: Option<String>,

    /// A PEM file with the certificate of a CA operated elsewhere.
    ///
    /// Such a CA is imported rather than created: the custodian holds no
    /// key for it and the remaining settings are ignored.
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    #[serde(default = "AuthorityConfig::dflt_validity_days")]
    pub validity_days: u32,

    #[serde(default)]
    pub path_len: Option<u32>,

    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,

    #[serde(default = "AuthorityConfig::dflt_key_bits")]
    pub key_bits: u32,
}

impl AuthorityConfig {
    /// A CA to create with a key of its own.
    pub fn local(name: &str, parent: Option<&str>) -> Self {
        AuthorityConfig {
            name: name.to_string(),
            parent: parent.map(ToString::to_string),
            certificate: None,
            validity_days: Self::dflt_validity_days(),
            path_len: None,
            key_algorithm: KeyAlgorithm::default(),
            key_bits: Self::dflt_key_bits(),
        }
    }

    /// A CA operated elsewhere, known by its certificate.
    pub fn imported(name: &str, parent: Option<&str>, certificate: PathBuf) -> Self {
        AuthorityConfig { certificate: Some(certificate), ..Self::local(name, parent) }
    }

    pub fn is_imported(&self) -> bool {
        self.certificate.is_some()
    }

    fn dflt_validity_days() -> u32 {
        CA_DEFAULT_VALIDITY_DAYS
    }

    fn dflt_key_bits() -> u32 {
        CA_DEFAULT_KEY_BITS
    }
}


//------------ BackendConfig -------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Signs with a local CA.
    Direct { name: String, authority: String },

    /// An EST enrollment server.
    Est {
        name: String,
        url: Url,

        /// Put the template name into the URL as the EST label.
        #[serde(default)]
        template_labels: bool,

        /// Secret store reference for HTTP basic authentication.
        #[serde(default)]
        credential_ref: Option<String>,
    },

    /// A local CA that issues once the subject host serves a challenge.
    Challenge { name: String, authority: String },
}

impl BackendConfig {
    pub fn name(&self) -> &str {
        match self {
            BackendConfig::Direct { name, .. }
            | BackendConfig::Est { name, .. }
            | BackendConfig::Challenge { name, .. } => name,
        }
    }

    /// The local CA the backend signs with, if any.
    pub fn authority(&self) -> Option<&str> {
        match self {
            BackendConfig::Direct { authority, .. } | BackendConfig::Challenge { authority, .. } => Some(authority),
            BackendConfig::Est { .. } => None,
        }
    }
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::ConfigError(e.to_string())
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ Tests ---------------------------------------------------------
