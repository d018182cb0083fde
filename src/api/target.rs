//! Distribution targets and installation outcomes.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::request::RequestId;
use crate::commons::crypto::Thumbprint;
use crate::commons::error::ErrorKind;


//------------ TargetId ------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        TargetId(s.to_string())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ TargetType ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    NetworkAppliance,
    DirectoryHost,
    UnixHost,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TargetType::NetworkAppliance => write!(f, "network appliance"),
            TargetType::DirectoryHost => write!(f, "directory host"),
            TargetType::UnixHost => write!(f, "unix host"),
        }
    }
}


//------------ UnixChannelKind -----------------------------------------------

/// How a Unix host is reached.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnixChannelKind {
    /// The host this daemon runs on.
    #[default]
    Local,
    Ssh,
}


//------------ TargetSettings ------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSettings {
    NetworkAppliance {
        /// Name of the certificate object on the appliance. Defaults to
        /// the service name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        certificate_name: Option<String>,
    },
    DirectoryHost {
        /// The personal certificate store to import into.
        #[serde(default = "TargetSettings::dflt_store")]
        store: String,
    },
    UnixHost {
        cert_path: PathBuf,
        key_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain_path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default = "TargetSettings::dflt_cert_mode")]
        cert_mode: u32,
        #[serde(default = "TargetSettings::dflt_key_mode")]
        key_mode: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reload_command: Option<String>,
        #[serde(default)]
        channel: UnixChannelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_port: Option<u16>,
    },
}

impl TargetSettings {
    fn dflt_store() -> String {
        "My".to_string()
    }

    fn dflt_cert_mode() -> u32 {
        0o644
    }

    fn dflt_key_mode() -> u32 {
        0o600
    }

    pub fn target_type(&self) -> TargetType {
        match self {
            TargetSettings::NetworkAppliance { .. } => TargetType::NetworkAppliance,
            TargetSettings::DirectoryHost { .. } => TargetType::DirectoryHost,
            TargetSettings::UnixHost { .. } => TargetType::UnixHost,
        }
    }
}


//------------ DistributionTarget --------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DistributionTarget {
    pub id: TargetId,

    #[serde(flatten)]
    pub settings: TargetSettings,

    /// Host name or address of the management interface.
    pub address: String,

    /// `host:port` to probe after an install. Defaults to the address on
    /// port 443.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_address: Option<String>,

    /// Secret store reference of the target's credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,

    /// The logical service the certificate is for. A target holds one
    /// active certificate for it.
    pub service_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_thumbprint: Option<Thumbprint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_request: Option<RequestId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

impl DistributionTarget {
    pub fn target_type(&self) -> TargetType {
        self.settings.target_type()
    }

    /// The reference under which the target's credentials are kept.
    pub fn credential_ref(&self) -> &str {
        self.credential_ref.as_deref().unwrap_or(self.id.as_str())
    }

    /// Configuration with the installation state of `current` carried
    /// over.
    pub fn with_state_of(mut self, current: &DistributionTarget) -> Self {
        self.last_thumbprint = current.last_thumbprint.clone();
        self.installed_request = current.installed_request;
        self.installed_at = current.installed_at;
        self
    }
}


//------------ SkipReason ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The target already has this exact certificate.
    AlreadyInstalled,

    /// Everything was validated, nothing was committed.
    DryRun,
}


//------------ DistributionOutcome -------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DistributionOutcome {
    Installed {
        thumbprint: Thumbprint,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        kind: ErrorKind,
        message: String,

        /// Whether the certificate the target had before was put back.
        rolled_back: bool,
    },
}

impl DistributionOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, DistributionOutcome::Installed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, DistributionOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DistributionOutcome::Failed { .. })
    }
}

impl fmt::Display for DistributionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DistributionOutcome::Installed { thumbprint } => write!(f, "installed {}", thumbprint),
            DistributionOutcome::Skipped { reason } => write!(f, "skipped ({:?})", reason),
            DistributionOutcome::Failed { kind, message, rolled_back } => {
                write!(f, "failed ({}): {}", kind, message)?;
                if *rolled_back {
                    write!(f, ", previous certificate restored")?;
                }
                Ok(())
            }
        }
    }
}


//------------ TargetMaterial ------------------------------------------------

/// Certificate material as found on, or written to, a target.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum TargetMaterial {
    /// The target had no certificate for the service.
    Empty,
    Pem {
        certificate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
    },
    Pkcs12 {
        /// Base64 DER, encrypted with the distribution passphrase.
        bundle: String,
    },
}


//------------ TargetBackup --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TargetBackup {
    /// Storage key, `<target>-<timestamp>`.
    pub key: String,
    pub target: TargetId,
    pub taken_at: DateTime<Utc>,
    pub thumbprint: Option<Thumbprint>,
    pub material: TargetMaterial,
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_from_toml() {
        let appliance: DistributionTarget = toml::from_str(
            r#"
            id = "applianceA"
            type = "network_appliance"
            address = "fw1.example.com"
            credential_ref = "fw1"
            service_name = "fw1-mgmt"
            "#,
        )
        .unwrap();
        assert_eq!(appliance.target_type(), TargetType::NetworkAppliance);
        assert_eq!(appliance.credential_ref(), "fw1");

        let unix: DistributionTarget = toml::from_str(
            r#"
            id = "web1"
            type = "unix_host"
            address = "localhost"
            service_name = "nginx"
            cert_path = "/etc/nginx/tls/cert.pem"
            key_path = "/etc/nginx/tls/key.pem"
            reload_command = "systemctl reload nginx"
            "#,
        )
        .unwrap();
        assert_eq!(unix.credential_ref(), "web1");
        match unix.settings {
            TargetSettings::UnixHost { key_mode, cert_mode, channel, .. } => {
                assert_eq!(key_mode, 0o600);
                assert_eq!(cert_mode, 0o644);
                assert_eq!(channel, UnixChannelKind::Local);
            }
            _ => panic!("expected unix host"),
        }
    }
}
