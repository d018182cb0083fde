//! Network appliances managed through an API.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use log::{debug, info};
use secrecy::SecretString;

use crate::api::target::TargetMaterial;

use super::{DistributionError, InstallMaterial};


//------------ ApplianceApi --------------------------------------------------

/// The management API of an appliance.
///
/// Changes go to a candidate configuration first and only take effect
/// with a commit.
#[async_trait]
pub trait ApplianceApi: Send + Sync {
    /// Loads certificate, chain and, if present, key under `name` into
    /// the candidate configuration.
    async fn import_certificate(
        &self,
        name: &str,
        material: &InstallMaterial,
        passphrase: &SecretString,
        dry_run: bool,
    ) -> Result<(), DistributionError>;

    /// Takes the certificate under `name` out of the candidate
    /// configuration.
    async fn delete_certificate(&self, name: &str) -> Result<(), DistributionError>;

    /// Activates the candidate configuration. A dry run validates it and
    /// throws it away.
    async fn commit_configuration(&self, dry_run: bool) -> Result<(), DistributionError>;

    /// The certificate configured under `name`, with its key, as PKCS#12
    /// encrypted with `passphrase`.
    async fn fetch_certificate(
        &self,
        name: &str,
        passphrase: &SecretString,
    ) -> Result<Option<Vec<u8>>, DistributionError>;
}


//------------ ApplianceAdapter ----------------------------------------------

pub struct ApplianceAdapter {
    api: Arc<dyn ApplianceApi>,
    certificate_name: String,
    passphrase: SecretString,
}

impl ApplianceAdapter {
    pub fn new(api: Arc<dyn ApplianceApi>, certificate_name: String, passphrase: SecretString) -> Self {
        ApplianceAdapter { api, certificate_name, passphrase }
    }

    pub fn certificate_name(&self) -> &str {
        &self.certificate_name
    }

    pub(super) fn passphrase(&self) -> &SecretString {
        &self.passphrase
    }

    pub async fn capture(&self) -> Result<TargetMaterial, DistributionError> {
        match self.api.fetch_certificate(&self.certificate_name, &self.passphrase).await? {
            Some(bundle) => Ok(TargetMaterial::Pkcs12 { bundle: STANDARD.encode(bundle) }),
            None => {
                debug!("Appliance has no certificate '{}' yet", self.certificate_name);
                Ok(TargetMaterial::Empty)
            }
        }
    }

    pub async fn install(&self, material: &InstallMaterial, dry_run: bool) -> Result<(), DistributionError> {
        self.api
            .import_certificate(&self.certificate_name, material, &self.passphrase, dry_run)
            .await?;
        self.api.commit_configuration(dry_run).await
    }

    /// Deletes the certificate and commits.
    pub async fn remove(&self) -> Result<(), DistributionError> {
        self.api.delete_certificate(&self.certificate_name).await?;
        self.api.commit_configuration(false).await?;
        info!("Removed certificate '{}' from appliance", self.certificate_name);
        Ok(())
    }
}

impl fmt::Debug for ApplianceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ApplianceAdapter({})", self.certificate_name)
    }
}
