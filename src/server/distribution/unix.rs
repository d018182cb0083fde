//! Unix hosts where services read PEM files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::api::target::{TargetMaterial, TargetSettings};

use super::{DistributionError, FileMode, InstallMaterial, RemoteChannel, shell_quote};


//------------ UnixFiles -----------------------------------------------------

/// Where a service expects its certificate, and how to make it notice a
/// new one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnixFiles {
    /// Without a separate chain file this holds the leaf followed by its
    /// chain.
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub chain_path: Option<PathBuf>,
    pub cert_mode: FileMode,
    pub key_mode: FileMode,
    pub reload_command: Option<String>,
}

impl UnixFiles {
    pub fn from_settings(settings: &TargetSettings) -> Option<Self> {
        match settings {
            TargetSettings::UnixHost {
                cert_path,
                key_path,
                chain_path,
                owner,
                group,
                cert_mode,
                key_mode,
                reload_command,
                ..
            } => Some(UnixFiles {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
                chain_path: chain_path.clone(),
                cert_mode: FileMode::new(*cert_mode).with_owner(owner.clone(), group.clone()),
                key_mode: FileMode::new(*key_mode).with_owner(owner.clone(), group.clone()),
                reload_command: reload_command.clone(),
            }),
            _ => None,
        }
    }

    fn paths(&self) -> impl Iterator<Item = &Path> {
        [Some(self.cert_path.as_path()), Some(self.key_path.as_path()), self.chain_path.as_deref()]
            .into_iter()
            .flatten()
    }
}


//------------ UnixHostAdapter -----------------------------------------------

pub struct UnixHostAdapter {
    channel: Arc<dyn RemoteChannel>,
    files: UnixFiles,
}

impl UnixHostAdapter {
    pub fn new(channel: Arc<dyn RemoteChannel>, files: UnixFiles) -> Self {
        UnixHostAdapter { channel, files }
    }

    pub fn is_local(&self) -> bool {
        self.channel.is_local()
    }

    async fn read_text(&self, path: &Path) -> Result<Option<String>, DistributionError> {
        match self.channel.read_file(path).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| DistributionError::Material(format!("{} is not PEM", path.display()))),
            None => Ok(None),
        }
    }

    pub async fn capture(&self) -> Result<TargetMaterial, DistributionError> {
        let Some(certificate) = self.read_text(&self.files.cert_path).await? else {
            debug!("No certificate at {} yet", self.files.cert_path.display());
            return Ok(TargetMaterial::Empty);
        };
        let chain = match &self.files.chain_path {
            Some(path) => self.read_text(path).await?,
            None => None,
        };
        let private_key = self.read_text(&self.files.key_path).await?;
        Ok(TargetMaterial::Pem { certificate, chain, private_key })
    }

    pub async fn install(&self, material: &InstallMaterial, dry_run: bool) -> Result<(), DistributionError> {
        let chain = material.chain_pem()?;
        let certificate = match &self.files.chain_path {
            Some(_) => material.certificate_pem()?,
            None => format!("{}{}", material.certificate_pem()?, chain),
        };
        let key = material.key_pem()?;

        if dry_run {
            for path in self.files.paths() {
                let dir = path.parent().unwrap_or_else(|| Path::new("/"));
                let command = format!("test -d {}", shell_quote(&dir.to_string_lossy()));
                self.channel.run(&command, None).await?.check(&command)?;
            }
            return Ok(());
        }

        // The key goes first so that a service never sees a new
        // certificate next to an old key for longer than needed.
        match key {
            Some(key) => {
                self.channel
                    .write_file(&self.files.key_path, key.as_bytes(), &self.files.key_mode)
                    .await?
            }
            None => debug!("Keeping the key at {}", self.files.key_path.display()),
        }
        self.channel
            .write_file(&self.files.cert_path, certificate.as_bytes(), &self.files.cert_mode)
            .await?;
        if let Some(path) = &self.files.chain_path {
            self.channel.write_file(path, chain.as_bytes(), &self.files.cert_mode).await?;
        }
        info!("Wrote certificate to {}", self.files.cert_path.display());

        self.reload().await
    }

    /// Takes away what an install wrote, for targets that had nothing
    /// before.
    pub async fn clear(&self) -> Result<(), DistributionError> {
        for path in self.files.paths() {
            self.channel.remove_file(path).await?;
        }
        if self.files.reload_command.is_some() {
            warn!("Removed certificate files at {}, not reloading", self.files.cert_path.display());
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), DistributionError> {
        if let Some(command) = &self.files.reload_command {
            self.channel.run(command, None).await?.check(command)?;
            debug!("Reloaded with '{}'", command);
        }
        Ok(())
    }
}

impl fmt::Debug for UnixHostAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnixHostAdapter({})", self.files.cert_path.display())
    }
}


//------------ Tests ---------------------------------------------------------
