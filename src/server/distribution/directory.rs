//! Windows hosts taking certificates into a machine certificate store.
//!
//! Scripts run through PowerShell as an encoded command. The passphrase
//! and the certificate material go over stdin, one item per line, so
//! they never show up in a process list.

use std::fmt;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use log::{debug, info};
use secrecy::{ExposeSecret, SecretString};

use crate::api::target::TargetMaterial;
use crate::commons::crypto::Certificate;

use super::{DistributionError, InstallMaterial, RemoteChannel};

/// What the capture script exits with when there is no certificate.
const NO_CERTIFICATE: i32 = 3;

const CAPTURE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$secret = ConvertTo-SecureString -String ([Console]::In.ReadLine()) -AsPlainText -Force
$cert = Get-ChildItem -Path "Cert:\LocalMachine\$store" |
    Where-Object { $_.FriendlyName -eq $name } |
    Sort-Object NotAfter -Descending |
    Select-Object -First 1
if ($null -eq $cert) { exit 3 }
$tmp = [IO.Path]::GetTempFileName()
try {
    Export-PfxCertificate -Cert $cert -FilePath $tmp -Password $secret -ChainOption BuildChain | Out-Null
    Write-Output 'PFX'
    Write-Output ([Convert]::ToBase64String([IO.File]::ReadAllBytes($tmp)))
} catch {
    Write-Output 'CER'
    Write-Output ([Convert]::ToBase64String($cert.RawData))
} finally {
    Remove-Item -Path $tmp -Force -ErrorAction SilentlyContinue
}
"#;

const INSTALL_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$secret = ConvertTo-SecureString -String ([Console]::In.ReadLine()) -AsPlainText -Force
$kind, $payload = ([Console]::In.ReadLine()) -split ':', 2
$chain = @()
while ($null -ne ($line = [Console]::In.ReadLine())) {
    if ($line) { $chain += ,[Security.Cryptography.X509Certificates.X509Certificate2]::new([Convert]::FromBase64String($line)) }
}
$tmp = [IO.Path]::GetTempFileName()
try {
    [IO.File]::WriteAllBytes($tmp, [Convert]::FromBase64String($payload))
    if ($kind -eq 'PFX') { Get-PfxData -FilePath $tmp -Password $secret | Out-Null }
    else { [Security.Cryptography.X509Certificates.X509Certificate2]::new($tmp) | Out-Null }
    if ($dryRun) { Write-Output 'validated'; exit 0 }

    if ($kind -eq 'PFX') {
        $cert = Import-PfxCertificate -FilePath $tmp -CertStoreLocation "Cert:\LocalMachine\$store" -Password $secret -Exportable
    } else {
        $cert = Import-Certificate -FilePath $tmp -CertStoreLocation "Cert:\LocalMachine\$store"
    }
    $cert.FriendlyName = $name
    foreach ($ca in $chain) {
        $location = if ($ca.Subject -eq $ca.Issuer) { 'Root' } else { 'CA' }
        $caStore = [Security.Cryptography.X509Certificates.X509Store]::new($location, 'LocalMachine')
        $caStore.Open('ReadWrite')
        $caStore.Add($ca)
        $caStore.Close()
    }
    Write-Output $cert.Thumbprint
} finally {
    Remove-Item -Path $tmp -Force -ErrorAction SilentlyContinue
}
"#;

const REMOVE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
Get-ChildItem -Path "Cert:\LocalMachine\$store" |
    Where-Object { $_.FriendlyName -eq $name } |
    Remove-Item
"#;


//------------ DirectoryHostAdapter ------------------------------------------

pub struct DirectoryHostAdapter {
    channel: Arc<dyn RemoteChannel>,
    store: String,

    /// The friendly name marking the service's certificate in the store.
    friendly_name: String,
    passphrase: SecretString,
}

impl DirectoryHostAdapter {
    pub fn new(channel: Arc<dyn RemoteChannel>, store: &str, friendly_name: &str, passphrase: SecretString) -> Self {
        DirectoryHostAdapter {
            channel,
            store: store.to_string(),
            friendly_name: friendly_name.to_string(),
            passphrase,
        }
    }

    pub(super) fn passphrase(&self) -> &SecretString {
        &self.passphrase
    }

    /// The script with its parameters set, as a PowerShell command line.
    fn command(&self, script: &str, dry_run: bool) -> String {
        let full = format!(
            "$store = {}\n$name = {}\n$dryRun = ${}\n{}",
            ps_quote(&self.store),
            ps_quote(&self.friendly_name),
            dry_run,
            script
        );
        let utf16: Vec<u8> = full.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
        format!("powershell -NoProfile -NonInteractive -EncodedCommand {}", STANDARD.encode(utf16))
    }

    fn secret_line(&self) -> String {
        format!("{}\n", self.passphrase.expose_secret())
    }

    pub async fn capture(&self) -> Result<TargetMaterial, DistributionError> {
        let output = self
            .channel
            .run(&self.command(CAPTURE_SCRIPT, false), Some(self.secret_line().as_bytes()))
            .await?;
        if output.status == Some(NO_CERTIFICATE) {
            debug!("Store {} has no certificate '{}'", self.store, self.friendly_name);
            return Ok(TargetMaterial::Empty);
        }
        let text = output.check("certificate export")?.stdout_text();

        let mut lines = text.lines().map(str::trim);
        let kind = lines.next().unwrap_or_default();
        let payload = lines.next().unwrap_or_default();
        match kind {
            "PFX" => Ok(TargetMaterial::Pkcs12 { bundle: payload.to_string() }),
            "CER" => {
                let der = STANDARD
                    .decode(payload)
                    .map_err(|e| DistributionError::Material(format!("exported certificate is not base64: {}", e)))?;
                let certificate = Certificate::from_der(&der)?;
                Ok(TargetMaterial::Pem { certificate: certificate.to_pem()?, chain: None, private_key: None })
            }
            other => Err(DistributionError::Material(format!("unexpected export output '{}'", other))),
        }
    }

    pub async fn install(&self, material: &InstallMaterial, dry_run: bool) -> Result<(), DistributionError> {
        let mut input = self.secret_line();
        match material.pkcs12(&self.friendly_name, &self.passphrase)? {
            Some(bundle) => input.push_str(&format!("PFX:{}\n", STANDARD.encode(bundle))),
            None => input.push_str(&format!("CER:{}\n", STANDARD.encode(material.certificate.to_der()?))),
        }
        for ca in &material.chain {
            input.push_str(&STANDARD.encode(ca.to_der()?));
            input.push('\n');
        }

        let output = self
            .channel
            .run(&self.command(INSTALL_SCRIPT, dry_run), Some(input.as_bytes()))
            .await?
            .check("certificate import")?;
        if !dry_run {
            info!(
                "Imported '{}' into store {} as {}",
                self.friendly_name,
                self.store,
                output.stdout_text()
            );
        }
        Ok(())
    }
}

impl DirectoryHostAdapter {
    /// Deletes every certificate carrying the friendly name.
    pub async fn remove(&self) -> Result<(), DistributionError> {
        self.channel
            .run(&self.command(REMOVE_SCRIPT, false), None)
            .await?
            .check("certificate removal")?;
        info!("Removed '{}' from store {}", self.friendly_name, self.store);
        Ok(())
    }
}

impl fmt::Debug for DirectoryHostAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DirectoryHostAdapter({}\\{})", self.store, self.friendly_name)
    }
}

/// A PowerShell single quoted string.
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}


//------------ Tests ---------------------------------------------------------
