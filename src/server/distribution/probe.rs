//! Checking that a service serves its new certificate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::api::target::DistributionTarget;
use crate::commons::crypto::Thumbprint;
use crate::constants::DEFAULT_PROBE_PORT;
use crate::server::hierarchy::CaHierarchyManager;

use super::{DistributionError, InstallMaterial};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);


//------------ HealthProbe ---------------------------------------------------

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the target's service presents `expected` right now.
    async fn check(&self, target: &DistributionTarget, expected: &InstallMaterial) -> Result<(), DistributionError>;
}


//------------ NoProbe -------------------------------------------------------

/// Takes a successful install for a healthy service.
#[derive(Clone, Debug, Default)]
pub struct NoProbe;

#[async_trait]
impl HealthProbe for NoProbe {
    async fn check(&self, _target: &DistributionTarget, _expected: &InstallMaterial) -> Result<(), DistributionError> {
        Ok(())
    }
}


//------------ TlsHandshakeProbe ---------------------------------------------

/// Connects to the service and compares the certificate it presents.
///
/// The handshake has to validate against the roots of the hierarchy, or
/// the root the installed chain ends in, with the certificate's common
/// name as server name.
pub struct TlsHandshakeProbe {
    hierarchy: Arc<CaHierarchyManager>,
}

impl TlsHandshakeProbe {
    pub fn new(hierarchy: Arc<CaHierarchyManager>) -> Self {
        TlsHandshakeProbe { hierarchy }
    }

    fn address(target: &DistributionTarget) -> String {
        target
            .probe_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", target.address, DEFAULT_PROBE_PORT))
    }

    fn client_config(&self, expected: &InstallMaterial) -> Result<ClientConfig, DistributionError> {
        let mut anchors = self.hierarchy.trust_anchors();
        if let Some(top) = expected.chain.last().filter(|cert| cert.is_self_signed()) {
            anchors.push(top.clone());
        }

        let mut roots = RootCertStore::empty();
        for anchor in anchors {
            roots
                .add(CertificateDer::from(anchor.to_der()?))
                .map_err(|e| DistributionError::Material(format!("unusable trust anchor: {}", e)))?;
        }
        Ok(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
    }
}

#[async_trait]
impl HealthProbe for TlsHandshakeProbe {
    async fn check(&self, target: &DistributionTarget, expected: &InstallMaterial) -> Result<(), DistributionError> {
        let address = Self::address(target);
        let name = expected
            .certificate
            .subject_cn()
            .ok_or_else(|| DistributionError::Material("certificate has no common name".into()))?;
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| DistributionError::Material(format!("'{}' is no server name: {}", name, e)))?;
        let connector = TlsConnector::from(Arc::new(self.client_config(expected)?));

        let tcp = timeout(PROBE_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| DistributionError::HealthCheck(format!("connecting to {} timed out", address)))?
            .map_err(|e| DistributionError::HealthCheck(format!("cannot connect to {}: {}", address, e)))?;
        let tls = timeout(PROBE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| DistributionError::HealthCheck(format!("TLS handshake with {} timed out", address)))?
            .map_err(|e| DistributionError::HealthCheck(format!("TLS handshake with {} failed: {}", address, e)))?;

        let (_, session) = tls.get_ref();
        let leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| DistributionError::HealthCheck(format!("{} presented no certificate", address)))?;

        let served = Thumbprint::of_der(leaf.as_ref());
        let wanted = expected.thumbprint()?;
        trace!("{} presents {}", address, served);
        if served == wanted {
            Ok(())
        } else {
            Err(DistributionError::HealthCheck(format!("{} presents {}, not {}", address, served, wanted)))
        }
    }
}

impl fmt::Debug for TlsHandshakeProbe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TlsHandshakeProbe")
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;
    use tokio_rustls::rustls::ServerConfig;

    use super::*;
    use crate::test;

    /// Serves `material` over TLS on a local port until dropped.
    async fn serve(material: &InstallMaterial) -> (String, tokio::task::JoinHandle<()>) {
        let mut chain = vec![CertificateDer::from(material.certificate.to_der().unwrap())];
        for cert in &material.chain {
            chain.push(CertificateDer::from(cert.to_der().unwrap()));
        }
        let key_pem = material.key_pem().unwrap().unwrap();
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes()).unwrap().unwrap();
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = acceptor.accept(stream).await;
            }
        });
        (address, handle)
    }

    fn target(probe_address: &str) -> DistributionTarget {
        let mut target = test::appliance_target("applianceA");
        target.probe_address = Some(probe_address.to_string());
        target
    }

    #[test]
    fn default_probe_address() {
        let target = test::appliance_target("applianceA");
        assert_eq!(TlsHandshakeProbe::address(&target), format!("{}:443", target.address));
    }

    #[tokio::test]
    async fn compares_served_certificate() {
        let (hierarchy, issuing) = test::hierarchy();
        let (certificate, key, chain) = test::issued_by(&hierarchy, &issuing, "probe.example.com");
        let installed = InstallMaterial { certificate, chain, key: Some(key) };
        let (address, server) = serve(&installed).await;
        let probe = TlsHandshakeProbe::new(hierarchy.clone());

        probe.check(&target(&address), &installed).await.unwrap();

        let (certificate, key, chain) = test::issued_by(&hierarchy, &issuing, "probe.example.com");
        let other = InstallMaterial { certificate, chain, key: Some(key) };
        assert!(matches!(
            probe.check(&target(&address), &other).await,
            Err(DistributionError::HealthCheck(_))
        ));
        server.abort();
    }

    #[tokio::test]
    async fn nothing_listening() {
        let (hierarchy, issuing) = test::hierarchy();
        let (certificate, key, chain) = test::issued_by(&hierarchy, &issuing, "probe.example.com");
        let installed = InstallMaterial { certificate, chain, key: Some(key) };
        let probe = TlsHandshakeProbe::new(hierarchy);
        assert!(matches!(
            probe.check(&target("127.0.0.1:9"), &installed).await,
            Err(DistributionError::HealthCheck(_))
        ));
    }
}
