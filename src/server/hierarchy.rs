//! The CA hierarchy.
//!
//! Keeps the root and intermediate CAs, enforces path length budgets and
//! answers "what is the trust chain for this certificate". Each CA's
//! private key lives in exactly one [`CaSigner`], which only ever signs:
//! the key itself is never handed out.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use openssl::pkey::{PKey, Private};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::audit::AuditAction;
use crate::api::ca::{CaId, CaStatus, CaTier, CertificateAuthority, KeyRef, Validity};
use crate::api::request::{SanSet, SubjectName};
use crate::api::template::{CertificateTemplate, KeyUsage};
use crate::commons::actor::Actor;
use crate::commons::crypto::{
    Certificate, ChainVerifier, Csr, IssuanceParams, KeyAlgorithm, KeyPair, Thumbprint, issue_certificate,
    x509_name,
};
use crate::commons::error::Error;
use crate::commons::storage::KeyValueStore;
use crate::commons::{CustodyEmptyResult, CustodyResult};
use crate::constants::{CA_DEFAULT_KEY_BITS, CA_KEYS_NS, CAS_NS};
use crate::server::audit::AuditLog;

/// Longest chain walked before giving up on a cycle.
const MAX_CHAIN_DEPTH: usize = 16;


//------------ CaKeySpec -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CaKeySpec {
    pub algorithm: KeyAlgorithm,
    pub rsa_bits: u32,
}

impl Default for CaKeySpec {
    fn default() -> Self {
        CaKeySpec { algorithm: KeyAlgorithm::Rsa, rsa_bits: CA_DEFAULT_KEY_BITS }
    }
}


//------------ CaSigner ------------------------------------------------------

/// The only holder of a CA's private key.
pub struct CaSigner {
    ca_id: CaId,
    certificate: Certificate,
    key: PKey<Private>,
}

impl CaSigner {
    pub fn ca_id(&self) -> &CaId {
        &self.ca_id
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Issues an end-entity certificate for a CSR.
    ///
    /// The subject and SANs come from the caller rather than the CSR, so
    /// the template's naming mode decides what ends up in the certificate.
    /// Validity never extends past the CA's own.
    pub fn issue(
        &self,
        csr: &Csr,
        subject: &SubjectName,
        sans: &SanSet,
        template: &CertificateTemplate,
    ) -> CustodyResult<Certificate> {
        if !csr.verify_signature()? {
            return Err(Error::invalid_request("CSR signature does not verify"));
        }
        let strength = csr.key_strength()?;
        if strength < template.min_key_bits {
            return Err(Error::KeyTooWeak { required: template.min_key_bits, actual: strength });
        }

        let name = x509_name(subject)?;
        let not_before = Utc::now() - Duration::minutes(5);
        let not_after = (not_before + template.validity()).min(self.certificate.info()?.not_after);
        let params = IssuanceParams {
            subject: &name,
            not_before,
            not_after,
            ca: None,
            key_usage: &template.key_usage,
            extended_key_usage: &template.extended_key_usage,
            sans,
        };
        let public_key = csr.public_key()?;
        let cert = issue_certificate(&params, &public_key, Some(&self.certificate), &self.key)?;
        debug!(
            "CA '{}' issued certificate for '{}'",
            self.certificate.subject_cn().unwrap_or_default(),
            subject.common_name
        );
        Ok(cert)
    }

    fn issue_ca(
        &self,
        common_name: &str,
        key: &KeyPair,
        validity: Validity,
        path_len: Option<u32>,
    ) -> CustodyResult<Certificate> {
        let name = x509_name(&SubjectName::new(common_name))?;
        let params = IssuanceParams {
            subject: &name,
            not_before: validity.not_before,
            not_after: validity.not_after,
            ca: Some(path_len),
            key_usage: &[KeyUsage::KeyCertSign, KeyUsage::CrlSign, KeyUsage::DigitalSignature],
            extended_key_usage: &[],
            sans: &SanSet::default(),
        };
        issue_certificate(&params, key.pkey(), Some(&self.certificate), &self.key)
    }

    fn self_signed(common_name: &str, key: &KeyPair, validity: Validity, path_len: Option<u32>) -> CustodyResult<Certificate> {
        let name = x509_name(&SubjectName::new(common_name))?;
        let params = IssuanceParams {
            subject: &name,
            not_before: validity.not_before,
            not_after: validity.not_after,
            ca: Some(path_len),
            key_usage: &[KeyUsage::KeyCertSign, KeyUsage::CrlSign, KeyUsage::DigitalSignature],
            extended_key_usage: &[],
            sans: &SanSet::default(),
        };
        issue_certificate(&params, key.pkey(), None, key.pkey())
    }
}

impl fmt::Debug for CaSigner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CaSigner({})", self.ca_id)
    }
}


//------------ StoredCaKey ---------------------------------------------------

#[derive(Deserialize, Serialize)]
struct StoredCaKey {
    pem: String,
}


//------------ CaHierarchyManager --------------------------------------------

#[derive(Debug)]
pub struct CaHierarchyManager {
    cas: RwLock<HashMap<CaId, CertificateAuthority>>,
    signers: RwLock<HashMap<CaId, Arc<CaSigner>>>,
    store: KeyValueStore,
    key_store: KeyValueStore,
    audit: AuditLog,
}

impl CaHierarchyManager {
    /// Loads all CAs found in storage.
    pub fn build(storage_uri: &Url, audit: AuditLog) -> CustodyResult<Self> {
        let store = KeyValueStore::create(storage_uri, CAS_NS)?;
        let key_store = KeyValueStore::create(storage_uri, CA_KEYS_NS)?;

        let mut cas = HashMap::new();
        let mut signers = HashMap::new();
        for ca in store.values::<CertificateAuthority>()? {
            match key_store.get::<StoredCaKey>(ca.key_ref.as_str())? {
                Some(stored) => {
                    let key = KeyPair::from_pem(stored.pem.as_bytes())?;
                    let certificate = ca.certificate()?;
                    if !certificate.matches_key(&key) {
                        return Err(Error::custom(format!("key of CA '{}' does not match its certificate", ca.common_name)));
                    }
                    signers.insert(
                        ca.id.clone(),
                        Arc::new(CaSigner { ca_id: ca.id.clone(), certificate, key: key.pkey().to_owned() }),
                    );
                }
                None if ca.key_ref.is_external() => debug!("CA '{}' is operated elsewhere", ca.common_name),
                None => warn!("No key found for CA '{}', it cannot sign", ca.common_name),
            }
            cas.insert(ca.id.clone(), ca);
        }
        info!("Loaded {} CA(s)", cas.len());

        Ok(CaHierarchyManager {
            cas: RwLock::new(cas),
            signers: RwLock::new(signers),
            store,
            key_store,
            audit,
        })
    }

    /// Creates a CA, self-signed when `parent` is `None`.
    ///
    /// Below a constrained parent with budget `p` the new CA gets at most
    /// `p - 1`; asking for nothing inherits `p - 1`.
    pub fn register_ca(
        &self,
        parent: Option<&CaId>,
        common_name: &str,
        validity: Validity,
        path_len: Option<u32>,
        key_spec: CaKeySpec,
        actor: &Actor,
    ) -> CustodyResult<CaId> {
        if self.find_by_name(common_name).is_some() {
            return Err(Error::CaDuplicate(common_name.to_string()));
        }
        if validity.not_after <= validity.not_before {
            return Err(Error::custom(format!("CA '{}' has an empty validity period", common_name)));
        }

        let id = CaId::generate();
        let key = KeyPair::generate(key_spec.algorithm, key_spec.rsa_bits)?;

        let (tier, path_len, validity, certificate) = match parent {
            None => {
                let certificate = CaSigner::self_signed(common_name, &key, validity, path_len)?;
                (CaTier::Root, path_len, validity, certificate)
            }
            Some(parent_id) => {
                let parent = self.get(parent_id)?;
                for ancestor in self.ca_path(parent_id)? {
                    if !ancestor.is_active() {
                        return Err(Error::ParentRevoked(ancestor.id));
                    }
                }
                let path_len = Self::child_path_len(&parent, path_len)?;
                let validity = validity.capped_at(parent.validity.not_after);
                let signer = self.signer(parent_id)?;
                let certificate = signer.issue_ca(common_name, &key, validity, path_len)?;
                (CaTier::Intermediate, path_len, validity, certificate)
            }
        };

        let ca = CertificateAuthority {
            id: id.clone(),
            common_name: common_name.to_string(),
            tier,
            parent: parent.cloned(),
            certificate: certificate.to_pem()?,
            key_ref: KeyRef::new(id.as_str()),
            validity,
            path_len,
            status: CaStatus::Active,
            revoked_at: None,
        };

        self.key_store.store(ca.key_ref.as_str(), &StoredCaKey { pem: key.private_key_pem()? })?;
        self.store.store(id.as_str(), &ca)?;

        self.signers.write().expect("poisoned lock").insert(
            id.clone(),
            Arc::new(CaSigner { ca_id: id.clone(), certificate, key: key.pkey().to_owned() }),
        );
        self.cas.write().expect("poisoned lock").insert(id.clone(), ca);

        info!("Registered {:?} CA '{}' ({})", tier, common_name, id);
        self.audit.record(
            actor,
            AuditAction::CaRegistered { ca: id.clone(), common_name: common_name.to_string() },
            None,
        );
        Ok(id)
    }

    /// Registers a CA operated elsewhere by its certificate alone.
    ///
    /// The key stays with whoever runs the CA, so the custodian cannot
    /// sign with it, but certificates issued under it chain through it.
    /// Without a parent the certificate must be self-signed, otherwise the
    /// parent must have signed it. Importing a certificate again returns
    /// the CA it was imported as.
    pub fn import_ca(&self, parent: Option<&CaId>, certificate: &Certificate, actor: &Actor) -> CustodyResult<CaId> {
        let thumbprint = certificate.thumbprint()?;
        if let Some(existing) = self.find_by_certificate(&thumbprint) {
            debug!("CA certificate {} is already known as {}", thumbprint, existing.id);
            return Ok(existing.id);
        }

        let info = certificate.info()?;
        let common_name = info
            .subject_cn
            .clone()
            .ok_or_else(|| Error::CaCertificateInvalid("the certificate has no common name".into()))?;
        if !info.is_ca {
            return Err(Error::CaCertificateInvalid(format!("'{}' is not a CA certificate", common_name)));
        }
        if self.find_by_name(&common_name).is_some() {
            return Err(Error::CaDuplicate(common_name));
        }

        let (tier, path_len) = match parent {
            None => {
                if !certificate.is_self_signed() {
                    return Err(Error::CaCertificateInvalid(format!(
                        "'{}' has no parent but is not self-signed",
                        common_name
                    )));
                }
                (CaTier::Root, info.path_len)
            }
            Some(parent_id) => {
                let parent = self.get(parent_id)?;
                for ancestor in self.ca_path(parent_id)? {
                    if !ancestor.is_active() {
                        return Err(Error::ParentRevoked(ancestor.id));
                    }
                }
                if !certificate.is_issued_by(&parent.certificate()?) {
                    return Err(Error::CaCertificateInvalid(format!(
                        "'{}' is not signed by '{}'",
                        common_name, parent.common_name
                    )));
                }
                (CaTier::Intermediate, Self::child_path_len(&parent, info.path_len)?)
            }
        };

        let id = CaId::generate();
        let ca = CertificateAuthority {
            id: id.clone(),
            common_name: common_name.clone(),
            tier,
            parent: parent.cloned(),
            certificate: certificate.to_pem()?,
            key_ref: KeyRef::external(&common_name),
            validity: Validity::new(info.not_before, info.not_after),
            path_len,
            status: CaStatus::Active,
            revoked_at: None,
        };
        self.store.store(id.as_str(), &ca)?;
        self.cas.write().expect("poisoned lock").insert(id.clone(), ca);

        info!("Imported {:?} CA '{}' ({})", tier, common_name, id);
        self.audit.record(actor, AuditAction::CaRegistered { ca: id.clone(), common_name }, None);
        Ok(id)
    }

    fn find_by_certificate(&self, thumbprint: &Thumbprint) -> Option<CertificateAuthority> {
        self.cas
            .read()
            .expect("poisoned lock")
            .values()
            .find(|ca| {
                ca.certificate()
                    .and_then(|cert| cert.thumbprint())
                    .map(|known| &known == thumbprint)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn child_path_len(parent: &CertificateAuthority, requested: Option<u32>) -> CustodyResult<Option<u32>> {
        match parent.path_len {
            None => Ok(requested),
            Some(0) => Err(Error::HierarchyViolation { parent: parent.id.clone(), requested, remaining: 0 }),
            Some(budget) => {
                let max = budget - 1;
                match requested {
                    None => Ok(Some(max)),
                    Some(requested) if requested <= max => Ok(Some(requested)),
                    Some(requested) => Err(Error::HierarchyViolation {
                        parent: parent.id.clone(),
                        requested: Some(requested),
                        remaining: max,
                    }),
                }
            }
        }
    }

    pub fn get(&self, id: &CaId) -> CustodyResult<CertificateAuthority> {
        self.cas
            .read()
            .expect("poisoned lock")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::CaUnknown(id.clone()))
    }

    /// The CA with this common name, preferring an active one.
    pub fn find_by_name(&self, common_name: &str) -> Option<CertificateAuthority> {
        let cas = self.cas.read().expect("poisoned lock");
        let mut found: Option<&CertificateAuthority> = None;
        for ca in cas.values().filter(|ca| ca.common_name == common_name) {
            if ca.is_active() {
                return Some(ca.clone());
            }
            found = Some(ca);
        }
        found.filter(|ca| ca.is_active()).cloned()
    }

    pub fn list(&self) -> Vec<CertificateAuthority> {
        let mut res: Vec<_> = self.cas.read().expect("poisoned lock").values().cloned().collect();
        res.sort_by(|a, b| a.common_name.cmp(&b.common_name));
        res
    }

    /// The CA and its ancestors, up to the root, following parent
    /// pointers.
    pub fn ca_path(&self, id: &CaId) -> CustodyResult<Vec<CertificateAuthority>> {
        let mut res = vec![];
        let mut current = Some(id.clone());
        while let Some(id) = current {
            if res.len() > MAX_CHAIN_DEPTH {
                return Err(Error::BrokenChain(format!("CA parent pointers of '{}' form a cycle", id)));
            }
            let ca = self.get(&id).map_err(|_| Error::BrokenChain(format!("CA '{}' is missing", id)))?;
            current = ca.parent.clone();
            res.push(ca);
        }
        Ok(res)
    }

    /// Returns `[cert, issuer, …, root]`.
    ///
    /// Issuers are found by name and signature. Fails if an issuer is
    /// unknown or revoked.
    pub fn chain_for(&self, cert: &Certificate) -> CustodyResult<Vec<Certificate>> {
        let cas = self.cas.read().expect("poisoned lock");
        let mut chain = vec![cert.clone()];
        let mut current = cert.clone();

        loop {
            if chain.len() > MAX_CHAIN_DEPTH {
                return Err(Error::BrokenChain("chain too long".into()));
            }

            let issuer = cas.values().find_map(|ca| {
                let ca_cert = ca.certificate().ok()?;
                current.is_issued_by(&ca_cert).then_some((ca, ca_cert))
            });
            let Some((ca, ca_cert)) = issuer else {
                return Err(Error::BrokenChain(format!(
                    "no known CA issued '{}'",
                    current.subject_cn().unwrap_or_default()
                )));
            };
            if !ca.is_active() {
                return Err(Error::BrokenChain(format!("CA '{}' is revoked", ca.common_name)));
            }

            if current.is_self_signed() {
                // `current` is the root itself.
                break;
            }
            chain.push(ca_cert.clone());
            if ca.is_root() {
                break;
            }
            current = ca_cert;
        }
        Ok(chain)
    }

    /// The certificates of all active roots.
    pub fn trust_anchors(&self) -> Vec<Certificate> {
        self.cas
            .read()
            .expect("poisoned lock")
            .values()
            .filter(|ca| ca.is_root() && ca.is_active())
            .filter_map(|ca| ca.certificate().ok())
            .collect()
    }

    /// Builds the chain for `cert` and verifies it against the active
    /// roots.
    pub fn verify(&self, cert: &Certificate, template: Option<&CertificateTemplate>) -> CustodyResult<Vec<Certificate>> {
        let chain = self.chain_for(cert)?;
        let anchors = self.trust_anchors();
        ChainVerifier::new(&anchors).verify(&chain, template, Utc::now())?;
        Ok(chain)
    }

    /// Marks a CA revoked. Certificates already issued under it stay as
    /// they are, but no chain through it validates any more.
    pub fn revoke(&self, id: &CaId, actor: &Actor) -> CustodyEmptyResult {
        let mut cas = self.cas.write().expect("poisoned lock");
        let ca = cas.get_mut(id).ok_or_else(|| Error::CaUnknown(id.clone()))?;
        if !ca.is_active() {
            return Ok(());
        }
        let mut revoked = ca.clone();
        revoked.status = CaStatus::Revoked;
        revoked.revoked_at = Some(Utc::now());
        self.store.store(id.as_str(), &revoked)?;
        *ca = revoked;

        warn!("Revoked CA '{}' ({})", ca.common_name, id);
        self.audit.record(actor, AuditAction::CaRevoked { ca: id.clone() }, None);
        Ok(())
    }

    /// The signer of an active CA.
    pub fn signer(&self, id: &CaId) -> CustodyResult<Arc<CaSigner>> {
        let ca = self.get(id)?;
        if !ca.is_active() {
            return Err(Error::ParentRevoked(id.clone()));
        }
        self.signers
            .read()
            .expect("poisoned lock")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::signer(format!("no key available for CA '{}'", ca.common_name)))
    }
}


//------------ Tests ---------------------------------------------------------
