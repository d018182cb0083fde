//! X.509 certificates: issuance, inspection, bundles.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage as EkuExtension,
    KeyUsage as KuExtension, SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Builder, X509NameRef, X509Ref};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::api::request::{SanSet, SubjectAltName};
use crate::api::template::{ExtendedKeyUsage, KeyUsage};
use crate::commons::CustodyResult;
use crate::commons::crypto::csr::{common_name, san_extension};
use crate::commons::crypto::keys::{self, KeyPair};
use crate::commons::error::Error;
use crate::constants::SERIAL_BITS;


//------------ Thumbprint ----------------------------------------------------

/// Lower-case hex SHA-256 of a DER encoded certificate.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
    pub fn of_der(der: &[u8]) -> Self {
        Thumbprint(hex::encode(openssl::sha::sha256(der)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Thumbprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().replace(':', "").to_ascii_lowercase();
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Thumbprint(s))
        } else {
            Err(Error::custom(format!("not a SHA-256 thumbprint: {}", s)))
        }
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ Certificate ---------------------------------------------------

#[derive(Clone)]
pub struct Certificate {
    x509: X509,
}

impl Certificate {
    pub fn from_x509(x509: X509) -> Self {
        Certificate { x509 }
    }

    pub fn from_pem(pem: &[u8]) -> CustodyResult<Self> {
        Ok(Certificate { x509: X509::from_pem(pem)? })
    }

    pub fn from_der(der: &[u8]) -> CustodyResult<Self> {
        Ok(Certificate { x509: X509::from_der(der)? })
    }

    pub fn to_pem(&self) -> CustodyResult<String> {
        let pem = self.x509.to_pem()?;
        String::from_utf8(pem).map_err(|e| Error::signer(format!("certificate PEM is not UTF-8: {}", e)))
    }

    pub fn to_der(&self) -> CustodyResult<Vec<u8>> {
        Ok(self.x509.to_der()?)
    }

    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    pub fn thumbprint(&self) -> CustodyResult<Thumbprint> {
        Ok(Thumbprint::of_der(&self.to_der()?))
    }

    pub fn subject_cn(&self) -> Option<String> {
        common_name(self.x509.subject_name())
    }

    pub fn issuer_cn(&self) -> Option<String> {
        common_name(self.x509.issuer_name())
    }

    /// Whether `issuer` names and signed this certificate.
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        let names_match = self
            .x509
            .issuer_name()
            .try_cmp(issuer.x509.subject_name())
            .map(|o| o.is_eq())
            .unwrap_or(false);
        names_match
            && issuer
                .x509
                .public_key()
                .and_then(|key| self.x509.verify(&key))
                .unwrap_or(false)
    }

    pub fn is_self_signed(&self) -> bool {
        self.is_issued_by(self)
    }

    /// Whether the certificate's key is the public half of `key`.
    pub fn matches_key(&self, key: &KeyPair) -> bool {
        self.x509
            .public_key()
            .map(|public| public.public_eq(key.pkey()))
            .unwrap_or(false)
    }

    pub fn key_strength(&self) -> CustodyResult<u32> {
        let key = self.x509.public_key()?;
        Ok(keys::key_strength(&key))
    }

    /// Decodes the parts of the certificate the pipeline checks.
    pub fn info(&self) -> CustodyResult<CertInfo> {
        let der = self.to_der()?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| Error::signer(format!("cannot parse certificate: {}", e)))?;

        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;

        let mut key_usage = vec![];
        if let Ok(Some(ku)) = cert.key_usage() {
            let ku = ku.value;
            let flags = [
                (ku.digital_signature(), KeyUsage::DigitalSignature),
                (ku.non_repudiation(), KeyUsage::NonRepudiation),
                (ku.key_encipherment(), KeyUsage::KeyEncipherment),
                (ku.data_encipherment(), KeyUsage::DataEncipherment),
                (ku.key_agreement(), KeyUsage::KeyAgreement),
                (ku.key_cert_sign(), KeyUsage::KeyCertSign),
                (ku.crl_sign(), KeyUsage::CrlSign),
            ];
            key_usage.extend(flags.into_iter().filter(|(set, _)| *set).map(|(_, ku)| ku));
        }

        let mut extended_key_usage = vec![];
        if let Ok(Some(eku)) = cert.extended_key_usage() {
            let eku = eku.value;
            let flags = [
                (eku.server_auth, ExtendedKeyUsage::ServerAuth),
                (eku.client_auth, ExtendedKeyUsage::ClientAuth),
                (eku.code_signing, ExtendedKeyUsage::CodeSigning),
                (eku.email_protection, ExtendedKeyUsage::EmailProtection),
                (eku.time_stamping, ExtendedKeyUsage::TimeStamping),
                (eku.ocsp_signing, ExtendedKeyUsage::OcspSigning),
            ];
            extended_key_usage.extend(flags.into_iter().filter(|(set, _)| *set).map(|(_, e)| e));
        }

        let mut sans = SanSet::default();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => sans.insert(SubjectAltName::Dns(dns.to_string())),
                    GeneralName::RFC822Name(email) => sans.insert(SubjectAltName::Email(email.to_string())),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(addr) = ip_from_bytes(bytes) {
                            sans.insert(SubjectAltName::Ip(addr));
                        }
                    }
                    _ => {}
                }
            }
        }

        let (is_ca, path_len) = match cert.basic_constraints() {
            Ok(Some(bc)) if bc.value.ca => (true, bc.value.path_len_constraint),
            _ => (false, None),
        };

        Ok(CertInfo {
            subject_cn: self.subject_cn(),
            issuer_cn: self.issuer_cn(),
            serial: cert.raw_serial_as_string(),
            not_before,
            not_after,
            key_usage,
            extended_key_usage,
            sans,
            is_ca,
            path_len,
        })
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Certificate(subject: {}, issuer: {})",
            self.subject_cn().unwrap_or_default(),
            self.issuer_cn().unwrap_or_default()
        )
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_der(), other.to_der()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Stored as PEM.
impl Serialize for Certificate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_pem().map_err(serde::ser::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Certificate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pem = String::deserialize(deserializer)?;
        Certificate::from_pem(pem.as_bytes()).map_err(serde::de::Error::custom)
    }
}

fn timestamp(secs: i64) -> CustodyResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| Error::signer(format!("invalid certificate time {}", secs)))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}


//------------ CertInfo ------------------------------------------------------

/// The decoded fields of a certificate.
#[derive(Clone, Debug)]
pub struct CertInfo {
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub key_usage: Vec<KeyUsage>,
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    pub sans: SanSet,
    pub is_ca: bool,

    /// The path length constraint of a CA certificate.
    pub path_len: Option<u32>,
}

impl CertInfo {
    pub fn is_valid_at(&self, time: DateTime<Utc>) -> bool {
        self.not_before <= time && time <= self.not_after
    }
}


//------------ Issuance ------------------------------------------------------

/// What to put in a certificate issued by a local CA.
pub struct IssuanceParams<'a> {
    pub subject: &'a X509NameRef,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,

    /// `Some(path_len)` for a CA certificate, `None` for an end entity.
    pub ca: Option<Option<u32>>,
    pub key_usage: &'a [KeyUsage],
    pub extended_key_usage: &'a [ExtendedKeyUsage],
    pub sans: &'a SanSet,
}

/// Creates and signs a certificate.
///
/// Pass `issuer = None` for a self-signed certificate, in which case
/// `issuer_key` must be the private half of `public_key`.
pub fn issue_certificate<T: HasPublic>(
    params: &IssuanceParams,
    public_key: &PKeyRef<T>,
    issuer: Option<&Certificate>,
    issuer_key: &PKeyRef<Private>,
) -> CustodyResult<Certificate> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(params.subject)?;
    match issuer {
        Some(issuer) => builder.set_issuer_name(issuer.x509().subject_name())?,
        None => builder.set_issuer_name(params.subject)?,
    }
    builder.set_pubkey(public_key)?;
    let not_before = asn1_time(params.not_before)?;
    let not_after = asn1_time(params.not_after)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let basic_constraints = match params.ca {
        Some(path_len) => {
            let mut bc = BasicConstraints::new();
            bc.critical().ca();
            if let Some(path_len) = path_len {
                bc.pathlen(path_len);
            }
            bc.build()?
        }
        None => BasicConstraints::new().critical().build()?,
    };
    builder.append_extension(basic_constraints)?;

    if !params.key_usage.is_empty() {
        let mut ku = KuExtension::new();
        ku.critical();
        for usage in params.key_usage {
            match usage {
                KeyUsage::DigitalSignature => ku.digital_signature(),
                KeyUsage::NonRepudiation => ku.non_repudiation(),
                KeyUsage::KeyEncipherment => ku.key_encipherment(),
                KeyUsage::DataEncipherment => ku.data_encipherment(),
                KeyUsage::KeyAgreement => ku.key_agreement(),
                KeyUsage::KeyCertSign => ku.key_cert_sign(),
                KeyUsage::CrlSign => ku.crl_sign(),
            };
        }
        builder.append_extension(ku.build()?)?;
    }

    if !params.extended_key_usage.is_empty() {
        let mut eku = EkuExtension::new();
        for usage in params.extended_key_usage {
            match usage {
                ExtendedKeyUsage::ServerAuth => eku.server_auth(),
                ExtendedKeyUsage::ClientAuth => eku.client_auth(),
                ExtendedKeyUsage::CodeSigning => eku.code_signing(),
                ExtendedKeyUsage::EmailProtection => eku.email_protection(),
                ExtendedKeyUsage::TimeStamping => eku.time_stamping(),
                ExtendedKeyUsage::OcspSigning => eku.other("OCSPSigning"),
            };
        }
        builder.append_extension(eku.build()?)?;
    }

    let issuer_x509 = issuer.map(|issuer| issuer.x509());
    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(issuer_x509, None))?;
    builder.append_extension(subject_key_identifier)?;

    if issuer.is_some() {
        let authority_key_identifier = AuthorityKeyIdentifier::new()
            .keyid(true)
            .build(&builder.x509v3_context(issuer_x509, None))?;
        builder.append_extension(authority_key_identifier)?;
    }

    if !params.sans.is_empty() {
        let san = san_extension(params.sans).build(&builder.x509v3_context(issuer_x509, None))?;
        builder.append_extension(san)?;
    }

    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(Certificate::from_x509(builder.build()))
}

fn random_serial() -> CustodyResult<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn asn1_time(time: DateTime<Utc>) -> CustodyResult<Asn1Time> {
    let generalized = time.format("%Y%m%d%H%M%SZ").to_string();
    Ok(Asn1Time::from_str(&generalized)?)
}


//------------ Bundles -------------------------------------------------------

/// Parses all certificates from a PEM file.
pub fn certificates_from_pem(pem: &[u8]) -> CustodyResult<Vec<Certificate>> {
    Ok(X509::stack_from_pem(pem)?.into_iter().map(Certificate::from_x509).collect())
}

/// Concatenates the PEM encodings.
pub fn certificates_to_pem(certs: &[Certificate]) -> CustodyResult<String> {
    let mut res = String::new();
    for cert in certs {
        res.push_str(&cert.to_pem()?);
    }
    Ok(res)
}

/// Builds a PKCS#12 bundle with the leaf, its key and the rest of the
/// chain.
pub fn pkcs12_bundle(
    friendly_name: &str,
    leaf: &Certificate,
    key: &KeyPair,
    chain: &[Certificate],
    passphrase: &SecretString,
) -> CustodyResult<Vec<u8>> {
    let mut ca = Stack::new()?;
    for cert in chain {
        ca.push(cert.x509.clone())?;
    }
    let pkcs12 = Pkcs12::builder()
        .name(friendly_name)
        .pkey(key.pkey())
        .cert(leaf.x509())
        .ca(ca)
        .build2(passphrase.expose_secret())?;
    Ok(pkcs12.to_der()?)
}

/// The parts of a PKCS#12 bundle.
pub struct Pkcs12Contents {
    pub certificate: Option<Certificate>,
    pub key: Option<KeyPair>,
    pub chain: Vec<Certificate>,
}

pub fn parse_pkcs12(der: &[u8], passphrase: &SecretString) -> CustodyResult<Pkcs12Contents> {
    let parsed = Pkcs12::from_der(der)?.parse2(passphrase.expose_secret())?;
    Ok(Pkcs12Contents {
        certificate: parsed.cert.map(Certificate::from_x509),
        key: parsed.pkey.map(KeyPair::from_pkey),
        chain: parsed
            .ca
            .map(|stack| stack.into_iter().map(Certificate::from_x509).collect())
            .unwrap_or_default(),
    })
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::api::request::SubjectName;
    use crate::commons::crypto::{KeyAlgorithm, x509_name};

    fn self_signed(cn: &str, key: &KeyPair) -> Certificate {
        let name = x509_name(&SubjectName::new(cn)).unwrap();
        let now = Utc::now();
        let params = IssuanceParams {
            subject: &name,
            not_before: now - Duration::minutes(5),
            not_after: now + Duration::days(30),
            ca: Some(Some(1)),
            key_usage: &[KeyUsage::KeyCertSign, KeyUsage::CrlSign],
            extended_key_usage: &[],
            sans: &SanSet::default(),
        };
        issue_certificate(&params, key.pkey(), None, key.pkey()).unwrap()
    }

    #[test]
    fn issue_and_inspect() {
        let ca_key = KeyPair::generate(KeyAlgorithm::EcP256, 0).unwrap();
        let root = self_signed("Test Root", &ca_key);
        assert!(root.is_self_signed());
        assert!(root.info().unwrap().is_ca);

        let leaf_key = KeyPair::generate(KeyAlgorithm::Rsa, 2048).unwrap();
        let name = x509_name(&SubjectName::new("www.example.com")).unwrap();
        let sans = SanSet::from_iter([SubjectAltName::Dns("www.example.com".into())]);
        let now = Utc::now();
        let params = IssuanceParams {
            subject: &name,
            not_before: now,
            not_after: now + Duration::days(10),
            ca: None,
            key_usage: &[KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            extended_key_usage: &[ExtendedKeyUsage::ServerAuth],
            sans: &sans,
        };
        let leaf = issue_certificate(&params, leaf_key.pkey(), Some(&root), ca_key.pkey()).unwrap();

        assert!(leaf.is_issued_by(&root));
        assert!(!leaf.is_self_signed());
        assert!(leaf.matches_key(&leaf_key));

        let info = leaf.info().unwrap();
        assert!(!info.is_ca);
        assert_eq!(info.subject_cn.as_deref(), Some("www.example.com"));
        assert_eq!(info.issuer_cn.as_deref(), Some("Test Root"));
        assert_eq!(info.key_usage, vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment]);
        assert_eq!(info.extended_key_usage, vec![ExtendedKeyUsage::ServerAuth]);
        assert_eq!(info.sans, sans);
        assert!(info.is_valid_at(now + Duration::days(1)));
        assert!(!info.is_valid_at(now + Duration::days(11)));
    }

    #[test]
    fn thumbprints_and_pem_bundles() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, 0).unwrap();
        let a = self_signed("A", &key);
        let b = self_signed("B", &key);

        let pem = certificates_to_pem(&[a.clone(), b.clone()]).unwrap();
        let parsed = certificates_from_pem(pem.as_bytes()).unwrap();
        assert_eq!(parsed, vec![a.clone(), b.clone()]);

        let thumbprint = a.thumbprint().unwrap();
        assert_eq!(thumbprint.as_str().len(), 64);
        assert_ne!(thumbprint, b.thumbprint().unwrap());
        assert_eq!(Thumbprint::from_str(&thumbprint.as_str().to_uppercase()).unwrap(), thumbprint);
    }

    #[test]
    fn pkcs12_contains_leaf_key_and_chain() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, 2048).unwrap();
        let root = self_signed("Root", &key);
        let passphrase = SecretString::new("secret".to_string());

        let der = pkcs12_bundle("leaf", &root, &key, &[root.clone()], &passphrase).unwrap();
        let contents = parse_pkcs12(&der, &passphrase).unwrap();
        assert_eq!(contents.certificate, Some(root.clone()));
        assert!(contents.key.is_some());
        assert_eq!(contents.chain.len(), 1);
    }
}
