//! PKCS#10 certificate signing requests.

use std::fmt;

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509NameBuilder, X509NameRef, X509Req, X509ReqBuilder, X509ReqRef};

use crate::api::request::{SanSet, SubjectAltName, SubjectName};
use crate::commons::CustodyResult;
use crate::commons::crypto::keys::{self, KeyPair};
use crate::commons::error::Error;


//------------ Csr -----------------------------------------------------------

/// A signed certificate signing request.
pub struct Csr {
    req: X509Req,
}

impl Csr {
    /// Builds a CSR for `subject` and `sans`, signed with `key` (SHA-256).
    pub fn build(key: &KeyPair, subject: &SubjectName, sans: &SanSet) -> CustodyResult<Self> {
        let mut builder = X509ReqBuilder::new()?;
        builder.set_version(0)?;
        let name = x509_name(subject)?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(key.pkey())?;

        if !sans.is_empty() {
            let san = {
                let ctx = builder.x509v3_context(None);
                san_extension(sans).build(&ctx)?
            };
            let mut extensions = Stack::new()?;
            extensions.push(san)?;
            builder.add_extensions(&extensions)?;
        }

        builder.sign(key.pkey(), MessageDigest::sha256())?;
        Ok(Csr { req: builder.build() })
    }

    pub fn from_pem(pem: &[u8]) -> CustodyResult<Self> {
        Ok(Csr { req: X509Req::from_pem(pem)? })
    }

    pub fn from_der(der: &[u8]) -> CustodyResult<Self> {
        Ok(Csr { req: X509Req::from_der(der)? })
    }

    pub fn to_pem(&self) -> CustodyResult<String> {
        let pem = self.req.to_pem()?;
        String::from_utf8(pem).map_err(|e| Error::signer(format!("CSR PEM is not UTF-8: {}", e)))
    }

    pub fn to_der(&self) -> CustodyResult<Vec<u8>> {
        Ok(self.req.to_der()?)
    }

    pub fn req(&self) -> &X509ReqRef {
        &self.req
    }

    pub fn public_key(&self) -> CustodyResult<PKey<Public>> {
        Ok(self.req.public_key()?)
    }

    /// Checks the CSR's self-signature.
    pub fn verify_signature(&self) -> CustodyResult<bool> {
        let key = self.public_key()?;
        Ok(self.req.verify(&key)?)
    }

    pub fn subject_cn(&self) -> Option<String> {
        common_name(self.req.subject_name())
    }

    pub fn key_strength(&self) -> CustodyResult<u32> {
        let key = self.public_key()?;
        Ok(keys::key_strength(&key))
    }

    /// Hex SHA-256 of the requested public key.
    pub fn key_thumbprint(&self) -> CustodyResult<String> {
        let key = self.public_key()?;
        keys::public_key_thumbprint(&key)
    }
}

impl fmt::Debug for Csr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Csr({})", self.subject_cn().unwrap_or_default())
    }
}


//------------ Helpers -------------------------------------------------------

/// Converts a subject name into an X.509 distinguished name.
pub fn x509_name(subject: &SubjectName) -> CustodyResult<X509Name> {
    let mut name = X509NameBuilder::new()?;
    let attributes = &subject.attributes;
    if let Some(country) = &attributes.country {
        name.append_entry_by_nid(Nid::COUNTRYNAME, country)?;
    }
    if let Some(state) = &attributes.state {
        name.append_entry_by_nid(Nid::STATEORPROVINCENAME, state)?;
    }
    if let Some(locality) = &attributes.locality {
        name.append_entry_by_nid(Nid::LOCALITYNAME, locality)?;
    }
    if let Some(organization) = &attributes.organization {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
    }
    if let Some(unit) = &attributes.organizational_unit {
        name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, unit)?;
    }
    name.append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)?;
    Ok(name.build())
}

pub fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

/// Prepares a SAN extension; the caller builds it in its own context.
pub fn san_extension(sans: &SanSet) -> SubjectAlternativeName {
    let mut ext = SubjectAlternativeName::new();
    for san in sans.iter() {
        match san {
            SubjectAltName::Dns(name) => ext.dns(name),
            SubjectAltName::Ip(addr) => ext.ip(&addr.to_string()),
            SubjectAltName::Email(email) => ext.email(email),
        };
    }
    ext
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::KeyAlgorithm;

    #[test]
    fn build_and_reload() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, 0).unwrap();
        let subject = SubjectName::new("fw1.example.com");
        let sans = SanSet::from_iter([
            SubjectAltName::Dns("fw1.example.com".into()),
            SubjectAltName::Ip("10.0.0.1".parse().unwrap()),
        ]);

        let csr = Csr::build(&key, &subject, &sans).unwrap();
        assert!(csr.verify_signature().unwrap());
        assert_eq!(csr.subject_cn().as_deref(), Some("fw1.example.com"));
        assert_eq!(csr.key_thumbprint().unwrap(), key.public_key_thumbprint().unwrap());

        let reloaded = Csr::from_pem(csr.to_pem().unwrap().as_bytes()).unwrap();
        assert_eq!(reloaded.to_der().unwrap(), csr.to_der().unwrap());
        assert_eq!(reloaded.key_strength().unwrap(), 3072);
    }
}
