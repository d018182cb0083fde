//! Key pair generation and key strength.

use std::fmt;

use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use serde::{Deserialize, Serialize};

use crate::commons::CustodyResult;
use crate::commons::error::Error;


//------------ KeyAlgorithm --------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    EcP256,
    EcP384,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => write!(f, "rsa"),
            KeyAlgorithm::EcP256 => write!(f, "ec_p256"),
            KeyAlgorithm::EcP384 => write!(f, "ec_p384"),
        }
    }
}


//------------ KeyPair -------------------------------------------------------

/// A freshly generated or loaded private key.
///
/// Debug output never shows key material.
pub struct KeyPair {
    pkey: PKey<Private>,
}

impl KeyPair {
    /// Generates a key.
    ///
    /// For RSA, `rsa_bits` is the modulus size. EC keys ignore it.
    pub fn generate(algorithm: KeyAlgorithm, rsa_bits: u32) -> CustodyResult<Self> {
        let pkey = match algorithm {
            KeyAlgorithm::Rsa => PKey::from_rsa(Rsa::generate(rsa_bits)?)?,
            KeyAlgorithm::EcP256 => Self::ec_key(Nid::X9_62_PRIME256V1)?,
            KeyAlgorithm::EcP384 => Self::ec_key(Nid::SECP384R1)?,
        };
        Ok(KeyPair { pkey })
    }

    fn ec_key(curve: Nid) -> CustodyResult<PKey<Private>> {
        let group = EcGroup::from_curve_name(curve)?;
        let key = EcKey::generate(&group)?;
        Ok(PKey::from_ec_key(key)?)
    }

    pub fn from_pem(pem: &[u8]) -> CustodyResult<Self> {
        let pkey = PKey::private_key_from_pem(pem)?;
        Ok(KeyPair { pkey })
    }

    pub fn from_pkey(pkey: PKey<Private>) -> Self {
        KeyPair { pkey }
    }

    /// The key as PKCS#8 PEM.
    pub fn private_key_pem(&self) -> CustodyResult<String> {
        let pem = self.pkey.private_key_to_pem_pkcs8()?;
        String::from_utf8(pem).map_err(|e| Error::signer(format!("key PEM is not UTF-8: {}", e)))
    }

    pub fn public_key_der(&self) -> CustodyResult<Vec<u8>> {
        Ok(self.pkey.public_key_to_der()?)
    }

    pub fn pkey(&self) -> &PKeyRef<Private> {
        &self.pkey
    }

    /// RSA-equivalent strength in bits.
    pub fn strength(&self) -> u32 {
        key_strength(&self.pkey)
    }

    /// Hex SHA-256 of the DER SubjectPublicKeyInfo.
    pub fn public_key_thumbprint(&self) -> CustodyResult<String> {
        public_key_thumbprint(&self.pkey)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyPair({:?}, {} bits)", self.pkey.id(), self.pkey.bits())
    }
}

/// RSA-equivalent strength of a public key.
///
/// EC curves map to the RSA modulus of comparable security: P-256 to 3072
/// and P-384 to 7680 bits.
pub fn key_strength<T: HasPublic>(pkey: &PKeyRef<T>) -> u32 {
    let bits = pkey.bits();
    if pkey.id() == Id::EC {
        match bits {
            0..=255 => bits * 12,
            256..=383 => 3072,
            384..=520 => 7680,
            _ => 15360,
        }
    } else {
        bits
    }
}

pub fn public_key_thumbprint<T: HasPublic>(pkey: &PKeyRef<T>) -> CustodyResult<String> {
    let der = pkey.public_key_to_der()?;
    Ok(hex::encode(openssl::sha::sha256(&der)))
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_of_generated_keys() {
        let rsa = KeyPair::generate(KeyAlgorithm::Rsa, 2048).unwrap();
        assert_eq!(rsa.strength(), 2048);

        let p256 = KeyPair::generate(KeyAlgorithm::EcP256, 0).unwrap();
        assert_eq!(p256.strength(), 3072);

        let p384 = KeyPair::generate(KeyAlgorithm::EcP384, 0).unwrap();
        assert_eq!(p384.strength(), 7680);
    }

    #[test]
    fn pem_reload_keeps_public_key() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, 0).unwrap();
        let pem = key.private_key_pem().unwrap();
        let loaded = KeyPair::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(
            key.public_key_thumbprint().unwrap(),
            loaded.public_key_thumbprint().unwrap()
        );
        assert!(!format!("{:?}", key).contains("PRIVATE"));
    }
}
