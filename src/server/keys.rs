//! Private keys generated for enrollment requests.
//!
//! Keys are stored by reference in their own namespace so that request
//! records never carry key material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::ca::KeyRef;
use crate::commons::crypto::{KeyAlgorithm, KeyPair};
use crate::commons::error::Error;
use crate::commons::storage::KeyValueStore;
use crate::commons::{CustodyEmptyResult, CustodyResult};


//------------ StoredKey -----------------------------------------------------

#[derive(Deserialize, Serialize)]
struct StoredKey {
    pem: String,
    created: DateTime<Utc>,
}


//------------ KeyVault ------------------------------------------------------

#[derive(Clone, Debug)]
pub struct KeyVault {
    store: KeyValueStore,
}

impl KeyVault {
    pub fn create(storage_uri: &Url, namespace: &str) -> CustodyResult<Self> {
        Ok(KeyVault { store: KeyValueStore::create(storage_uri, namespace)? })
    }

    /// Generates and stores a new key.
    ///
    /// The reference is the key's public key thumbprint.
    pub fn generate(&self, algorithm: KeyAlgorithm, rsa_bits: u32) -> CustodyResult<(KeyRef, KeyPair)> {
        let key = KeyPair::generate(algorithm, rsa_bits)?;
        let key_ref = self.store_key(&key)?;
        Ok((key_ref, key))
    }

    pub fn store_key(&self, key: &KeyPair) -> CustodyResult<KeyRef> {
        let key_ref = KeyRef::new(key.public_key_thumbprint()?);
        let stored = StoredKey { pem: key.private_key_pem()?, created: Utc::now() };
        self.store.store(key_ref.as_str(), &stored)?;
        Ok(key_ref)
    }

    pub fn load(&self, key_ref: &KeyRef) -> CustodyResult<KeyPair> {
        let stored: StoredKey = self
            .store
            .get(key_ref.as_str())?
            .ok_or_else(|| Error::signer(format!("key '{}' not found", key_ref)))?;
        KeyPair::from_pem(stored.pem.as_bytes())
    }

    pub fn has(&self, key_ref: &KeyRef) -> CustodyResult<bool> {
        Ok(self.store.has(key_ref.as_str())?)
    }

    pub fn delete(&self, key_ref: &KeyRef) -> CustodyEmptyResult {
        Ok(self.store.delete(key_ref.as_str())?)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_load_delete() {
        let uri = Url::parse(&format!("memory://{}", uuid::Uuid::new_v4())).unwrap();
        let vault = KeyVault::create(&uri, "keys").unwrap();

        let (key_ref, key) = vault.generate(KeyAlgorithm::EcP256, 0).unwrap();
        let loaded = vault.load(&key_ref).unwrap();
        assert_eq!(loaded.public_key_thumbprint().unwrap(), key.public_key_thumbprint().unwrap());

        vault.delete(&key_ref).unwrap();
        assert!(!vault.has(&key_ref).unwrap());
        assert!(vault.load(&key_ref).is_err());
    }
}
