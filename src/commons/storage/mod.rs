//! Key-value storage for JSON documents.
//!
//! Every component keeps its records in a namespace of a
//! [`KeyValueStore`]. The storage backend is selected by the storage URI:
//! `local:///path` (or `file:///path`) stores one JSON file per key on
//! disk, `memory://name` keeps values in process memory, shared between
//! all stores opened with the same name.

use std::{error, fmt, io};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use url::Url;

mod disk;
mod memory;


//------------ KeyValueStore -------------------------------------------------

#[derive(Clone, Debug)]
pub struct KeyValueStore {
    inner: Arc<Backend>,
    namespace: String,
}

#[derive(Debug)]
enum Backend {
    Disk(disk::Store),
    Memory(memory::Store),
}

impl KeyValueStore {
    /// Opens the store for `namespace` at the location given by `uri`.
    pub fn create(uri: &Url, namespace: &str) -> Result<Self, Error> {
        check_segment(namespace)?;
        let backend = match StorageUri::parse(uri)? {
            StorageUri::Disk(path) => Backend::Disk(disk::Store::new(&path, namespace)?),
            StorageUri::Memory(name) => Backend::Memory(memory::Store::open(&name, namespace)),
        };
        Ok(KeyValueStore { inner: Arc::new(backend), namespace: namespace.to_string() })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the value stored under `key`, if any.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        check_segment(key)?;
        match self.inner.as_ref() {
            Backend::Disk(store) => store.get(key),
            Backend::Memory(store) => store.get(key),
        }
    }

    pub fn has(&self, key: &str) -> Result<bool, Error> {
        check_segment(key)?;
        match self.inner.as_ref() {
            Backend::Disk(store) => store.has(key),
            Backend::Memory(store) => Ok(store.has(key)),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        check_segment(key)?;
        match self.inner.as_ref() {
            Backend::Disk(store) => store.store(key, value),
            Backend::Memory(store) => store.store(key, value),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), Error> {
        check_segment(key)?;
        match self.inner.as_ref() {
            Backend::Disk(store) => store.delete(key),
            Backend::Memory(store) => {
                store.delete(key);
                Ok(())
            }
        }
    }

    /// Returns all keys in this namespace, sorted.
    pub fn keys(&self) -> Result<Vec<String>, Error> {
        let mut keys = match self.inner.as_ref() {
            Backend::Disk(store) => store.keys()?,
            Backend::Memory(store) => store.keys(),
        };
        keys.sort();
        Ok(keys)
    }

    /// Returns all values in this namespace, in key order.
    pub fn values<T: DeserializeOwned>(&self) -> Result<Vec<T>, Error> {
        let mut res = vec![];
        for key in self.keys()? {
            if let Some(value) = self.get(&key)? {
                res.push(value);
            }
        }
        Ok(res)
    }
}


//------------ StorageUri ----------------------------------------------------

/// A parsed storage URI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StorageUri {
    Disk(PathBuf),
    Memory(String),
}

impl StorageUri {
    pub fn parse(uri: &Url) -> Result<Self, Error> {
        match uri.scheme() {
            "local" | "file" => {
                if !uri.authority().is_empty() {
                    return Err(Error::other(format!(
                        "storage uri '{}' must not have an authority",
                        uri
                    )));
                }
                let path = PathBuf::from(uri.path());
                if !path.is_absolute() {
                    return Err(Error::other(format!(
                        "storage uri '{}' must use an absolute path",
                        uri
                    )));
                }
                Ok(StorageUri::Disk(path))
            }
            "memory" => {
                let name = uri.host_str().unwrap_or_default().to_string() + uri.path();
                Ok(StorageUri::Memory(name))
            }
            scheme => Err(Error::other(format!("unsupported storage scheme '{}'", scheme))),
        }
    }

    /// The directory under which data lives, for disk storage.
    pub fn root(&self) -> Option<&PathBuf> {
        match self {
            StorageUri::Disk(path) => Some(path),
            StorageUri::Memory(_) => None,
        }
    }
}

/// Keys and namespaces become file names, so they are restricted to a
/// portable character set.
fn check_segment(segment: &str) -> Result<(), Error> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey(segment.to_string()))
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Io {
        context: Cow<'static, str>,
        err: io::Error,
    },
    Deserialize {
        key: String,
        err: String,
    },
    Serialize {
        key: String,
        err: String,
    },
    InvalidKey(String),
    Other(String),
}

impl Error {
    fn io(context: impl Into<Cow<'static, str>>, err: io::Error) -> Self {
        Error::Io { context: context.into(), err }
    }

    fn deserialize(key: &str, err: impl fmt::Display) -> Self {
        Error::Deserialize { key: key.into(), err: err.to_string() }
    }

    fn serialize(key: &str, err: impl fmt::Display) -> Self {
        Error::Serialize { key: key.into(), err: err.to_string() }
    }

    fn other(info: impl Into<String>) -> Self {
        Error::Other(info.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io { context, err } => write!(f, "{context}: {err}"),
            Error::Deserialize { key, err } => {
                write!(f, "failed to deserialize value for key '{key}': {err}")
            }
            Error::Serialize { key, err } => {
                write!(f, "failed to serialize value for key '{key}': {err}")
            }
            Error::InvalidKey(key) => write!(f, "invalid storage key '{key}'"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for Error {}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, Eq, PartialEq, serde::Serialize)]
    struct Record {
        name: String,
        count: u32,
    }

    fn record(name: &str, count: u32) -> Record {
        Record { name: name.into(), count }
    }

    fn exercise(store: &KeyValueStore) {
        assert_eq!(store.get::<Record>("a").unwrap(), None);
        store.store("b", &record("bee", 2)).unwrap();
        store.store("a", &record("ay", 1)).unwrap();
        store.store("a", &record("ay", 3)).unwrap();

        assert_eq!(store.get::<Record>("a").unwrap(), Some(record("ay", 3)));
        assert!(store.has("b").unwrap());
        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.delete("b").unwrap();
        assert!(!store.has("b").unwrap());
        assert_eq!(store.values::<Record>().unwrap(), vec![record("ay", 3)]);
    }

    #[test]
    fn disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Url::parse(&format!("local://{}", dir.path().display())).unwrap();
        let store = KeyValueStore::create(&uri, "records").unwrap();
        exercise(&store);

        // A second store on the same location sees the same data.
        let again = KeyValueStore::create(&uri, "records").unwrap();
        assert_eq!(again.get::<Record>("a").unwrap(), Some(record("ay", 3)));
    }

    #[test]
    fn memory_store_is_shared_by_name() {
        let uri = Url::parse(&format!("memory://{}", uuid::Uuid::new_v4())).unwrap();
        let store = KeyValueStore::create(&uri, "records").unwrap();
        exercise(&store);

        let again = KeyValueStore::create(&uri, "records").unwrap();
        assert_eq!(again.get::<Record>("a").unwrap(), Some(record("ay", 3)));

        let other = KeyValueStore::create(&uri, "other").unwrap();
        assert!(other.keys().unwrap().is_empty());
    }

    #[test]
    fn rejects_path_like_keys() {
        let uri = Url::parse("memory://keys-test").unwrap();
        let store = KeyValueStore::create(&uri, "records").unwrap();
        assert!(matches!(
            store.store("../escape", &record("x", 1)),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(store.get::<Record>(".hidden"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn parse_uris() {
        assert_eq!(
            StorageUri::parse(&Url::parse("local:///var/lib/custodian").unwrap()).unwrap(),
            StorageUri::Disk(PathBuf::from("/var/lib/custodian"))
        );
        assert_eq!(
            StorageUri::parse(&Url::parse("memory://test").unwrap()).unwrap(),
            StorageUri::Memory("test".into())
        );
        assert!(StorageUri::parse(&Url::parse("postgres://db/x").unwrap()).is_err());
    }
}
