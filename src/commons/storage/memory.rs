//! In-memory storage.
//!
//! Stores opened with the same location name share their values for the
//! lifetime of the process, which lets a test "restart" a component on top
//! of the data an earlier instance wrote.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_json::Value;

use super::Error;


//------------ System --------------------------------------------------------

type Namespaces = HashMap<(String, String), Arc<Mutex<HashMap<String, Value>>>>;

fn system() -> &'static Mutex<Namespaces> {
    static SYSTEM: OnceLock<Mutex<Namespaces>> = OnceLock::new();
    SYSTEM.get_or_init(Default::default)
}


//------------ Store ---------------------------------------------------------

#[derive(Debug)]
pub struct Store {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl Store {
    pub fn open(location: &str, namespace: &str) -> Self {
        let mut system = system().lock().expect("poisoned lock");
        let values = system
            .entry((location.to_string(), namespace.to_string()))
            .or_default()
            .clone();
        Store { values }
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.lock().expect("poisoned lock").contains_key(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let values = self.values.lock().expect("poisoned lock");
        match values.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| Error::deserialize(key, err)),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.lock().expect("poisoned lock").keys().cloned().collect()
    }

    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let value = serde_json::to_value(value).map_err(|err| Error::serialize(key, err))?;
        self.values.lock().expect("poisoned lock").insert(key.to_string(), value);
        Ok(())
    }

    pub fn delete(&self, key: &str) {
        self.values.lock().expect("poisoned lock").remove(key);
    }
}
