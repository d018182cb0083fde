//! Known distribution targets and what is installed on them.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use log::info;
use url::Url;

use crate::api::request::RequestId;
use crate::api::target::{DistributionTarget, TargetId};
use crate::commons::crypto::Thumbprint;
use crate::commons::error::Error;
use crate::commons::storage::KeyValueStore;
use crate::commons::{CustodyEmptyResult, CustodyResult};
use crate::constants::TARGETS_NS;


//------------ TargetRegistry ------------------------------------------------

#[derive(Debug)]
pub struct TargetRegistry {
    targets: RwLock<HashMap<TargetId, DistributionTarget>>,
    store: KeyValueStore,
}

impl TargetRegistry {
    pub fn build(storage_uri: &Url) -> CustodyResult<Self> {
        let store = KeyValueStore::create(storage_uri, TARGETS_NS)?;
        let targets = store
            .values::<DistributionTarget>()?
            .into_iter()
            .map(|target| (target.id.clone(), target))
            .collect();
        Ok(TargetRegistry { targets: RwLock::new(targets), store })
    }

    /// Adds or updates a target from configuration.
    ///
    /// What is known to be installed on a target already is kept.
    pub fn configure(&self, target: DistributionTarget) -> CustodyEmptyResult {
        let mut targets = self.targets.write().expect("poisoned lock");
        let target = match targets.get(&target.id) {
            Some(current) => target.with_state_of(current),
            None => {
                info!("Added {} target '{}'", target.target_type(), target.id);
                target
            }
        };
        self.store.store(target.id.as_str(), &target)?;
        targets.insert(target.id.clone(), target);
        Ok(())
    }

    pub fn get(&self, id: &TargetId) -> CustodyResult<DistributionTarget> {
        self.targets
            .read()
            .expect("poisoned lock")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TargetUnknown(id.clone()))
    }

    pub fn list(&self) -> Vec<DistributionTarget> {
        let mut res: Vec<_> = self.targets.read().expect("poisoned lock").values().cloned().collect();
        res.sort_by(|a, b| a.id.cmp(&b.id));
        res
    }

    /// Records the certificate now active for the target's service.
    pub fn record_install(&self, id: &TargetId, thumbprint: Thumbprint, request: RequestId) -> CustodyEmptyResult {
        self.update(id, |target| {
            target.last_thumbprint = Some(thumbprint);
            target.installed_request = Some(request);
            target.installed_at = Some(Utc::now());
        })
    }

    /// Records that a backup was put back.
    pub fn record_restore(&self, id: &TargetId, thumbprint: Option<Thumbprint>) -> CustodyEmptyResult {
        self.update(id, |target| {
            target.last_thumbprint = thumbprint;
            target.installed_request = None;
            target.installed_at = Some(Utc::now());
        })
    }

    fn update(&self, id: &TargetId, op: impl FnOnce(&mut DistributionTarget)) -> CustodyEmptyResult {
        let mut targets = self.targets.write().expect("poisoned lock");
        let target = targets.get_mut(id).ok_or_else(|| Error::TargetUnknown(id.clone()))?;
        let mut updated = target.clone();
        op(&mut updated);
        self.store.store(id.as_str(), &updated)?;
        *target = updated;
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn reconfigure_keeps_install_state() {
        let uri = test::mem_storage();
        let registry = TargetRegistry::build(&uri).unwrap();
        let target = test::appliance_target("applianceA");
        registry.configure(target.clone()).unwrap();

        let thumbprint: Thumbprint = "ab".repeat(32).parse().unwrap();
        let request = RequestId::generate();
        registry.record_install(&target.id, thumbprint.clone(), request).unwrap();

        let mut changed = target.clone();
        changed.address = "fw2.example.com".into();
        registry.configure(changed).unwrap();

        let registry = TargetRegistry::build(&uri).unwrap();
        let loaded = registry.get(&target.id).unwrap();
        assert_eq!(loaded.address, "fw2.example.com");
        assert_eq!(loaded.last_thumbprint, Some(thumbprint));
        assert_eq!(loaded.installed_request, Some(request));
        assert!(matches!(registry.get(&TargetId::from("nope")), Err(Error::TargetUnknown(_))));
    }
}
