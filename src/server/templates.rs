//! Published certificate templates.

use std::collections::HashMap;
use std::sync::RwLock;

use log::info;
use url::Url;

use crate::api::audit::AuditAction;
use crate::api::template::{CertificateTemplate, TemplateName, TemplateRef};
use crate::commons::actor::Actor;
use crate::commons::error::Error;
use crate::commons::storage::KeyValueStore;
use crate::commons::CustodyResult;
use crate::constants::TEMPLATES_NS;
use crate::server::audit::AuditLog;


//------------ TemplateRegistry ----------------------------------------------

/// Keeps every published version of every template.
///
/// Versions are never overwritten, so a request can always find the
/// exact template it was created with.
#[derive(Debug)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<TemplateName, Vec<CertificateTemplate>>>,
    store: KeyValueStore,
    audit: AuditLog,
}

impl TemplateRegistry {
    pub fn build(storage_uri: &Url, audit: AuditLog) -> CustodyResult<Self> {
        let store = KeyValueStore::create(storage_uri, TEMPLATES_NS)?;

        let mut templates: HashMap<TemplateName, Vec<CertificateTemplate>> = HashMap::new();
        for template in store.values::<CertificateTemplate>()? {
            templates.entry(template.name.clone()).or_default().push(template);
        }
        for versions in templates.values_mut() {
            versions.sort_by_key(|t| t.version);
        }

        Ok(TemplateRegistry { templates: RwLock::new(templates), store, audit })
    }

    /// Publishes a template version.
    ///
    /// Publishing an identical template again is a no-op, publishing a
    /// different one under an existing version is refused.
    pub fn publish(&self, template: CertificateTemplate, actor: &Actor) -> CustodyResult<TemplateRef> {
        template.verify()?;
        let reference = template.reference();

        let mut templates = self.templates.write().expect("poisoned lock");
        let versions = templates.entry(template.name.clone()).or_default();
        if let Some(existing) = versions.iter().find(|t| t.version == template.version) {
            return if *existing == template {
                Ok(reference)
            } else {
                Err(Error::TemplateVersionExists(template.name.clone(), template.version))
            };
        }

        self.store.store(&reference.storage_key(), &template)?;
        versions.push(template);
        versions.sort_by_key(|t| t.version);

        info!("Published template {}", reference);
        self.audit
            .record(actor, AuditAction::TemplatePublished { template: reference.clone() }, None);
        Ok(reference)
    }

    /// The latest version of a template.
    pub fn get(&self, name: &TemplateName) -> CustodyResult<CertificateTemplate> {
        self.templates
            .read()
            .expect("poisoned lock")
            .get(name)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| Error::TemplateUnknown(name.clone()))
    }

    pub fn get_version(&self, reference: &TemplateRef) -> CustodyResult<CertificateTemplate> {
        self.templates
            .read()
            .expect("poisoned lock")
            .get(&reference.name)
            .and_then(|versions| versions.iter().find(|t| t.version == reference.version))
            .cloned()
            .ok_or_else(|| Error::TemplateUnknown(reference.name.clone()))
    }

    /// The latest version of every template.
    pub fn list(&self) -> Vec<CertificateTemplate> {
        let mut res: Vec<_> = self
            .templates
            .read()
            .expect("poisoned lock")
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect();
        res.sort_by(|a, b| a.name.cmp(&b.name));
        res
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ACTOR_DEF_TEST;
    use crate::test;

    #[test]
    fn versions_are_immutable() {
        let uri = test::mem_storage();
        let registry = TemplateRegistry::build(&uri, AuditLog::in_memory()).unwrap();

        let v1 = test::web_server_template("local");
        registry.publish(v1.clone(), &ACTOR_DEF_TEST).unwrap();
        // Same content again is fine.
        registry.publish(v1.clone(), &ACTOR_DEF_TEST).unwrap();

        let mut changed = v1.clone();
        changed.validity_days = 365;
        assert!(matches!(
            registry.publish(changed.clone(), &ACTOR_DEF_TEST),
            Err(Error::TemplateVersionExists(_, 1))
        ));

        changed.version = 2;
        registry.publish(changed, &ACTOR_DEF_TEST).unwrap();

        let registry = TemplateRegistry::build(&uri, AuditLog::in_memory()).unwrap();
        assert_eq!(registry.get(&v1.name).unwrap().version, 2);
        assert_eq!(registry.get_version(&v1.reference()).unwrap(), v1);
        assert_eq!(registry.list().len(), 1);
        assert!(matches!(
            registry.get(&TemplateName::from("Nope")),
            Err(Error::TemplateUnknown(_))
        ));
    }
}
