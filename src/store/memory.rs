//! In-memory resource store for scenario tests
//!
//! Models just enough of server-side apply for the engines: applied maps are
//! merged key by key, and lists of objects are merged by their `name` field
//! (the list-map semantics of webhook lists).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::{apply_body, ObjectKey, ObjectStore, SecretStore};
use crate::{Error, Result};

#[derive(Default)]
pub(crate) struct MemoryStore {
    secrets: Mutex<BTreeMap<ObjectKey, Secret>>,
    objects: Mutex<BTreeMap<(String, String), DynamicObject>>,
    secret_writes: AtomicUsize,
    object_writes: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn secret(&self, key: &ObjectKey) -> Option<Secret> {
        self.secrets.lock().get(key).cloned()
    }

    /// Replace a Secret wholesale, as an external writer would
    pub(crate) fn put_secret(&self, secret: Secret) {
        let key = ObjectKey::new(secret.namespace().unwrap_or_default(), secret.name_any());
        self.secrets.lock().insert(key, secret);
    }

    pub(crate) fn delete_secret(&self, key: &ObjectKey) {
        self.secrets.lock().remove(key);
    }

    /// Mutate a stored Secret in place without counting it as an apply
    pub(crate) fn edit_secret(&self, key: &ObjectKey, edit: impl FnOnce(&mut Secret)) {
        if let Some(secret) = self.secrets.lock().get_mut(key) {
            edit(secret);
        }
    }

    pub(crate) fn put_object(&self, object: DynamicObject) {
        let kind = object
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        self.objects.lock().insert((kind, object.name_any()), object);
    }

    pub(crate) fn object(&self, kind: &str, name: &str) -> Option<DynamicObject> {
        self.objects
            .lock()
            .get(&(kind.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn secret_writes(&self) -> usize {
        self.secret_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn object_writes(&self) -> usize {
        self.object_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>> {
        Ok(self.secret(key))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let key = ObjectKey::new(
            secret
                .namespace()
                .ok_or_else(|| Error::validation("secret to apply has no namespace"))?,
            secret.name_any(),
        );
        let applied = serde_json::to_value(secret)?;

        let mut secrets = self.secrets.lock();
        let mut current = match secrets.get(&key) {
            Some(existing) => serde_json::to_value(existing)?,
            None => Value::Object(Default::default()),
        };
        merge(&mut current, &applied);
        secrets.insert(key, serde_json::from_value(current)?);
        self.secret_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, ar: &ApiResource, label_selector: &str) -> Result<Vec<DynamicObject>> {
        let selector = parse_selector(label_selector)?;
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((kind, _), _)| *kind == ar.kind)
            .filter(|(_, obj)| {
                let labels = obj.labels();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn apply(&self, ar: &ApiResource, object: &DynamicObject, patch: &Value) -> Result<()> {
        let body = apply_body(ar, object, patch)?;
        let key = (ar.kind.clone(), object.name_any());

        let mut objects = self.objects.lock();
        let existing = objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("{} {}", key.0, key.1)))?;
        let mut current = serde_json::to_value(existing)?;
        merge(&mut current, &body);
        objects.insert(key, serde_json::from_value(current)?);
        self.object_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn parse_selector(selector: &str) -> Result<Vec<(String, String)>> {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|term| {
            term.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::validation(format!("unsupported selector term: {}", term)))
        })
        .collect()
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(patch)) if is_named_list(patch) => {
            for item in patch {
                let name = &item["name"];
                match target.iter_mut().find(|t| &t["name"] == name) {
                    Some(existing) => merge(existing, item),
                    None => target.push(item.clone()),
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|i| i.get("name").is_some_and(Value::is_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_unrelated_fields() {
        let mut target = json!({
            "metadata": {"name": "w", "labels": {"a": "1"}},
            "webhooks": [
                {"name": "one", "sideEffects": "None", "clientConfig": {"url": "https://x"}},
                {"name": "two", "sideEffects": "None"}
            ]
        });
        let patch = json!({
            "metadata": {"name": "w"},
            "webhooks": [
                {"name": "two", "clientConfig": {"caBundle": "Zm9v"}},
                {"name": "one", "clientConfig": {"caBundle": "Zm9v"}}
            ]
        });
        merge(&mut target, &patch);

        assert_eq!(target["metadata"]["labels"]["a"], "1");
        assert_eq!(target["webhooks"][0]["clientConfig"]["url"], "https://x");
        assert_eq!(target["webhooks"][0]["clientConfig"]["caBundle"], "Zm9v");
        assert_eq!(target["webhooks"][1]["sideEffects"], "None");
        assert_eq!(target["webhooks"][1]["clientConfig"]["caBundle"], "Zm9v");
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!(
            parse_selector("a=1,b=2").unwrap(),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
        assert!(parse_selector("").unwrap().is_empty());
        assert!(parse_selector("a in (1,2)").is_err());
    }
}
