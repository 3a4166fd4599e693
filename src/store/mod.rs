//! Resource store abstraction
//!
//! The engines never talk to kube-rs directly. They go through
//! [`SecretStore`] and [`ObjectStore`], which [`KubeStore`] implements over a
//! real client and tests replace with mocks or the in-memory store.
//!
//! Every write is a server-side apply with field manager [`FIELD_MANAGER`]
//! and forced ownership: the write claims exactly the fields it sends and
//! leaves fields owned by other managers alone.

#[cfg(test)]
pub(crate) mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::retry::{retry_if, RetryConfig};
use crate::{Error, Result, FIELD_MANAGER};

/// Namespace and name of a namespaced resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read and apply Secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a Secret; `None` when it does not exist
    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>>;

    /// Server-side apply the fields present in `secret`, forcing ownership
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;
}

/// List and apply arbitrary resources of a discovered kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List resources matching an equality label selector (`k=v,k2=v2`)
    async fn list(&self, ar: &ApiResource, label_selector: &str) -> Result<Vec<DynamicObject>>;

    /// Server-side apply `patch` to `object`, forcing ownership of its fields
    ///
    /// `patch` carries only the fields being claimed; `apiVersion`, `kind`
    /// and the object's identity are filled in from `ar` and `object`.
    async fn apply(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
        patch: &serde_json::Value,
    ) -> Result<()>;
}

/// Resource store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    retry: RetryConfig,
}

impl KubeStore {
    /// Create a store over `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::with_max_attempts(5),
        }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

#[async_trait]
impl SecretStore for KubeStore {
    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::validation("secret to apply has no namespace"))?;
        let name = secret.name_any();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let params = Self::apply_params();

        retry_if(&self.retry, "apply_secret", Error::is_conflict, || async {
            debug!(secret = %name, namespace = %namespace, "applying secret");
            api.patch(&name, &params, &Patch::Apply(secret)).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn list(&self, ar: &ApiResource, label_selector: &str) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn apply(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let name = object.name_any();
        let api: Api<DynamicObject> = match object.namespace() {
            Some(ns) => Api::namespaced_with(self.client.clone(), &ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        };
        let body = apply_body(ar, object, patch)?;
        let params = Self::apply_params();

        retry_if(&self.retry, "apply_object", Error::is_conflict, || async {
            debug!(name = %name, kind = %ar.kind, "applying resource");
            api.patch(&name, &params, &Patch::Apply(&body)).await?;
            Ok(())
        })
        .await
    }
}

/// Complete an apply patch with the type and identity of its target
///
/// `apiVersion` always comes from the `ApiResource` so the applied version
/// matches what the server actually serves.
pub(crate) fn apply_body(
    ar: &ApiResource,
    object: &DynamicObject,
    patch: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut body = patch.clone();
    let map = body
        .as_object_mut()
        .ok_or_else(|| Error::serialization(format!("{} patch is not a JSON object", ar.kind)))?;
    map.insert("apiVersion".to_string(), ar.api_version.clone().into());
    map.insert("kind".to_string(), ar.kind.clone().into());

    let mut metadata = serde_json::Map::new();
    metadata.insert("name".to_string(), object.name_any().into());
    if let Some(ns) = object.namespace() {
        metadata.insert("namespace".to_string(), ns.into());
    }
    map.insert("metadata".to_string(), metadata.into());
    Ok(body)
}
