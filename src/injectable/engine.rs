//! Kind-agnostic injection reconciler

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::Injectable;
use crate::authority::data_field;
use crate::driver::{Reconcile, Requeue};
use crate::store::{ObjectKey, ObjectStore, SecretStore};
use crate::{Error, Result, CA_BUNDLE_KEY};

/// Delay before looking for a CA Secret that does not exist yet
pub const SOURCE_RETRY: Duration = Duration::from_secs(5);

/// What an injection pass did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// The CA Secret or its bundle does not exist yet
    SourceNotReady,
    /// Consumers were brought up to date
    Injected {
        /// Consumers that were patched
        patched: usize,
        /// Consumers that already carried the bundle
        unchanged: usize,
    },
}

/// Keeps every consumer of one kind in sync with one CA Secret's bundle
pub struct InjectionEngine {
    injectable: Arc<dyn Injectable>,
    secrets: Arc<dyn SecretStore>,
    objects: Arc<dyn ObjectStore>,
    source: ObjectKey,
}

impl InjectionEngine {
    /// Create an engine copying the bundle of `source` into `injectable` consumers
    pub fn new(
        injectable: Arc<dyn Injectable>,
        secrets: Arc<dyn SecretStore>,
        objects: Arc<dyn ObjectStore>,
        source: ObjectKey,
    ) -> Self {
        Self {
            injectable,
            secrets,
            objects,
            source,
        }
    }

    /// Run one injection pass
    ///
    /// Every stale consumer is attempted even when an earlier apply failed;
    /// the first failure is returned afterwards.
    #[instrument(skip(self), fields(kind = %self.injectable.kind(), source = %self.source))]
    pub async fn inject(&self) -> Result<InjectionOutcome> {
        let Some(secret) = self.secrets.get_secret(&self.source).await? else {
            debug!("CA secret not found yet");
            return Ok(InjectionOutcome::SourceNotReady);
        };
        let bundle = match data_field(&secret, CA_BUNDLE_KEY) {
            Some(bundle) if !bundle.is_empty() => bundle,
            _ => {
                debug!("CA secret has no bundle yet");
                return Ok(InjectionOutcome::SourceNotReady);
            }
        };

        let ar = self.injectable.api_resource();
        let selector = self.injectable.label_selector(&self.source);
        let consumers = self.objects.list(&ar, &selector).await?;

        let mut patched = 0;
        let mut unchanged = 0;
        let mut first_error: Option<Error> = None;

        for obj in consumers
            .iter()
            .filter(|o| self.injectable.matches(o, &self.source))
        {
            let name = obj.name_any();
            let patch = match self.injectable.inject_ca(obj, bundle) {
                Ok(Some(patch)) => patch,
                Ok(None) => {
                    debug!(name = %name, "nothing to inject into");
                    continue;
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "cannot build CA bundle patch");
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if self.injectable.is_injected(obj, bundle) {
                unchanged += 1;
                continue;
            }

            match self.objects.apply(&ar, obj, &patch).await {
                Ok(()) => {
                    info!(name = %name, "injected CA bundle");
                    patched += 1;
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to inject CA bundle");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(InjectionOutcome::Injected { patched, unchanged }),
        }
    }
}

#[async_trait]
impl Reconcile for InjectionEngine {
    fn name(&self) -> String {
        format!("injector {} from {}", self.injectable.kind(), self.source)
    }

    async fn reconcile(&self) -> Result<Requeue> {
        match self.inject().await? {
            InjectionOutcome::SourceNotReady => Ok(Requeue::After(SOURCE_RETRY)),
            InjectionOutcome::Injected { .. } => Ok(Requeue::AwaitChange),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injectable::testing::consumer;
    use crate::injectable::InjectableKind;
    use crate::store::memory::MemoryStore;
    use crate::store::{MockObjectStore, MockSecretStore};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn source() -> ObjectKey {
        ObjectKey::new("system", "ca")
    }

    fn ca_secret(bundle: &[u8]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("ca".to_string()),
                namespace: Some("system".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CA_BUNDLE_KEY.to_string(),
                ByteString(bundle.to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn webhooks() -> serde_json::Value {
        json!({"webhooks": [
            {"name": "a.example.com", "sideEffects": "None",
             "clientConfig": {"service": {"name": "svc", "namespace": "system"}}},
            {"name": "b.example.com", "sideEffects": "None",
             "clientConfig": {"url": "https://hooks.example.com/b"}},
        ]})
    }

    fn engine(kind: InjectableKind, store: &Arc<MemoryStore>) -> InjectionEngine {
        InjectionEngine::new(kind.injectable(), store.clone(), store.clone(), source())
    }

    fn bundles(store: &MemoryStore, kind: &str, name: &str) -> Vec<serde_json::Value> {
        let obj = store.object(kind, name).unwrap();
        obj.data["webhooks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|w| w["clientConfig"]["caBundle"].clone())
            .collect()
    }

    // ==========================================================================
    // Injection Stories
    // ==========================================================================

    /// Story: consumers follow the bundle as it changes
    ///
    /// A labeled webhook configuration receives bundle B. When the CA Secret
    /// moves to B', the next pass rewrites every webhook to B' and leaves the
    /// rest of each entry alone.
    #[tokio::test]
    async fn story_consumers_converge_on_the_current_bundle() {
        let store = Arc::new(MemoryStore::new());
        let injectable = InjectableKind::ValidatingWebhook.injectable();
        store.put_object(consumer(injectable.as_ref(), "hooks", &source(), webhooks()));
        store.put_secret(ca_secret(b"bundle-one"));
        let engine = engine(InjectableKind::ValidatingWebhook, &store);

        let outcome = engine.inject().await.unwrap();
        assert_eq!(outcome, InjectionOutcome::Injected { patched: 1, unchanged: 0 });
        assert_eq!(
            bundles(&store, "ValidatingWebhookConfiguration", "hooks"),
            vec![json!("YnVuZGxlLW9uZQ=="), json!("YnVuZGxlLW9uZQ==")]
        );

        // Level-triggered: a second pass with no change writes nothing
        let outcome = engine.inject().await.unwrap();
        assert_eq!(outcome, InjectionOutcome::Injected { patched: 0, unchanged: 1 });
        assert_eq!(store.object_writes(), 1);

        store.put_secret(ca_secret(b"bundle-two"));
        engine.inject().await.unwrap();
        assert_eq!(
            bundles(&store, "ValidatingWebhookConfiguration", "hooks"),
            vec![json!("YnVuZGxlLXR3bw=="), json!("YnVuZGxlLXR3bw==")]
        );

        let obj = store.object("ValidatingWebhookConfiguration", "hooks").unwrap();
        assert_eq!(obj.data["webhooks"][1]["clientConfig"]["url"], "https://hooks.example.com/b");
        assert_eq!(obj.data["webhooks"][0]["sideEffects"], "None");
    }

    /// Story: the CA Secret does not exist yet
    ///
    /// Injection waits and asks to be requeued instead of failing.
    #[tokio::test]
    async fn story_missing_source_requeues() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(InjectableKind::ApiService, &store);

        assert_eq!(engine.inject().await.unwrap(), InjectionOutcome::SourceNotReady);
        assert_eq!(engine.reconcile().await.unwrap(), Requeue::After(SOURCE_RETRY));

        store.put_secret(ca_secret(b""));
        assert_eq!(engine.inject().await.unwrap(), InjectionOutcome::SourceNotReady);
    }

    #[tokio::test]
    async fn test_only_consumers_of_this_secret_are_touched() {
        let store = Arc::new(MemoryStore::new());
        let injectable = InjectableKind::ApiService.injectable();
        store.put_secret(ca_secret(b"bundle"));
        store.put_object(consumer(
            injectable.as_ref(),
            "v1.mine.example.com",
            &source(),
            json!({"spec": {}}),
        ));
        store.put_object(consumer(
            injectable.as_ref(),
            "v1.theirs.example.com",
            &ObjectKey::new("system", "other-ca"),
            json!({"spec": {}}),
        ));

        engine(InjectableKind::ApiService, &store).inject().await.unwrap();

        let mine = store.object("APIService", "v1.mine.example.com").unwrap();
        let theirs = store.object("APIService", "v1.theirs.example.com").unwrap();
        assert_eq!(mine.data["spec"]["caBundle"], "YnVuZGxl");
        assert!(theirs.data["spec"].get("caBundle").is_none());
    }

    #[tokio::test]
    async fn test_crds_without_webhook_conversion_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let injectable = InjectableKind::CrdConversion.injectable();
        store.put_secret(ca_secret(b"bundle"));
        store.put_object(consumer(
            injectable.as_ref(),
            "plain.example.com",
            &source(),
            json!({"spec": {"conversion": {"strategy": "None"}}}),
        ));

        let outcome = engine(InjectableKind::CrdConversion, &store).inject().await.unwrap();
        assert_eq!(outcome, InjectionOutcome::Injected { patched: 0, unchanged: 0 });
        assert_eq!(store.object_writes(), 0);
    }

    /// One failing consumer does not starve the others.
    #[tokio::test]
    async fn test_failed_apply_does_not_stop_other_consumers() {
        let injectable = InjectableKind::ApiService.injectable();
        let objects = vec![
            consumer(injectable.as_ref(), "first", &source(), json!({"spec": {}})),
            consumer(injectable.as_ref(), "second", &source(), json!({"spec": {}})),
        ];

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_get_secret()
            .returning(|_| Ok(Some(ca_secret(b"bundle"))));

        let mut store = MockObjectStore::new();
        store
            .expect_list()
            .returning(move |_, _| Ok(objects.clone()));
        store
            .expect_apply()
            .times(2)
            .returning(|_, obj, _| match obj.name_any().as_str() {
                "first" => Err(Error::ApplyRejected("field is immutable".into())),
                _ => Ok(()),
            });

        let engine = InjectionEngine::new(injectable, Arc::new(secrets), Arc::new(store), source());
        assert!(matches!(
            engine.inject().await,
            Err(Error::ApplyRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_list_failure_propagates() {
        let mut secrets = MockSecretStore::new();
        secrets
            .expect_get_secret()
            .returning(|_| Ok(Some(ca_secret(b"bundle"))));
        let mut store = MockObjectStore::new();
        store
            .expect_list()
            .returning(|_, _| Err(Error::internal("list", "connection reset")));
        store.expect_apply().never();

        let engine = InjectionEngine::new(
            InjectableKind::MutatingWebhook.injectable(),
            Arc::new(secrets),
            Arc::new(store),
            source(),
        );
        let err = engine.reconcile().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
