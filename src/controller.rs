//! Controller wiring
//!
//! Each `build_*` function pairs a reconciler with the watches that trigger
//! it and returns a boxed future the binary can spawn. Watches only produce
//! "something changed" signals; every pass re-reads what it needs through the
//! store, so lost or duplicated events cost nothing but a pass.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, watcher, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::authority::CaIssuer;
use crate::config::Options;
use crate::driver::{bootstrap, Driver, Trigger};
use crate::injectable::InjectionEngine;
use crate::serving::{CertificateHolder, ServingCertificateLoader};
use crate::store::{KubeStore, ObjectKey, ObjectStore, SecretStore};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A spawned controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the CA issuer
///
/// Triggered by changes to the CA Secret (including its deletion), once at
/// startup, and by its own rotation schedule.
pub fn build_ca_issuer(
    client: Client,
    store: Arc<KubeStore>,
    options: Arc<Options>,
    cancel: CancellationToken,
) -> ControllerFuture {
    let key = options.ca_key();
    let driver = Driver::with_resync(options.resync_interval);
    let issuer = CaIssuer::new(store, options);
    let triggers = bootstrap(secret_triggers(client, &key));

    info!(secret = %key, "- CA issuer");
    Box::pin(async move { driver.run(&issuer, triggers, cancel).await })
}

/// Build the serving certificate loader
///
/// Runs on every replica: each process needs its own serving certificate
/// regardless of who writes the CA.
pub fn build_serving_loader(
    client: Client,
    store: Arc<KubeStore>,
    holder: Arc<CertificateHolder>,
    options: Arc<Options>,
    cancel: CancellationToken,
) -> ControllerFuture {
    let key = options.ca_key();
    let driver = Driver::with_resync(options.resync_interval);
    let loader = ServingCertificateLoader::new(store, holder, key.clone());
    let triggers = bootstrap(secret_triggers(client, &key));

    info!(secret = %key, "- serving certificate loader");
    Box::pin(async move { driver.run(&loader, triggers, cancel).await })
}

/// Build one injector per enabled consumer kind
///
/// Each injector is triggered by the CA Secret and by any labeled consumer
/// of its kind being created or updated.
pub fn build_injectors(
    client: Client,
    store: Arc<KubeStore>,
    options: Arc<Options>,
    cancel: CancellationToken,
) -> Vec<ControllerFuture> {
    let source = options.ca_key();
    let secrets: Arc<dyn SecretStore> = store.clone();
    let objects: Arc<dyn ObjectStore> = store;

    options
        .injectables
        .iter()
        .map(|kind| {
            let injectable = kind.injectable();
            let ar = injectable.api_resource();
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
            let config = WatcherConfig::default()
                .labels(&injectable.label_selector(&source))
                .timeout(WATCH_TIMEOUT_SECS);

            let triggers = futures::stream::select(
                secret_triggers(client.clone(), &source),
                change_triggers(watcher(api, config), kind.as_str()),
            );
            let engine = InjectionEngine::new(
                injectable,
                secrets.clone(),
                objects.clone(),
                source.clone(),
            );
            let driver = Driver::with_resync(options.resync_interval);
            let cancel = cancel.clone();

            info!(kind = %kind, "- CA bundle injector");
            Box::pin(async move { driver.run(&engine, triggers, cancel).await }) as ControllerFuture
        })
        .collect()
}

/// Changes to the single Secret `key`
fn secret_triggers(client: Client, key: &ObjectKey) -> impl Stream<Item = Trigger> + Send {
    let api: Api<Secret> = Api::namespaced(client, &key.namespace);
    let config = WatcherConfig::default()
        .fields(&format!("metadata.name={}", key.name))
        .timeout(WATCH_TIMEOUT_SECS);
    change_triggers(watcher(api, config), "Secret")
}

/// Turn watcher events into triggers, one per applied or deleted object
///
/// Watch errors are logged; the stream backs off and re-establishes itself.
pub(crate) fn change_triggers<K, S>(events: S, kind: &str) -> impl Stream<Item = Trigger> + Send
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
{
    let kind = kind.to_string();
    events
        .default_backoff()
        .touched_objects()
        .filter_map(move |event| {
            let kind = kind.clone();
            async move {
                match event {
                    Ok(obj) => Some(Trigger::Changed {
                        name: object_name(&obj),
                        kind,
                    }),
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "watch failed, will retry");
                        None
                    }
                }
            }
        })
}

fn object_name<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}
