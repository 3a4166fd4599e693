//! End-to-end tests against a live Kubernetes cluster
//!
//! These tests use the current kubeconfig context and create (then delete)
//! their own namespace and webhook configuration. They are ignored by default
//! and can be run with:
//!
//! ```bash
//! cargo test --test cluster -- --ignored
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;

use dynamic_authority::authority::{CaIssuer, GenerateReason, IssueOutcome};
use dynamic_authority::config::Options;
use dynamic_authority::injectable::{InjectableKind, InjectionEngine, InjectionOutcome};
use dynamic_authority::pki::decode_certificate_set;
use dynamic_authority::store::KubeStore;
use dynamic_authority::{
    CA_BUNDLE_KEY, INJECT_NAMESPACE_LABEL, INJECT_NAME_LABEL, RENEW_REQUESTED_AT_ANNOTATION,
};

const TEST_NAMESPACE: &str = "dynamic-authority-it";
const TEST_SECRET: &str = "it-ca";
const TEST_WEBHOOK: &str = "dynamic-authority-it";

// =============================================================================
// Test Fixtures
// =============================================================================

fn test_options() -> Arc<Options> {
    Arc::new(Options {
        namespace: TEST_NAMESPACE.to_string(),
        ca_secret: TEST_SECRET.to_string(),
        ..Default::default()
    })
}

async fn ensure_namespace(client: &Client) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    namespaces
        .patch(
            TEST_NAMESPACE,
            &PatchParams::apply("dynamic-authority-it").force(),
            &Patch::Apply(&namespace),
        )
        .await
        .expect("namespace should be applied");
}

/// Webhook configuration with two hooks that match no real resource
fn sample_webhook_configuration() -> ValidatingWebhookConfiguration {
    let hook = |name: &str| ValidatingWebhook {
        name: name.to_string(),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Ignore".to_string()),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: "nonexistent".to_string(),
                namespace: TEST_NAMESPACE.to_string(),
                path: Some("/validate".to_string()),
                port: Some(443),
            }),
            ..Default::default()
        },
        rules: Some(vec![RuleWithOperations {
            operations: Some(vec!["CREATE".to_string()]),
            api_groups: Some(vec!["it.dynamic-authority.io".to_string()]),
            api_versions: Some(vec!["v1".to_string()]),
            resources: Some(vec!["nothings".to_string()]),
            scope: Some("*".to_string()),
        }]),
        ..Default::default()
    };

    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(TEST_WEBHOOK.to_string()),
            labels: Some(BTreeMap::from([
                (INJECT_NAMESPACE_LABEL.to_string(), TEST_NAMESPACE.to_string()),
                (INJECT_NAME_LABEL.to_string(), TEST_SECRET.to_string()),
            ])),
            ..Default::default()
        },
        webhooks: Some(vec![
            hook("one.it.dynamic-authority.io"),
            hook("two.it.dynamic-authority.io"),
        ]),
    }
}

async fn cleanup(client: &Client) {
    let webhooks: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let _ = webhooks.delete(TEST_WEBHOOK, &DeleteParams::default()).await;
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let _ = namespaces.delete(TEST_NAMESPACE, &DeleteParams::default()).await;
}

// =============================================================================
// Stories
// =============================================================================

/// Story: a fresh cluster gets a CA and every webhook gets its bundle
///
/// The first issuer pass creates the CA Secret, the second finds nothing to
/// do. The injector then copies the bundle into both webhooks of a labeled
/// configuration, and a renewal request rolls the CA while keeping the old
/// one trusted.
#[tokio::test]
#[ignore]
async fn story_ca_lifecycle_and_injection() {
    let client = Client::try_default().await.expect("kubeconfig should load");
    cleanup(&client).await;
    ensure_namespace(&client).await;

    let store = Arc::new(KubeStore::new(client.clone()));
    let options = test_options();
    let issuer = CaIssuer::new(store.clone(), options.clone());

    let first = issuer.reconcile_at(Utc::now()).await.expect("first pass");
    assert_eq!(first.outcome, IssueOutcome::Generated(GenerateReason::Missing));
    let second = issuer.reconcile_at(Utc::now()).await.expect("second pass");
    assert_eq!(second.outcome, IssueOutcome::Unchanged);
    assert_eq!(second.serial, first.serial);

    let webhooks: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    webhooks
        .patch(
            TEST_WEBHOOK,
            &PatchParams::apply("dynamic-authority-it").force(),
            &Patch::Apply(&sample_webhook_configuration()),
        )
        .await
        .expect("webhook configuration should be applied");

    let engine = InjectionEngine::new(
        InjectableKind::ValidatingWebhook.injectable(),
        store.clone(),
        store.clone(),
        options.ca_key(),
    );
    let outcome = engine.inject().await.expect("injection pass");
    assert_eq!(outcome, InjectionOutcome::Injected { patched: 1, unchanged: 0 });

    let secrets: Api<Secret> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let secret = secrets.get(TEST_SECRET).await.expect("CA secret");
    let bundle = secret.data.as_ref().unwrap()[CA_BUNDLE_KEY].0.clone();

    let injected = webhooks.get(TEST_WEBHOOK).await.expect("webhook configuration");
    for hook in injected.webhooks.unwrap() {
        assert_eq!(hook.client_config.ca_bundle.unwrap().0, bundle, "{}", hook.name);
    }

    // Request a renewal the way an operator would
    let request = serde_json::json!({
        "metadata": {"annotations": {RENEW_REQUESTED_AT_ANNOTATION: Utc::now().to_rfc3339()}}
    });
    secrets
        .patch(TEST_SECRET, &PatchParams::default(), &Patch::Merge(&request))
        .await
        .expect("renewal request");

    let renewed = issuer.reconcile_at(Utc::now()).await.expect("renewal pass");
    assert!(matches!(
        renewed.outcome,
        IssueOutcome::Generated(GenerateReason::RenewalRequested(_))
    ));
    assert_ne!(renewed.serial, first.serial);
    assert_eq!(renewed.bundle_len, 2);

    let secret = secrets.get(TEST_SECRET).await.expect("CA secret");
    let bundle = &secret.data.as_ref().unwrap()[CA_BUNDLE_KEY].0;
    assert_eq!(decode_certificate_set(bundle).unwrap().len(), 2);

    let outcome = engine.inject().await.expect("second injection pass");
    assert_eq!(outcome, InjectionOutcome::Injected { patched: 1, unchanged: 0 });

    cleanup(&client).await;
}
