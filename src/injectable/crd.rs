//! CustomResourceDefinition conversion webhooks

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use super::{encode_bundle, string_at, Injectable, InjectableKind};
use crate::Result;

/// Conversion strategy that calls out to a webhook
const WEBHOOK_STRATEGY: &str = "Webhook";

/// Injects into `spec.conversion.webhook.clientConfig.caBundle`
///
/// CRDs with the `None` conversion strategy have no client config and are
/// left alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrdConversionInjectable;

impl CrdConversionInjectable {
    fn uses_webhook(obj: &DynamicObject) -> bool {
        string_at(obj, "/spec/conversion/strategy").as_deref() == Some(WEBHOOK_STRATEGY)
    }
}

impl Injectable for CrdConversionInjectable {
    fn kind(&self) -> InjectableKind {
        InjectableKind::CrdConversion
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<CustomResourceDefinition>(&())
    }

    fn current_bundles(&self, obj: &DynamicObject) -> Vec<Option<String>> {
        if !Self::uses_webhook(obj) {
            return Vec::new();
        }
        vec![string_at(obj, "/spec/conversion/webhook/clientConfig/caBundle")]
    }

    fn inject_ca(&self, obj: &DynamicObject, bundle: &[u8]) -> Result<Option<Value>> {
        if !Self::uses_webhook(obj) {
            return Ok(None);
        }
        Ok(Some(json!({
            "spec": {
                "conversion": {
                    "webhook": {
                        "clientConfig": { "caBundle": encode_bundle(bundle) }
                    }
                }
            }
        })))
    }
}
