//! Admission webhook configurations
//!
//! Both webhook configuration kinds keep a list of webhooks, each with its
//! own `clientConfig.caBundle`. Every entry gets the bundle. The list is a
//! map keyed by `name` under server-side apply, so the patch only needs the
//! name of each entry alongside the claimed field.

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use super::{encode_bundle, Injectable, InjectableKind};
use crate::{Error, Result};

/// Injects into every webhook of a ValidatingWebhookConfiguration
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidatingWebhookInjectable;

/// Injects into every webhook of a MutatingWebhookConfiguration
#[derive(Clone, Copy, Debug, Default)]
pub struct MutatingWebhookInjectable;

impl Injectable for ValidatingWebhookInjectable {
    fn kind(&self) -> InjectableKind {
        InjectableKind::ValidatingWebhook
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<ValidatingWebhookConfiguration>(&())
    }

    fn current_bundles(&self, obj: &DynamicObject) -> Vec<Option<String>> {
        webhook_bundles(obj)
    }

    fn inject_ca(&self, obj: &DynamicObject, bundle: &[u8]) -> Result<Option<Value>> {
        webhook_patch(obj, bundle)
    }
}

impl Injectable for MutatingWebhookInjectable {
    fn kind(&self) -> InjectableKind {
        InjectableKind::MutatingWebhook
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<MutatingWebhookConfiguration>(&())
    }

    fn current_bundles(&self, obj: &DynamicObject) -> Vec<Option<String>> {
        webhook_bundles(obj)
    }

    fn inject_ca(&self, obj: &DynamicObject, bundle: &[u8]) -> Result<Option<Value>> {
        webhook_patch(obj, bundle)
    }
}

fn webhooks(obj: &DynamicObject) -> &[Value] {
    obj.data
        .get("webhooks")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn webhook_bundles(obj: &DynamicObject) -> Vec<Option<String>> {
    webhooks(obj)
        .iter()
        .map(|w| {
            w.pointer("/clientConfig/caBundle")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

fn webhook_patch(obj: &DynamicObject, bundle: &[u8]) -> Result<Option<Value>> {
    let hooks = webhooks(obj);
    if hooks.is_empty() {
        return Ok(None);
    }

    let encoded = encode_bundle(bundle);
    let entries = hooks
        .iter()
        .map(|w| {
            let name = w.get("name").and_then(Value::as_str).ok_or_else(|| {
                Error::invalid_data(format!(
                    "webhook without a name in {}",
                    obj.metadata.name.as_deref().unwrap_or("<unnamed>")
                ))
            })?;
            Ok(json!({
                "name": name,
                "clientConfig": { "caBundle": encoded },
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(json!({ "webhooks": entries })))
}
