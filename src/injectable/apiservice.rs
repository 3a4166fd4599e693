//! Aggregated API services

use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use super::{encode_bundle, string_at, Injectable, InjectableKind};
use crate::Result;

/// Injects into `spec.caBundle`
#[derive(Clone, Copy, Debug, Default)]
pub struct ApiServiceInjectable;

impl Injectable for ApiServiceInjectable {
    fn kind(&self) -> InjectableKind {
        InjectableKind::ApiService
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<APIService>(&())
    }

    fn current_bundles(&self, obj: &DynamicObject) -> Vec<Option<String>> {
        vec![string_at(obj, "/spec/caBundle")]
    }

    fn inject_ca(&self, _obj: &DynamicObject, bundle: &[u8]) -> Result<Option<Value>> {
        Ok(Some(json!({ "spec": { "caBundle": encode_bundle(bundle) } })))
    }
}
