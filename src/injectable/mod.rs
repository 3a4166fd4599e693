//! CA-bundle injection into labeled consumers
//!
//! A consumer opts in by carrying two labels naming the CA Secret it trusts:
//!
//! ```text
//! dynamic-authority.io/inject-ca-from-secret-namespace: <namespace>
//! dynamic-authority.io/inject-ca-from-secret-name: <name>
//! ```
//!
//! Each supported kind implements [`Injectable`]: where its bundle field
//! lives and how to build an apply patch for it. [`InjectionEngine`] is the
//! kind-agnostic reconciler that lists consumers and patches the stale ones.

mod apiservice;
mod crd;
mod engine;
mod webhook;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;

pub use apiservice::ApiServiceInjectable;
pub use crd::CrdConversionInjectable;
pub use engine::{InjectionEngine, InjectionOutcome};
pub use webhook::{MutatingWebhookInjectable, ValidatingWebhookInjectable};

use crate::store::ObjectKey;
use crate::{Error, Result, INJECT_NAMESPACE_LABEL, INJECT_NAME_LABEL};

/// Consumer kinds that can receive the trust bundle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InjectableKind {
    /// `admissionregistration.k8s.io/v1` ValidatingWebhookConfiguration
    ValidatingWebhook,
    /// `admissionregistration.k8s.io/v1` MutatingWebhookConfiguration
    MutatingWebhook,
    /// `apiextensions.k8s.io/v1` CustomResourceDefinition conversion webhook
    CrdConversion,
    /// `apiregistration.k8s.io/v1` APIService
    ApiService,
}

impl InjectableKind {
    /// Every supported kind
    pub const ALL: [InjectableKind; 4] = [
        Self::ValidatingWebhook,
        Self::MutatingWebhook,
        Self::CrdConversion,
        Self::ApiService,
    ];

    /// Kubernetes kind name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidatingWebhook => "ValidatingWebhookConfiguration",
            Self::MutatingWebhook => "MutatingWebhookConfiguration",
            Self::CrdConversion => "CustomResourceDefinition",
            Self::ApiService => "APIService",
        }
    }

    /// The capability implementation for this kind
    pub fn injectable(self) -> Arc<dyn Injectable> {
        match self {
            Self::ValidatingWebhook => Arc::new(ValidatingWebhookInjectable),
            Self::MutatingWebhook => Arc::new(MutatingWebhookInjectable),
            Self::CrdConversion => Arc::new(CrdConversionInjectable),
            Self::ApiService => Arc::new(ApiServiceInjectable),
        }
    }
}

impl fmt::Display for InjectableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InjectableKind {
    type Err = Error;

    /// Accepts the kind name case-insensitively, or the short aliases
    /// `validating`, `mutating`, `crd` and `apiservice`
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "validating" | "validatingwebhookconfiguration" => Ok(Self::ValidatingWebhook),
            "mutating" | "mutatingwebhookconfiguration" => Ok(Self::MutatingWebhook),
            "crd" | "customresourcedefinition" => Ok(Self::CrdConversion),
            "apiservice" => Ok(Self::ApiService),
            _ => Err(Error::validation(format!("unknown injectable kind: {}", s))),
        }
    }
}

/// A consumer kind whose resources carry a CA bundle field
///
/// Implementations are pure: they inspect and build JSON, and the engine
/// does all I/O.
pub trait Injectable: Send + Sync {
    /// Which kind this is
    fn kind(&self) -> InjectableKind;

    /// Type information for listing, watching and applying
    fn api_resource(&self) -> ApiResource;

    /// Label selector for consumers of the CA Secret `source`
    fn label_selector(&self, source: &ObjectKey) -> String {
        format!(
            "{}={},{}={}",
            INJECT_NAMESPACE_LABEL, source.namespace, INJECT_NAME_LABEL, source.name
        )
    }

    /// Whether `obj` asks for the bundle of `source`
    fn matches(&self, obj: &DynamicObject, source: &ObjectKey) -> bool {
        let labels = obj.labels();
        labels.get(INJECT_NAMESPACE_LABEL) == Some(&source.namespace)
            && labels.get(INJECT_NAME_LABEL) == Some(&source.name)
    }

    /// Base64 bundle values currently in every bundle field of `obj`
    ///
    /// Empty when the object has no field to inject into.
    fn current_bundles(&self, obj: &DynamicObject) -> Vec<Option<String>>;

    /// Apply patch setting every bundle field of `obj` to `bundle`
    ///
    /// `None` when the object has nothing to inject into.
    fn inject_ca(&self, obj: &DynamicObject, bundle: &[u8]) -> Result<Option<serde_json::Value>>;

    /// Whether every bundle field of `obj` already holds exactly `bundle`
    fn is_injected(&self, obj: &DynamicObject, bundle: &[u8]) -> bool {
        let want = encode_bundle(bundle);
        let current = self.current_bundles(obj);
        !current.is_empty() && current.iter().all(|b| b.as_deref() == Some(want.as_str()))
    }
}

/// Wire form of a bundle inside a resource (`[]byte` fields are base64)
pub(crate) fn encode_bundle(bundle: &[u8]) -> String {
    STANDARD.encode(bundle)
}

/// String at `pointer` inside the object's body
pub(crate) fn string_at(obj: &DynamicObject, pointer: &str) -> Option<String> {
    obj.data
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
