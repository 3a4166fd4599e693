//! CA authority engine
//!
//! Owns the CA Secret. Each pass runs the same fixed sequence:
//!
//! 1. Load the Secret (absent means "create")
//! 2. Validate certificate, key and their pairing, expiry and rotation age
//! 3. Check for a pending renewal request
//! 4. Generate a fresh CA if any check failed
//! 5. Merge the current certificate into the trust bundle
//! 6. Apply the owned field set, but only if it differs from what is stored
//!
//! A pass that fails after generating simply loses that CA: the next pass
//! sees the old (or absent) material again and generates anew.

mod generate;
mod inspect;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

pub use generate::generate_ca;
pub use inspect::{inspect_ca_secret, CaInspection, GenerateReason};
pub(crate) use inspect::data_field;

use crate::bundle::reconcile_bundle;
use crate::config::Options;
use crate::driver::{Reconcile, Requeue};
use crate::pki::{Certificate, PrivateKey};
use crate::renewal::{format_timestamp, issued_at_for, requested_renewal};
use crate::store::{ObjectKey, SecretStore};
use crate::{
    Result, CA_BUNDLE_KEY, CA_LABEL, ISSUED_AT_ANNOTATION, RENEW_HANDLED_AT_ANNOTATION,
    TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY, TLS_SECRET_TYPE,
};

/// Shortest delay between scheduled CA checks
const MIN_RECHECK: Duration = Duration::from_secs(1);

/// CA certificate and key, decoded and in their stored PEM form
#[derive(Debug)]
pub struct CaMaterial {
    /// Parsed certificate
    pub certificate: Certificate,
    /// Parsed private key
    pub private_key: PrivateKey,
    /// PEM certificate as stored in `tls.crt`
    pub cert_pem: Vec<u8>,
    /// PEM private key as stored in `tls.key`
    pub key_pem: Zeroizing<Vec<u8>>,
}

/// What a pass did to the CA Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueOutcome {
    /// Stored material was valid and nothing was written
    Unchanged,
    /// A new CA was generated and written
    Generated(GenerateReason),
    /// The CA was kept but the bundle, labels or annotations were rewritten
    Repaired,
}

/// Summary of a CA pass
#[derive(Clone, Debug)]
pub struct IssueReport {
    /// What happened
    pub outcome: IssueOutcome,
    /// Serial of the CA now in the Secret
    pub serial: String,
    /// When the current CA becomes due for rotation
    pub rotate_at: DateTime<Utc>,
    /// Number of certificates in the trust bundle
    pub bundle_len: usize,
}

/// Reconciles the CA Secret
pub struct CaIssuer {
    store: Arc<dyn SecretStore>,
    options: Arc<Options>,
    key: ObjectKey,
}

impl CaIssuer {
    /// Create an issuer for the Secret named by `options`
    pub fn new(store: Arc<dyn SecretStore>, options: Arc<Options>) -> Self {
        let key = options.ca_key();
        Self {
            store,
            options,
            key,
        }
    }

    /// Run one pass as of `now`
    #[instrument(skip(self), fields(secret = %self.key))]
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<IssueReport> {
        let existing = self.store.get_secret(&self.key).await?;
        let empty = BTreeMap::new();
        let annotations = existing
            .as_ref()
            .and_then(|s| s.metadata.annotations.as_ref())
            .unwrap_or(&empty);

        let (material, outcome, issued_at, handled) =
            match inspect_ca_secret(existing.as_ref(), self.options.rotation_threshold, now) {
                CaInspection::Valid(material) => (
                    material,
                    IssueOutcome::Unchanged,
                    annotations.get(ISSUED_AT_ANNOTATION).cloned(),
                    annotations.get(RENEW_HANDLED_AT_ANNOTATION).cloned(),
                ),
                CaInspection::Regenerate(reason) => {
                    match &reason {
                        GenerateReason::Missing => info!("CA secret not found, generating CA"),
                        GenerateReason::InvalidCertificate(_)
                        | GenerateReason::InvalidPrivateKey(_)
                        | GenerateReason::KeyMismatch(_) => {
                            warn!(reason = %reason, "stored CA material unusable, regenerating")
                        }
                        _ => info!(reason = %reason, "rotating CA"),
                    }
                    let material = generate_ca(&self.options, now)?;
                    let request = requested_renewal(annotations);
                    let issued = issued_at_for(now, request.as_ref().map(|r| r.requested_at));
                    (
                        material,
                        IssueOutcome::Generated(reason),
                        Some(format_timestamp(issued)),
                        request.map(|r| r.raw),
                    )
                }
            };

        let previous_bundle = existing
            .as_ref()
            .and_then(|s| data_field(s, CA_BUNDLE_KEY))
            .unwrap_or_default();
        let reconciled = reconcile_bundle(previous_bundle, &material.certificate, now.timestamp());
        if let Some(err) = &reconciled.fallback {
            warn!(
                error = %err,
                "previous trust bundle undecodable, restarting it from the current CA"
            );
        }
        let bundle_len = reconciled.bundle.matches("-----BEGIN CERTIFICATE-----").count();

        let desired = self.desired_secret(&material, &reconciled.bundle, issued_at, handled);
        let outcome = match (outcome, existing.as_ref()) {
            (IssueOutcome::Unchanged, Some(current)) if owned_fields_match(current, &desired) => {
                debug!(serial = %material.certificate.serial(), "CA secret up to date");
                IssueOutcome::Unchanged
            }
            (outcome, _) => {
                self.store.apply_secret(&desired).await?;
                let outcome = match outcome {
                    IssueOutcome::Unchanged => IssueOutcome::Repaired,
                    other => other,
                };
                info!(
                    serial = %material.certificate.serial(),
                    not_after = material.certificate.not_after(),
                    bundle_len,
                    outcome = ?outcome,
                    "CA secret written"
                );
                outcome
            }
        };

        let rotate_at = DateTime::from_timestamp(
            material
                .certificate
                .rotation_deadline(self.options.rotation_threshold),
            0,
        )
        .unwrap_or(now);

        Ok(IssueReport {
            outcome,
            serial: material.certificate.serial().to_string(),
            rotate_at,
            bundle_len,
        })
    }

    fn desired_secret(
        &self,
        material: &CaMaterial,
        bundle: &str,
        issued_at: Option<String>,
        handled: Option<String>,
    ) -> Secret {
        let annotations: BTreeMap<String, String> = [
            (ISSUED_AT_ANNOTATION, issued_at),
            (RENEW_HANDLED_AT_ANNOTATION, handled),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect();

        Secret {
            metadata: ObjectMeta {
                name: Some(self.key.name.clone()),
                namespace: Some(self.key.namespace.clone()),
                labels: Some(BTreeMap::from([(CA_LABEL.to_string(), "true".to_string())])),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            },
            type_: Some(TLS_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(material.cert_pem.clone())),
                (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(material.key_pem.to_vec())),
                (CA_BUNDLE_KEY.to_string(), ByteString(bundle.as_bytes().to_vec())),
            ])),
            ..Default::default()
        }
    }

    /// Delay until the next scheduled check after a pass at `now`
    fn next_check(&self, report: &IssueReport, now: DateTime<Utc>) -> Duration {
        let until_rotation = (report.rotate_at - now).to_std().unwrap_or(MIN_RECHECK);
        until_rotation
            .max(MIN_RECHECK)
            .min(self.options.resync_interval)
    }
}

#[async_trait]
impl Reconcile for CaIssuer {
    fn name(&self) -> String {
        format!("ca-issuer {}", self.key)
    }

    async fn reconcile(&self) -> Result<Requeue> {
        let now = Utc::now();
        let report = self.reconcile_at(now).await?;
        Ok(Requeue::After(self.next_check(&report, now)))
    }
}

/// Whether every field in `desired` already has that value in `current`
///
/// Fields `desired` does not mention are owned by someone else and ignored.
fn owned_fields_match(current: &Secret, desired: &Secret) -> bool {
    fn contains<V: PartialEq>(
        current: &Option<BTreeMap<String, V>>,
        desired: &Option<BTreeMap<String, V>>,
    ) -> bool {
        let Some(desired) = desired else {
            return true;
        };
        let Some(current) = current else {
            return desired.is_empty();
        };
        desired.iter().all(|(k, v)| current.get(k) == Some(v))
    }

    current.type_ == desired.type_
        && contains(&current.metadata.labels, &desired.metadata.labels)
        && contains(&current.metadata.annotations, &desired.metadata.annotations)
        && contains(&current.data, &desired.data)
}
