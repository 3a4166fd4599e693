//! Trust bundle reconciliation
//!
//! Wraps [`build_certificate_pool`] with the recovery policy for a previous
//! bundle that no longer decodes: rather than failing the whole CA pass, the
//! bundle restarts from the current certificate alone and the decode error is
//! handed back so the caller can log it.

use crate::pki::{build_certificate_pool, encode_certificate, Certificate};
use crate::Error;

/// Result of merging a certificate into the previous bundle
#[derive(Debug)]
pub struct BundleReconciliation {
    /// PEM bundle to persist and inject
    pub bundle: String,
    /// Why the previous bundle was discarded, if it was
    pub fallback: Option<Error>,
}

impl BundleReconciliation {
    /// Whether the previous bundle was discarded
    pub fn fell_back(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Merge `current` into `previous`, dropping members expired at `now`
pub fn reconcile_bundle(previous: &[u8], current: &Certificate, now: i64) -> BundleReconciliation {
    match build_certificate_pool(previous, current, now) {
        Ok(bundle) => BundleReconciliation {
            bundle,
            fallback: None,
        },
        Err(err) => BundleReconciliation {
            bundle: encode_certificate(current),
            fallback: Some(err),
        },
    }
}
