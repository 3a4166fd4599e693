//! Expiry-filtered, de-duplicated certificate pools

use tracing::debug;

use super::{decode_certificate_set, encode_certificate_set, Certificate};
use crate::Result;

/// Merge `new` into the PEM bundle `existing`, dropping expired entries
///
/// Existing members keep their order and `new` is appended unless an
/// identical certificate is already present. A certificate is expired once
/// `not_after <= now`. An empty `existing` is an empty pool; undecodable
/// input is an error and the caller decides how to recover.
pub fn build_certificate_pool(existing: &[u8], new: &Certificate, now: i64) -> Result<String> {
    let mut pool: Vec<Certificate> = Vec::new();

    for cert in decode_certificate_set(existing)? {
        if cert.is_expired_at(now) {
            debug!(
                serial = %cert.serial(),
                not_after = cert.not_after(),
                "dropping expired certificate from pool"
            );
            continue;
        }
        if !pool.contains(&cert) {
            pool.push(cert);
        }
    }

    if !pool.contains(new) {
        pool.push(new.clone());
    }

    Ok(encode_certificate_set(&pool))
}
