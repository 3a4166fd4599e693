//! Validation of stored CA material

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use zeroize::Zeroizing;

use super::CaMaterial;
use crate::pki::{decode_certificate, decode_private_key, public_keys_equal};
use crate::renewal::RenewalState;
use crate::{TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

/// Why a new CA has to be generated
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerateReason {
    /// The CA Secret does not exist
    Missing,
    /// `tls.crt` is absent, undecodable, or not a self-signed CA
    InvalidCertificate(String),
    /// `tls.key` is absent or undecodable
    InvalidPrivateKey(String),
    /// Certificate and key do not belong together
    KeyMismatch(String),
    /// The certificate's notAfter has passed
    Expired,
    /// The rotation threshold of the lifetime has passed
    RotationDue,
    /// An operator requested a renewal that has not been honored yet
    RenewalRequested(String),
}

impl fmt::Display for GenerateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "CA secret missing"),
            Self::InvalidCertificate(why) => write!(f, "invalid certificate: {}", why),
            Self::InvalidPrivateKey(why) => write!(f, "invalid private key: {}", why),
            Self::KeyMismatch(why) => write!(f, "certificate and key mismatch: {}", why),
            Self::Expired => write!(f, "certificate expired"),
            Self::RotationDue => write!(f, "certificate due for rotation"),
            Self::RenewalRequested(at) => write!(f, "renewal requested at {}", at),
        }
    }
}

/// Result of inspecting the stored CA material
#[derive(Debug)]
pub enum CaInspection {
    /// Material can be kept as is
    Valid(CaMaterial),
    /// Material must be replaced
    Regenerate(GenerateReason),
}

/// Decide whether the CA stored in `secret` can be kept at `now`
///
/// Decode and comparison failures become a [`GenerateReason`]; nothing here
/// is an error, because replacing broken material is always possible.
pub fn inspect_ca_secret(
    secret: Option<&Secret>,
    rotation_threshold: f64,
    now: DateTime<Utc>,
) -> CaInspection {
    let Some(secret) = secret else {
        return CaInspection::Regenerate(GenerateReason::Missing);
    };
    let empty = BTreeMap::new();

    let Some(cert_pem) = data_field(secret, TLS_CERT_KEY) else {
        return CaInspection::Regenerate(GenerateReason::InvalidCertificate(format!(
            "{} missing",
            TLS_CERT_KEY
        )));
    };
    let certificate = match decode_certificate(cert_pem) {
        Ok(cert) => cert,
        Err(e) => {
            return CaInspection::Regenerate(GenerateReason::InvalidCertificate(e.to_string()))
        }
    };
    if !certificate.is_ca() || !certificate.is_self_signed() {
        return CaInspection::Regenerate(GenerateReason::InvalidCertificate(
            "not a self-signed CA certificate".to_string(),
        ));
    }

    let Some(key_pem) = data_field(secret, TLS_PRIVATE_KEY_KEY) else {
        return CaInspection::Regenerate(GenerateReason::InvalidPrivateKey(format!(
            "{} missing",
            TLS_PRIVATE_KEY_KEY
        )));
    };
    let private_key = match decode_private_key(key_pem) {
        Ok(key) => key,
        Err(e) => return CaInspection::Regenerate(GenerateReason::InvalidPrivateKey(e.to_string())),
    };

    match public_keys_equal(certificate.public_key(), private_key.public_key()) {
        Ok(true) => {}
        Ok(false) => {
            return CaInspection::Regenerate(GenerateReason::KeyMismatch(
                "public keys differ".to_string(),
            ))
        }
        Err(e) => return CaInspection::Regenerate(GenerateReason::KeyMismatch(e.to_string())),
    }

    let now_secs = now.timestamp();
    if certificate.is_expired_at(now_secs) {
        return CaInspection::Regenerate(GenerateReason::Expired);
    }
    if certificate.lifetime_fraction_at(now_secs) >= rotation_threshold {
        return CaInspection::Regenerate(GenerateReason::RotationDue);
    }

    let annotations = secret.metadata.annotations.as_ref().unwrap_or(&empty);
    if let RenewalState::Pending(request) = RenewalState::from_annotations(annotations) {
        return CaInspection::Regenerate(GenerateReason::RenewalRequested(request.raw));
    }

    CaInspection::Valid(CaMaterial {
        cert_pem: cert_pem.to_vec(),
        key_pem: Zeroizing::new(key_pem.to_vec()),
        certificate,
        private_key,
    })
}

/// Raw bytes of a Secret data entry
pub(crate) fn data_field<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
}
