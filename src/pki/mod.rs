//! PKI primitives for the self-issued CA
//!
//! This module is the only place that touches certificate and key encodings.
//! Everything above it works with [`Certificate`] and [`PrivateKey`] values.
//!
//! # Wire format
//!
//! - Certificates are `CERTIFICATE` PEM blocks; a trust bundle is their
//!   concatenation
//! - Private keys are read from `PRIVATE KEY` (PKCS#8), `EC PRIVATE KEY`
//!   (SEC1) or `RSA PRIVATE KEY` (PKCS#1) blocks and written back in the form
//!   they were read; freshly generated keys are PKCS#8
//! - All output uses LF line endings
//!
//! # Certificate Rotation
//!
//! A CA is rotated once [`ROTATION_THRESHOLD`] of its lifetime has passed.
//! Older CAs stay in the trust bundle until they expire, which gives every
//! consumer the whole remaining lifetime of the old CA to pick up the new one.

mod cert;
mod key;
mod pool;

pub use cert::{
    decode_certificate, decode_certificate_set, encode_certificate, encode_certificate_set,
    Certificate,
};
pub use key::{
    decode_private_key, encode_private_key, generate_key_pair, public_keys_equal, EcCurve,
    KeyForm, PrivateKey, PublicKey,
};
pub use pool::build_certificate_pool;

/// Default rotation threshold as a fraction of the CA lifetime (80%)
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// PEM label for X.509 certificates
pub(crate) const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

pub(crate) fn pem_encode_config() -> pem::EncodeConfig {
    pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixture builders shared by tests across the crate.

    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
        KeyUsagePurpose,
    };

    use super::{generate_key_pair, Certificate, EcCurve, PrivateKey};

    /// A self-signed CA valid over `[not_before, not_after]` (unix seconds)
    pub fn ca_at(cn: &str, not_before: i64, not_after: i64) -> (Certificate, PrivateKey, KeyPair) {
        let key_pair = generate_key_pair(EcCurve::P256).unwrap();
        let cert = ca_with_key(cn, not_before, not_after, &key_pair);
        let key = PrivateKey::from_key_pair(&key_pair).unwrap();
        (cert, key, key_pair)
    }

    /// A self-signed CA for an existing key
    pub fn ca_with_key(
        cn: &str,
        not_before: i64,
        not_after: i64,
        key_pair: &KeyPair,
    ) -> Certificate {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before).unwrap();
        params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after).unwrap();
        let cert = params.self_signed(key_pair).unwrap();
        Certificate::from_der(cert.der().to_vec()).unwrap()
    }

    /// A CA valid for a day around `now`
    pub fn ca_around(cn: &str, now: i64) -> (Certificate, PrivateKey, KeyPair) {
        ca_at(cn, now - 3600, now + 86_400)
    }
}
