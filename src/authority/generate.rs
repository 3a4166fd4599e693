//! Self-signed CA generation

use chrono::{DateTime, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa,
    KeyUsagePurpose, SerialNumber,
};
use zeroize::Zeroizing;

use super::CaMaterial;
use crate::config::Options;
use crate::pki::{
    encode_certificate, encode_private_key, generate_key_pair, Certificate, PrivateKey,
};
use crate::{Error, Result};

/// Serial number size in bytes (128 bits)
const SERIAL_BYTES: usize = 16;

/// Generate a new self-signed CA valid from `now` for the configured duration
///
/// A fresh key pair is drawn on every call.
pub fn generate_ca(options: &Options, now: DateTime<Utc>) -> Result<CaMaterial> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(options.common_name.clone()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.serial_number = Some(random_serial());

    let duration = chrono::Duration::from_std(options.effective_ca_duration())
        .map_err(|e| Error::validation(format!("CA duration out of range: {}", e)))?;
    params.not_before = to_offset(now)?;
    let not_after = now
        .checked_add_signed(duration)
        .ok_or_else(|| Error::validation("CA duration overflows the validity window"))?;
    params.not_after = to_offset(not_after)?;

    let key_pair = generate_key_pair(options.key_curve)?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::internal("self-sign CA certificate", e))?;

    let certificate = Certificate::from_der(cert.der().to_vec())?;
    let private_key = PrivateKey::from_key_pair(&key_pair)?;
    let key_pem = encode_private_key(&private_key);

    Ok(CaMaterial {
        cert_pem: encode_certificate(&certificate).into_bytes(),
        key_pem: Zeroizing::new(key_pem.as_bytes().to_vec()),
        certificate,
        private_key,
    })
}

/// Random positive 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Clear the sign bit and keep the value non-zero
    bytes[0] &= 0x7f;
    bytes[0] |= 0x01;
    SerialNumber::from_slice(&bytes)
}

fn to_offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::internal("convert validity timestamp", e))
}
