//! Certificate PEM codec

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::{pem_encode_config, PublicKey, CERTIFICATE_PEM_TAG};
use crate::{Error, Result};

/// A parsed X.509 certificate
///
/// Holds the DER bytes plus the fields the CA engine reasons about. Two
/// certificates are equal iff their DER encodings are identical.
#[derive(Clone, Debug)]
pub struct Certificate {
    der: Vec<u8>,
    serial: String,
    subject: String,
    issuer: String,
    /// When the certificate becomes valid (Unix timestamp)
    not_before: i64,
    /// When the certificate expires (Unix timestamp)
    not_after: i64,
    is_ca: bool,
    public_key: PublicKey,
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl Certificate {
    /// Parse a DER-encoded certificate
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (rest, cert) = X509Certificate::from_der(&der)
            .map_err(|e| Error::invalid_data(format!("failed to parse certificate: {}", e)))?;
        if !rest.is_empty() {
            return Err(Error::invalid_data("trailing data after certificate"));
        }

        let spki = cert.public_key();
        let parameter = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|p| p.as_oid().ok())
            .map(|oid| oid.to_id_string());
        let public_key = PublicKey::from_spki_parts(
            &spki.algorithm.algorithm.to_id_string(),
            parameter.as_deref(),
            &spki.subject_public_key.data,
        );

        let serial = cert.raw_serial_as_string();
        let subject = cert.subject().to_string();
        let issuer = cert.issuer().to_string();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        let is_ca = cert.is_ca();

        Ok(Self {
            der,
            serial,
            subject,
            issuer,
            not_before,
            not_after,
            is_ca,
            public_key,
        })
    }

    /// DER encoding
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Serial number as colon-separated hex
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Subject distinguished name (RFC 4514)
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name (RFC 4514)
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Start of the validity window (Unix timestamp)
    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    /// End of the validity window (Unix timestamp)
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// Whether basic constraints mark this certificate as a CA
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Subject public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Whether issuer and subject are the same name
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }

    /// Whether `notAfter` has passed at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.not_after <= now
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Fraction of lifetime elapsed at `now` (0.0 to 1.0+)
    pub fn lifetime_fraction_at(&self, now: i64) -> f64 {
        let lifetime = self.lifetime_secs();
        if lifetime <= 0 {
            return 1.0;
        }
        (now - self.not_before) as f64 / lifetime as f64
    }

    /// The instant `threshold` of the lifetime has elapsed (Unix timestamp)
    pub fn rotation_deadline(&self, threshold: f64) -> i64 {
        self.not_before + (self.lifetime_secs() as f64 * threshold) as i64
    }
}

/// Encode a single certificate as a PEM block
pub fn encode_certificate(cert: &Certificate) -> String {
    let block = pem::Pem::new(CERTIFICATE_PEM_TAG, cert.der.clone());
    pem::encode_config(&block, pem_encode_config())
}

/// Encode certificates as concatenated PEM blocks, in order
pub fn encode_certificate_set(certs: &[Certificate]) -> String {
    certs.iter().map(encode_certificate).collect()
}

/// Decode the first certificate of a PEM blob
pub fn decode_certificate(data: &[u8]) -> Result<Certificate> {
    decode_certificate_set(data)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::invalid_data("error decoding certificate PEM block"))
}

/// Decode a concatenation of zero or more PEM certificates
///
/// An empty or whitespace-only blob is an empty set. Any other blob must
/// contain at least one PEM block, and every block must be a certificate.
pub fn decode_certificate_set(data: &[u8]) -> Result<Vec<Certificate>> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let blocks = pem::parse_many(data)
        .map_err(|e| Error::invalid_data(format!("error decoding certificate PEM block: {}", e)))?;
    if blocks.is_empty() {
        return Err(Error::invalid_data(
            "error decoding certificate PEM block: no PEM data found",
        ));
    }

    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != CERTIFICATE_PEM_TAG {
                return Err(Error::invalid_data(format!(
                    "unexpected PEM block type in certificate set: {}",
                    block.tag()
                )));
            }
            Certificate::from_der(block.into_contents())
        })
        .collect()
}
