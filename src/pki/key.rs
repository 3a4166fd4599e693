//! Key generation, private key PEM codec and public key comparison

use std::fmt;

use aws_lc_rs::signature::{
    EcdsaKeyPair, EcdsaSigningAlgorithm, Ed25519KeyPair, KeyPair as _, RsaKeyPair,
    ECDSA_P256_SHA256_ASN1_SIGNING, ECDSA_P384_SHA384_ASN1_SIGNING,
    ECDSA_P521_SHA512_ASN1_SIGNING,
};
use rcgen::KeyPair;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use zeroize::Zeroizing;

use super::pem_encode_config;
use crate::{Error, Result};

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_CURVE_P521: &str = "1.3.132.0.35";

/// NIST elliptic curves supported for CA keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// P-256 (secp256r1)
    P256,
    /// P-384 (secp384r1)
    P384,
    /// P-521 (secp521r1)
    P521,
}

impl EcCurve {
    /// Curve for a key size in bits
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            256 => Ok(Self::P256),
            384 => Ok(Self::P384),
            521 => Ok(Self::P521),
            other => Err(Error::UnsupportedCurve(other)),
        }
    }

    /// Key size in bits
    pub fn bits(self) -> u32 {
        match self {
            Self::P256 => 256,
            Self::P384 => 384,
            Self::P521 => 521,
        }
    }

    fn from_oid(oid: &str) -> Option<Self> {
        match oid {
            OID_CURVE_P256 => Some(Self::P256),
            OID_CURVE_P384 => Some(Self::P384),
            OID_CURVE_P521 => Some(Self::P521),
            _ => None,
        }
    }

    fn rcgen_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::P521 => &rcgen::PKCS_ECDSA_P521_SHA512,
        }
    }

    fn signing_algorithm(self) -> &'static EcdsaSigningAlgorithm {
        match self {
            Self::P256 => &ECDSA_P256_SHA256_ASN1_SIGNING,
            Self::P384 => &ECDSA_P384_SHA384_ASN1_SIGNING,
            Self::P521 => &ECDSA_P521_SHA512_ASN1_SIGNING,
        }
    }

    const ALL: [EcCurve; 3] = [Self::P256, Self::P384, Self::P521];
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.bits())
    }
}

/// Generate a fresh EC key pair on `curve`
///
/// Every call draws new randomness; callers rotating a CA must never reuse
/// the previous key.
pub fn generate_key_pair(curve: EcCurve) -> Result<KeyPair> {
    KeyPair::generate_for(curve.rcgen_algorithm())
        .map_err(|e| Error::internal(format!("generate {} key", curve), e))
}

/// A public key reduced to what is needed to compare it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKey {
    /// DER `RSAPublicKey`
    Rsa(Vec<u8>),
    /// Uncompressed EC point on a named curve
    Ecdsa {
        /// Named curve
        curve: EcCurve,
        /// SEC1 uncompressed point
        point: Vec<u8>,
    },
    /// Raw 32-byte Ed25519 key
    Ed25519(Vec<u8>),
    /// Any algorithm or curve not listed above
    Unsupported {
        /// Algorithm OID (and curve OID, for EC keys)
        algorithm: String,
    },
}

impl PublicKey {
    /// Build from the algorithm OID, optional parameter OID and raw key bits
    /// of a SubjectPublicKeyInfo
    pub(crate) fn from_spki_parts(algorithm: &str, parameter: Option<&str>, key: &[u8]) -> Self {
        match algorithm {
            OID_RSA_ENCRYPTION => Self::Rsa(key.to_vec()),
            OID_ED25519 => Self::Ed25519(key.to_vec()),
            OID_EC_PUBLIC_KEY => match parameter.and_then(EcCurve::from_oid) {
                Some(curve) => Self::Ecdsa {
                    curve,
                    point: key.to_vec(),
                },
                None => Self::Unsupported {
                    algorithm: format!("{}/{}", algorithm, parameter.unwrap_or("none")),
                },
            },
            other => Self::Unsupported {
                algorithm: other.to_string(),
            },
        }
    }

    /// Short algorithm name for logs
    pub fn algorithm(&self) -> String {
        match self {
            Self::Rsa(_) => "RSA".to_string(),
            Self::Ecdsa { curve, .. } => format!("ECDSA {}", curve),
            Self::Ed25519(_) => "Ed25519".to_string(),
            Self::Unsupported { algorithm } => algorithm.clone(),
        }
    }
}

/// Compare two public keys for cryptographic equality
///
/// Keys of different algorithms are simply unequal; only an unrecognised
/// algorithm on the left-hand side is an error.
pub fn public_keys_equal(a: &PublicKey, b: &PublicKey) -> Result<bool> {
    if let PublicKey::Unsupported { algorithm } = a {
        return Err(Error::UnsupportedKeyType(algorithm.clone()));
    }
    Ok(a == b)
}

/// PEM form a private key was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyForm {
    /// `PRIVATE KEY`
    Pkcs8,
    /// `EC PRIVATE KEY`
    Sec1,
    /// `RSA PRIVATE KEY`
    Pkcs1,
}

impl KeyForm {
    fn pem_tag(self) -> &'static str {
        match self {
            Self::Pkcs8 => "PRIVATE KEY",
            Self::Sec1 => "EC PRIVATE KEY",
            Self::Pkcs1 => "RSA PRIVATE KEY",
        }
    }

    fn from_pem_tag(tag: &str) -> Option<Self> {
        match tag {
            "PRIVATE KEY" => Some(Self::Pkcs8),
            "EC PRIVATE KEY" => Some(Self::Sec1),
            "RSA PRIVATE KEY" => Some(Self::Pkcs1),
            _ => None,
        }
    }
}

/// A validated private key and the public key derived from it
#[derive(Clone)]
pub struct PrivateKey {
    form: KeyForm,
    der: Zeroizing<Vec<u8>>,
    public_key: PublicKey,
}

impl PrivateKey {
    /// Wrap a freshly generated rcgen key pair (PKCS#8)
    pub fn from_key_pair(key_pair: &KeyPair) -> Result<Self> {
        Self::from_der(KeyForm::Pkcs8, Zeroizing::new(key_pair.serialize_der()))
    }

    fn from_der(form: KeyForm, der: Zeroizing<Vec<u8>>) -> Result<Self> {
        let public_key = derive_public_key(form, &der)?;
        Ok(Self {
            form,
            der,
            public_key,
        })
    }

    /// PEM form this key is encoded in
    pub fn form(&self) -> KeyForm {
        self.form
    }

    /// Public half of the key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Key DER in the form rustls expects
    pub fn to_key_der(&self) -> PrivateKeyDer<'static> {
        let der = self.der.to_vec();
        match self.form {
            KeyForm::Pkcs8 => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)),
            KeyForm::Sec1 => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der)),
            KeyForm::Pkcs1 => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der)),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("form", &self.form)
            .field("algorithm", &self.public_key.algorithm())
            .finish_non_exhaustive()
    }
}

fn derive_public_key(form: KeyForm, der: &[u8]) -> Result<PublicKey> {
    match form {
        KeyForm::Pkcs8 => {
            if let Ok(kp) = Ed25519KeyPair::from_pkcs8(der) {
                return Ok(PublicKey::Ed25519(kp.public_key().as_ref().to_vec()));
            }
            for curve in EcCurve::ALL {
                if let Ok(kp) = EcdsaKeyPair::from_pkcs8(curve.signing_algorithm(), der) {
                    return Ok(ecdsa_public_key(curve, &kp));
                }
            }
            RsaKeyPair::from_pkcs8(der)
                .map(|kp| PublicKey::Rsa(kp.public_key().as_ref().to_vec()))
                .map_err(|e| {
                    Error::invalid_data(format!("error parsing pkcs#8 private key: {}", e))
                })
        }
        KeyForm::Sec1 => EcCurve::ALL
            .into_iter()
            .find_map(|curve| {
                EcdsaKeyPair::from_private_key_der(curve.signing_algorithm(), der)
                    .ok()
                    .map(|kp| ecdsa_public_key(curve, &kp))
            })
            .ok_or_else(|| Error::invalid_data("error parsing ecdsa private key")),
        KeyForm::Pkcs1 => RsaKeyPair::from_der(der)
            .map(|kp| PublicKey::Rsa(kp.public_key().as_ref().to_vec()))
            .map_err(|e| Error::invalid_data(format!("error parsing rsa private key: {}", e))),
    }
}

fn ecdsa_public_key(curve: EcCurve, kp: &EcdsaKeyPair) -> PublicKey {
    PublicKey::Ecdsa {
        curve,
        point: kp.public_key().as_ref().to_vec(),
    }
}

/// Encode a private key as a single PEM block in the form it was read
pub fn encode_private_key(key: &PrivateKey) -> Zeroizing<String> {
    let block = pem::Pem::new(key.form.pem_tag(), key.der.to_vec());
    Zeroizing::new(pem::encode_config(&block, pem_encode_config()))
}

/// Decode the first PEM block of `data` as a private key
///
/// Accepts PKCS#8, SEC1 and PKCS#1 blocks holding RSA, ECDSA (P-256/384/521)
/// or Ed25519 keys. The key contents are validated, not just unwrapped.
pub fn decode_private_key(data: &[u8]) -> Result<PrivateKey> {
    let block = pem::parse(data)
        .map_err(|e| Error::invalid_data(format!("error decoding private key PEM block: {}", e)))?;
    let form = KeyForm::from_pem_tag(block.tag()).ok_or_else(|| {
        Error::invalid_data(format!("unknown private key type: {}", block.tag()))
    })?;
    PrivateKey::from_der(form, Zeroizing::new(block.into_contents()))
}
