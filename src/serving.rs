//! Serving certificate for the process's own TLS listener
//!
//! The listener presents the current CA material itself. [`CertificateHolder`]
//! is read on every TLS handshake and written by [`ServingCertificateLoader`]
//! whenever the CA Secret changes; readers never block and always see a
//! complete certificate and key pair, either the old one or the new one.
//!
//! The loader runs on every replica. Only one process writes the CA, but
//! every process serves TLS.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, instrument, warn};

use crate::authority::data_field;
use crate::driver::{Reconcile, Requeue};
use crate::pki::{decode_certificate_set, decode_private_key};
use crate::store::{ObjectKey, SecretStore};
use crate::{Error, Result, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

/// Lock-free cell holding the certificate the listener presents
#[derive(Default)]
pub struct CertificateHolder {
    current: ArcSwapOption<CertifiedKey>,
}

impl CertificateHolder {
    /// Create an empty holder
    pub fn new() -> Self {
        Self::default()
    }

    /// Current certificate, or [`Error::NotAvailable`] before the first load
    pub fn get(&self) -> Result<Arc<CertifiedKey>> {
        self.current.load_full().ok_or(Error::NotAvailable)
    }

    /// Replace the certificate wholesale
    pub fn set(&self, key: Arc<CertifiedKey>) {
        self.current.store(Some(key));
    }

    /// Whether a certificate has been loaded
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    fn leaf(&self) -> Option<CertificateDer<'static>> {
        self.current
            .load_full()
            .and_then(|k| k.end_entity_cert().ok().map(|c| c.clone().into_owned()))
    }
}

impl fmt::Debug for CertificateHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateHolder")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ResolvesServerCert for CertificateHolder {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.get() {
            Ok(key) => Some(key),
            Err(_) => {
                // No certificate yet: the handshake fails, the process stays up
                debug!("rejecting TLS handshake, no serving certificate loaded");
                None
            }
        }
    }
}

/// Build a rustls certified key from PEM certificate chain and private key
///
/// Fails with [`Error::InvalidData`] when either side does not decode or the
/// key does not belong to the first certificate.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let chain: Vec<CertificateDer<'static>> = decode_certificate_set(cert_pem)?
        .into_iter()
        .map(|c| CertificateDer::from(c.der().to_vec()))
        .collect();
    if chain.is_empty() {
        return Err(Error::invalid_data("no certificate in serving material"));
    }
    let key = decode_private_key(key_pem)?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    CertifiedKey::from_der(chain, key.to_key_der(), &provider)
        .map_err(|e| Error::invalid_data(format!("unusable serving certificate: {}", e)))
}

/// What a load pass did to the holder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The CA Secret does not exist yet
    SourceMissing,
    /// The stored material is unusable; the holder keeps what it had
    Invalid,
    /// The holder already presents this certificate
    Unchanged,
    /// A new certificate was swapped in
    Loaded,
}

/// Keeps a [`CertificateHolder`] in sync with the CA Secret
pub struct ServingCertificateLoader {
    store: Arc<dyn SecretStore>,
    holder: Arc<CertificateHolder>,
    key: ObjectKey,
}

impl ServingCertificateLoader {
    /// Create a loader feeding `holder` from the Secret `key`
    pub fn new(
        store: Arc<dyn SecretStore>,
        holder: Arc<CertificateHolder>,
        key: ObjectKey,
    ) -> Self {
        Self { store, holder, key }
    }

    /// Run one load pass
    #[instrument(skip(self), fields(secret = %self.key))]
    pub async fn load(&self) -> Result<LoadOutcome> {
        let Some(secret) = self.store.get_secret(&self.key).await? else {
            debug!("CA secret not found, serving certificate not ready");
            return Ok(LoadOutcome::SourceMissing);
        };

        let (Some(cert_pem), Some(key_pem)) = (
            data_field(&secret, TLS_CERT_KEY),
            data_field(&secret, TLS_PRIVATE_KEY_KEY),
        ) else {
            warn!("CA secret is missing certificate or key, keeping current serving certificate");
            return Ok(LoadOutcome::Invalid);
        };

        let certified = match certified_key_from_pem(cert_pem, key_pem) {
            Ok(certified) => certified,
            Err(e) => {
                warn!(error = %e, "keeping current serving certificate");
                return Ok(LoadOutcome::Invalid);
            }
        };

        let new_leaf = certified.end_entity_cert().ok().cloned();
        if new_leaf.is_some() && new_leaf == self.holder.leaf() {
            return Ok(LoadOutcome::Unchanged);
        }

        self.holder.set(Arc::new(certified));
        info!("serving certificate loaded");
        Ok(LoadOutcome::Loaded)
    }
}

#[async_trait]
impl Reconcile for ServingCertificateLoader {
    fn name(&self) -> String {
        format!("serving-loader {}", self.key)
    }

    async fn reconcile(&self) -> Result<Requeue> {
        self.load().await?;
        Ok(Requeue::AwaitChange)
    }
}
