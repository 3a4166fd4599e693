//! Runtime options
//!
//! The binary builds an [`Options`] from its command line; tests build one
//! with struct-update syntax over [`Options::default`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::injectable::InjectableKind;
use crate::pki::{EcCurve, ROTATION_THRESHOLD};
use crate::store::ObjectKey;
use crate::{Error, Result};

/// Default CA validity (7 days)
pub const DEFAULT_CA_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Longest accepted CA validity (100 years)
pub const MAX_CA_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Default namespace holding the CA Secret
pub const DEFAULT_NAMESPACE: &str = "dynamic-authority";

/// Default CA Secret name
pub const DEFAULT_CA_SECRET: &str = "dynamic-authority-ca";

/// Default subject common name of generated CAs
pub const DEFAULT_COMMON_NAME: &str = "dynamic-authority-ca";

/// Default interval for level-triggered re-checks without a change event
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default TLS listener port
///
/// Port 9443 is used instead of 443 to avoid requiring root privileges.
pub const DEFAULT_LISTEN_PORT: u16 = 9443;

/// Options shared by every reconciler
#[derive(Clone, Debug)]
pub struct Options {
    /// Namespace of the CA Secret
    pub namespace: String,
    /// Name of the CA Secret
    pub ca_secret: String,
    /// Validity of each generated CA; zero means [`DEFAULT_CA_DURATION`]
    pub ca_duration: Duration,
    /// Curve for generated CA keys
    pub key_curve: EcCurve,
    /// Subject common name of generated CAs
    pub common_name: String,
    /// Fraction of the CA lifetime after which it is rotated
    pub rotation_threshold: f64,
    /// Re-check interval when nothing changes
    pub resync_interval: Duration,
    /// Address of the TLS listener
    pub listen_addr: SocketAddr,
    /// Consumer kinds to inject the bundle into
    pub injectables: Vec<InjectableKind>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ca_secret: DEFAULT_CA_SECRET.to_string(),
            ca_duration: DEFAULT_CA_DURATION,
            key_curve: EcCurve::P384,
            common_name: DEFAULT_COMMON_NAME.to_string(),
            rotation_threshold: ROTATION_THRESHOLD,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            injectables: InjectableKind::ALL.to_vec(),
        }
    }
}

impl Options {
    /// Identity of the CA Secret
    pub fn ca_key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.ca_secret)
    }

    /// CA validity with the zero-means-default rule applied
    pub fn effective_ca_duration(&self) -> Duration {
        if self.ca_duration.is_zero() {
            DEFAULT_CA_DURATION
        } else {
            self.ca_duration
        }
    }

    /// Check that the options describe a runnable configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::validation("namespace must not be empty"));
        }
        if self.ca_secret.is_empty() {
            return Err(Error::validation("CA secret name must not be empty"));
        }
        if self.common_name.is_empty() {
            return Err(Error::validation("common name must not be empty"));
        }
        if !(self.rotation_threshold > 0.0 && self.rotation_threshold <= 1.0) {
            return Err(Error::validation(format!(
                "rotation threshold must be in (0, 1], got {}",
                self.rotation_threshold
            )));
        }
        if self.ca_duration > MAX_CA_DURATION {
            return Err(Error::validation(format!(
                "CA duration must be at most {}s, got {}s",
                MAX_CA_DURATION.as_secs(),
                self.ca_duration.as_secs()
            )));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::validation("resync interval must be positive"));
        }
        // Label values are limited to 63 characters, and consumers reference
        // the CA Secret by label
        for (what, value) in [("namespace", &self.namespace), ("CA secret name", &self.ca_secret)] {
            if value.len() > 63 {
                return Err(Error::validation(format!(
                    "{} '{}' is longer than 63 characters",
                    what, value
                )));
            }
        }
        Ok(())
    }
}
