//! Dynamic Authority - a self-issued CA for in-cluster TLS
//!
//! Dynamic Authority keeps a self-signed certificate authority in a Kubernetes
//! Secret, maintains a rolling trust bundle across CA rotations, serves its own
//! TLS endpoint from that material, and copies the bundle into every resource
//! that asks for it by label.
//!
//! # Architecture
//!
//! Every moving part is a level-triggered reconciler run by the same driver:
//! - The CA issuer validates the CA Secret and regenerates it when the
//!   material is missing, broken, expiring, or a renewal was requested
//! - The serving loader hot-swaps the listener's certificate (runs on every
//!   replica, independent of who writes the CA)
//! - One injector per consumer kind patches the bundle into labeled resources
//!
//! # Modules
//!
//! - [`pki`] - Key generation, PEM codec, public key comparison, certificate pools
//! - [`authority`] - CA validation and generation state machine
//! - [`bundle`] - Trust bundle reconciliation with decode fallback
//! - [`renewal`] - Annotation-driven renewal requests
//! - [`serving`] - Lock-free serving certificate holder for rustls
//! - [`injectable`] - CA-bundle injection into labeled consumers
//! - [`driver`] - Sequential reconcile loop with coalescing and backoff
//! - [`store`] - Resource store abstraction over the Kubernetes API
//! - [`retry`] - Jittered exponential backoff
//! - [`controller`] - Wiring reconcilers to their watches
//! - [`server`] - TLS health endpoints
//! - [`config`] - Runtime options
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod authority;
pub mod bundle;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod injectable;
pub mod pki;
pub mod renewal;
pub mod retry;
pub mod server;
pub mod serving;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Resource Conventions
// =============================================================================
// Label, annotation and data keys shared by the CA Secret and its consumers.

/// Field manager used for every server-side apply this process performs
pub const FIELD_MANAGER: &str = "dynamic-authority";

/// Label marking a Secret as CA material managed by this process
pub const CA_LABEL: &str = "dynamic-authority.io/ca";

/// Label on a consumer naming the namespace of the CA Secret it wants
pub const INJECT_NAMESPACE_LABEL: &str = "dynamic-authority.io/inject-ca-from-secret-namespace";

/// Label on a consumer naming the CA Secret it wants
pub const INJECT_NAME_LABEL: &str = "dynamic-authority.io/inject-ca-from-secret-name";

/// Annotation recording when the current CA was issued (RFC 3339)
pub const ISSUED_AT_ANNOTATION: &str = "dynamic-authority.io/issued-at";

/// Annotation set by an operator to request a CA rotation (RFC 3339)
pub const RENEW_REQUESTED_AT_ANNOTATION: &str = "dynamic-authority.io/renew-requested-at";

/// Annotation recording the last renewal request value that was honored
pub const RENEW_HANDLED_AT_ANNOTATION: &str = "dynamic-authority.io/renew-handled-at";

/// Secret type for TLS material
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Secret data key holding the PEM CA certificate
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Secret data key holding the PEM CA private key
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Secret data key holding the PEM trust bundle
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";
