//! Annotation-driven CA renewal requests
//!
//! An operator requests a rotation by setting
//! [`RENEW_REQUESTED_AT_ANNOTATION`] on the CA Secret to the current time.
//! The issuer honors the request when the current CA was issued at or before
//! that instant, then records the request value in
//! [`RENEW_HANDLED_AT_ANNOTATION`] and moves [`ISSUED_AT_ANNOTATION`] past it.
//! Malformed timestamps never trigger a rotation.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use crate::{ISSUED_AT_ANNOTATION, RENEW_HANDLED_AT_ANNOTATION, RENEW_REQUESTED_AT_ANNOTATION};

/// Outcome of evaluating the renewal annotations of a CA Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenewalState {
    /// No renewal has been requested
    NotRequested,
    /// A request exists and the current CA predates it
    Pending(RenewalRequest),
    /// The request has already been honored
    Handled,
    /// One of the timestamps does not parse
    Malformed {
        /// Annotation holding the bad value
        annotation: &'static str,
    },
}

/// A renewal request read from the annotations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenewalRequest {
    /// Parsed request time
    pub requested_at: DateTime<Utc>,
    /// Annotation value exactly as written
    pub raw: String,
}

impl RenewalState {
    /// Evaluate the renewal annotations
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let Some(request) = requested_renewal(annotations) else {
            return match annotations.get(RENEW_REQUESTED_AT_ANNOTATION) {
                Some(_) => Self::Malformed {
                    annotation: RENEW_REQUESTED_AT_ANNOTATION,
                },
                None => Self::NotRequested,
            };
        };

        if annotations.get(RENEW_HANDLED_AT_ANNOTATION) == Some(&request.raw) {
            return Self::Handled;
        }

        match annotations.get(ISSUED_AT_ANNOTATION) {
            None => Self::Pending(request),
            Some(raw) => match parse_timestamp(raw) {
                None => Self::Malformed {
                    annotation: ISSUED_AT_ANNOTATION,
                },
                Some(issued_at) if issued_at > request.requested_at => Self::Handled,
                Some(_) => Self::Pending(request),
            },
        }
    }

    /// Whether a rotation must happen because of this state
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Whether the annotations carry a pending, unhandled renewal request
pub fn renewal_pending(annotations: &BTreeMap<String, String>) -> bool {
    RenewalState::from_annotations(annotations).is_pending()
}

/// The parsed renewal request, if one is present and well-formed
pub fn requested_renewal(annotations: &BTreeMap<String, String>) -> Option<RenewalRequest> {
    let raw = annotations.get(RENEW_REQUESTED_AT_ANNOTATION)?;
    let requested_at = parse_timestamp(raw)?;
    Some(RenewalRequest {
        requested_at,
        raw: raw.clone(),
    })
}

/// Issue time to record for a CA generated at `now`
///
/// Always strictly after `requested` so that a request dated in the future
/// cannot keep the renewal pending forever.
pub fn issued_at_for(now: DateTime<Utc>, requested: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match requested {
        Some(requested) if requested >= now => requested + TimeDelta::nanoseconds(1),
        _ => now,
    }
}

/// Render a timestamp the way it is stored in annotations
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
