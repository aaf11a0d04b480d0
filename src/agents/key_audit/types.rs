//! Types for service account key provenance classification
//!
//! Key kinds, heuristic signals, resolved key records and the errors raised
//! while fetching and classifying keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use super::certificate::{Certificate, CertificateError};

/// Certificates published for one principal, keyed by key ID
pub type ServiceAccountCerts = BTreeMap<String, Certificate>;

/// Authoritative keys returned by the IAM API for one principal, keyed by key ID
pub type ServiceAccountKeys = BTreeMap<String, GroundTruthKey>;

/// Combined key origin and key type
///
/// The IAM API reports origin and management separately. Only three of the
/// four combinations can exist, so they are modelled as one closed "kind".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    #[serde(rename = "USER_PROVIDED/USER_MANAGED")]
    UserProvidedUserManaged,
    #[serde(rename = "GOOGLE_PROVIDED/USER_MANAGED")]
    GoogleProvidedUserManaged,
    #[serde(rename = "GOOGLE_PROVIDED/SYSTEM_MANAGED")]
    GoogleProvidedSystemManaged,
}

impl KeyKind {
    /// Most suspicious first. Signals for earlier kinds win over later ones.
    pub const PRECEDENCE: [KeyKind; 3] = [
        KeyKind::UserProvidedUserManaged,
        KeyKind::GoogleProvidedUserManaged,
        KeyKind::GoogleProvidedSystemManaged,
    ];

    /// Position in [`KeyKind::PRECEDENCE`]; lower ranks take precedence
    pub fn precedence_rank(self) -> usize {
        match self {
            KeyKind::UserProvidedUserManaged => 0,
            KeyKind::GoogleProvidedUserManaged => 1,
            KeyKind::GoogleProvidedSystemManaged => 2,
        }
    }

    /// Whether a signal for `self` overrides a current verdict of `other`
    pub fn outranks(self, other: KeyKind) -> bool {
        self.precedence_rank() < other.precedence_rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::UserProvidedUserManaged => "USER_PROVIDED/USER_MANAGED",
            KeyKind::GoogleProvidedUserManaged => "GOOGLE_PROVIDED/USER_MANAGED",
            KeyKind::GoogleProvidedSystemManaged => "GOOGLE_PROVIDED/SYSTEM_MANAGED",
        }
    }

    /// Build a kind from the raw `keyOrigin` / `keyType` pair of the IAM API.
    ///
    /// `USER_PROVIDED` + `SYSTEM_MANAGED` cannot exist on the platform, so
    /// seeing it (or any unknown value) means our model of the API is broken.
    pub fn from_origin_and_type(key_origin: &str, key_type: &str) -> Result<Self, AuditError> {
        match (key_origin, key_type) {
            ("USER_PROVIDED", "USER_MANAGED") => Ok(KeyKind::UserProvidedUserManaged),
            ("GOOGLE_PROVIDED", "USER_MANAGED") => Ok(KeyKind::GoogleProvidedUserManaged),
            ("GOOGLE_PROVIDED", "SYSTEM_MANAGED") => Ok(KeyKind::GoogleProvidedSystemManaged),
            _ => Err(AuditError::InvariantViolation(format!(
                "invalid key type and origin combination: {}/{}",
                key_origin, key_type
            ))),
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One heuristic's vote for a kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: KeyKind,
    pub explanation: String,
}

impl Signal {
    pub fn new(kind: KeyKind, explanation: impl Into<String>) -> Self {
        Self {
            kind,
            explanation: explanation.into(),
        }
    }
}

/// A certificate's resolved kind together with every signal that led to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Key ID as published by the certificate endpoint
    pub key_id: String,
    /// Certificate serial number (decimal), used for display only
    pub serial_number: String,
    /// Highest-precedence kind among `signals`
    pub kind: KeyKind,
    pub signals: Vec<Signal>,
}

/// A key as reported by the IAM API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthKey {
    pub key_id: String,
    pub key_origin: String,
    pub key_type: String,
}

impl GroundTruthKey {
    pub fn kind(&self) -> Result<KeyKind, AuditError> {
        KeyKind::from_origin_and_type(&self.key_origin, &self.key_type)
    }
}

/// Errors from fetching one principal's public certificates
///
/// These never abort a batch: the principal is marked bad and skipped.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("service account not found. Does it exist and is it enabled?")]
    NotFound,

    #[error("unexpected status code: {0}")]
    BadStatus(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response body: {0}")]
    InvalidBody(String),

    #[error("key {key_id}: {source}")]
    Certificate {
        key_id: String,
        #[source]
        source: CertificateError,
    },

    #[error("fetch cancelled")]
    Cancelled,
}

/// A ground-truth lookup that failed for one principal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthFailure {
    pub principal: String,
    pub error: String,
}

/// Errors that abort an audit run
#[derive(Debug, Error)]
pub enum AuditError {
    /// One or more ground-truth lookups failed; every failure is collected.
    #[error("error getting keys from GCP API: {}", format_failures(.0))]
    GroundTruth(Vec<GroundTruthFailure>),

    /// A programming invariant did not hold. Never retried.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("failed to list service accounts: {0:#}")]
    Discovery(anyhow::Error),

    #[error("no service accounts to audit")]
    NoPrincipals,

    #[error("failed to write {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AuditError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, AuditError::InvariantViolation(_))
    }
}

fn format_failures(failures: &[GroundTruthFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.principal, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}
