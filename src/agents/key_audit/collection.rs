//! Batch coordination
//!
//! [`KeyCollection`] owns the principal list and the per-principal results of
//! both fetch phases. Each phase runs once; there is no retry loop.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::fetch::{CertificateSource, FetchOrchestrator, GroundTruthSource, DEFAULT_MAX_INFLIGHT};
use super::persist::PemDirectory;
use super::rate_limit::{RateLimiter, DEFAULT_IAM_READS_PER_MINUTE};
use super::tracker::BadPrincipalTracker;
use super::types::{AuditError, KeyKind, KeyRecord, ServiceAccountCerts, ServiceAccountKeys};

/// Limits applied to one audit run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditConfig {
    /// Concurrent requests to the public certificate endpoint
    pub max_inflight: usize,
    /// IAM `keys.list` calls per minute in ground-truth mode
    pub iam_reads_per_minute: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            iam_reads_per_minute: DEFAULT_IAM_READS_PER_MINUTE,
        }
    }
}

/// Classification of one observed key
#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    #[serde(flatten)]
    pub record: KeyRecord,
    /// Kind reported by IAM. Only set in ground-truth mode, and only when IAM
    /// lists the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_kind: Option<KeyKind>,
}

impl KeyReport {
    /// Anything other than a system-managed key is worth looking at
    pub fn is_flagged(&self) -> bool {
        self.record.kind != KeyKind::GoogleProvidedSystemManaged
    }

    /// Whether the heuristic verdict disagrees with IAM
    pub fn is_mismatch(&self) -> bool {
        self.expected_kind != Some(self.record.kind)
    }
}

/// All observed keys of one principal whose fetch succeeded
#[derive(Debug, Clone, Serialize)]
pub struct PrincipalReport {
    pub principal: String,
    pub keys: Vec<KeyReport>,
}

#[derive(Debug)]
pub struct KeyCollection {
    principals: Vec<String>,
    tracker: Arc<BadPrincipalTracker>,
    observed: Vec<Option<ServiceAccountCerts>>,
    ground_truth: Option<Vec<Option<ServiceAccountKeys>>>,
}

impl KeyCollection {
    pub fn new(principals: Vec<String>) -> Result<Self, AuditError> {
        if principals.is_empty() {
            return Err(AuditError::NoPrincipals);
        }

        Ok(Self {
            principals,
            tracker: Arc::new(BadPrincipalTracker::new()),
            observed: Vec::new(),
            ground_truth: None,
        })
    }

    pub fn bad_principals(&self) -> Vec<String> {
        self.tracker.snapshot()
    }

    pub fn is_ground_truth(&self) -> bool {
        self.ground_truth.is_some()
    }

    /// Run the public fetch, then the ground-truth fetch when a source is given
    pub async fn fetch_keys(
        &mut self,
        config: &AuditConfig,
        certificates: Arc<dyn CertificateSource>,
        ground_truth: Option<Arc<dyn GroundTruthSource>>,
        cancel: CancellationToken,
    ) -> Result<(), AuditError> {
        let fetcher = FetchOrchestrator::new(
            config.max_inflight,
            RateLimiter::per_minute(config.iam_reads_per_minute),
            Arc::clone(&self.tracker),
            cancel,
        );

        // Cancelled fetches are isolated like any other failure
        self.observed = fetcher.fetch_observed(certificates, &self.principals).await;
        info!(
            principals = self.principals.len(),
            bad = self.tracker.len(),
            "Fetched public certificates"
        );

        if let Some(source) = ground_truth {
            self.ground_truth = Some(fetcher.fetch_ground_truth(source, &self.principals).await?);
        }

        Ok(())
    }

    /// Write every observed certificate of every good principal to `dir`
    pub fn write_public_keys_to_dir(&self, dir: &Path) -> Result<usize, AuditError> {
        let sink = PemDirectory::create(dir)?;

        let mut written = 0;
        for (principal, certs) in self.good_principals() {
            for (key_id, cert) in certs {
                sink.write(principal, key_id, cert)?;
                written += 1;
            }
        }

        info!(dir = %dir.display(), certificates = written, "Wrote certificates");
        Ok(written)
    }

    /// Classify every observed key of every good principal.
    ///
    /// Fails only on an invariant violation, such as IAM reporting a key kind
    /// that cannot exist.
    pub fn analyze(&self) -> Result<Vec<PrincipalReport>, AuditError> {
        let mut reports = Vec::new();

        for (i, principal) in self.principals.iter().enumerate() {
            let Some(certs) = self.observed_at(i, principal) else {
                continue;
            };
            let known_keys = self
                .ground_truth
                .as_ref()
                .and_then(|keys| keys.get(i))
                .and_then(Option::as_ref);

            let mut keys = Vec::with_capacity(certs.len());
            for (key_id, cert) in certs {
                let record = KeyRecord::from_certificate(principal, key_id, cert)?;
                let expected_kind = match known_keys.and_then(|known| known.get(key_id)) {
                    Some(key) => Some(key.kind()?),
                    None => None,
                };
                keys.push(KeyReport {
                    record,
                    expected_kind,
                });
            }

            reports.push(PrincipalReport {
                principal: principal.clone(),
                keys,
            });
        }

        Ok(reports)
    }

    fn good_principals(&self) -> impl Iterator<Item = (&String, &ServiceAccountCerts)> + '_ {
        self.principals
            .iter()
            .enumerate()
            .filter_map(|(i, principal)| self.observed_at(i, principal).map(|c| (principal, c)))
    }

    fn observed_at(&self, i: usize, principal: &str) -> Option<&ServiceAccountCerts> {
        if self.tracker.is_bad(principal) {
            return None;
        }
        self.observed.get(i).and_then(Option::as_ref)
    }
}
