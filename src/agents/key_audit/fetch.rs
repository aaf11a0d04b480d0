//! Bounded fetch orchestration
//!
//! Both fetch phases fan out one tokio task per principal and join all of
//! them before returning. Results land at the index of their principal,
//! whatever order the tasks finish in, and no task cancels its siblings.
//!
//! The phases differ in how failures are treated:
//!
//! - **Observed certificates** (public endpoint, bounded by an inflight
//!   semaphore): a failure is logged, the principal is marked bad and its
//!   slot is `None`. The batch never fails.
//! - **Ground truth** (IAM API, bounded by a rate limiter): bad principals
//!   are skipped without an API call. Every other failure is collected and
//!   the whole batch fails with [`AuditError::GroundTruth`].

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rate_limit::RateLimiter;
use super::tracker::BadPrincipalTracker;
use super::types::{AuditError, FetchError, GroundTruthFailure, ServiceAccountCerts, ServiceAccountKeys};

/// Default ceiling on concurrent public certificate requests
pub const DEFAULT_MAX_INFLIGHT: usize = 64;

/// Where the published certificates of a principal come from
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn fetch_certificates(&self, principal: &str) -> Result<ServiceAccountCerts, FetchError>;
}

/// Where the authoritative key list of a principal comes from
#[async_trait]
pub trait GroundTruthSource: Send + Sync {
    async fn list_keys(&self, principal: &str) -> anyhow::Result<ServiceAccountKeys>;
}

/// Spawn `f(item)` for every item and wait for all of them.
///
/// The output is in input order. A task that panics yields a `JoinError` in
/// its slot and does not affect the others; callers decide what a failure
/// means for their phase.
pub async fn parallel_map<T, F, Fut>(items: &[String], mut f: F) -> Vec<Result<T, JoinError>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = items
        .iter()
        .map(|item| tokio::spawn(f(item.clone())))
        .collect();

    join_all(handles).await
}

/// Shared limits and state for the fetch phases of one run
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    inflight: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
    tracker: Arc<BadPrincipalTracker>,
    cancel: CancellationToken,
}

impl FetchOrchestrator {
    pub fn new(
        max_inflight: usize,
        limiter: RateLimiter,
        tracker: Arc<BadPrincipalTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
            limiter: Arc::new(limiter),
            tracker,
            cancel,
        }
    }

    pub fn tracker(&self) -> &BadPrincipalTracker {
        &self.tracker
    }

    /// Fetch the published certificates of every principal.
    ///
    /// Slot `i` is `None` when principal `i` could not be fetched; it is then
    /// also marked bad.
    pub async fn fetch_observed(
        &self,
        source: Arc<dyn CertificateSource>,
        principals: &[String],
    ) -> Vec<Option<ServiceAccountCerts>> {
        info!(principals = principals.len(), "Fetching public certificates");

        let joined = parallel_map(principals, |principal| {
            let this = self.clone();
            let source = Arc::clone(&source);
            async move {
                match this.fetch_certificates(source.as_ref(), &principal).await {
                    Ok(certs) => {
                        debug!(principal = %principal, keys = certs.len(), "Fetched certificates");
                        Some(certs)
                    }
                    Err(e) => {
                        warn!(principal = %principal, error = %e, "Error getting certificates");
                        this.tracker.mark_bad(&principal);
                        None
                    }
                }
            }
        })
        .await;

        principals
            .iter()
            .zip(joined)
            .map(|(principal, result)| match result {
                Ok(certs) => certs,
                Err(e) => {
                    warn!(principal = %principal, error = %e, "Certificate fetch task failed");
                    self.tracker.mark_bad(principal);
                    None
                }
            })
            .collect()
    }

    /// Fetch the authoritative key list of every principal not marked bad.
    ///
    /// Slot `i` is `None` for bad principals. Any failure fails the batch,
    /// but only after every task has finished.
    pub async fn fetch_ground_truth(
        &self,
        source: Arc<dyn GroundTruthSource>,
        principals: &[String],
    ) -> Result<Vec<Option<ServiceAccountKeys>>, AuditError> {
        info!(
            principals = principals.len(),
            skipped = self.tracker.len(),
            "Fetching ground truth from IAM"
        );

        let joined = parallel_map(principals, |principal| {
            let this = self.clone();
            let source = Arc::clone(&source);
            async move { this.list_keys(source.as_ref(), &principal).await }
        })
        .await;

        let mut keys = Vec::with_capacity(principals.len());
        let mut failures = Vec::new();
        for (principal, result) in principals.iter().zip(joined) {
            let error = match result {
                Ok(Ok(found)) => {
                    keys.push(found);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) => e.to_string(),
            };
            keys.push(None);
            failures.push(GroundTruthFailure {
                principal: principal.clone(),
                error,
            });
        }

        if failures.is_empty() {
            Ok(keys)
        } else {
            Err(AuditError::GroundTruth(failures))
        }
    }

    async fn fetch_certificates(
        &self,
        source: &dyn CertificateSource,
        principal: &str,
    ) -> Result<ServiceAccountCerts, FetchError> {
        // Held until the request completes, whatever the outcome
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = self.inflight.acquire() => permit.map_err(|_| FetchError::Cancelled)?,
        };

        source.fetch_certificates(principal).await
    }

    async fn list_keys(
        &self,
        source: &dyn GroundTruthSource,
        principal: &str,
    ) -> anyhow::Result<Option<ServiceAccountKeys>> {
        if self.tracker.is_bad(principal) {
            debug!(principal = %principal, "Skipping bad principal");
            return Ok(None);
        }

        self.limiter
            .wait(&self.cancel)
            .await
            .context("error waiting for IAM rate limiter")?;

        source.list_keys(principal).await.map(Some)
    }
}
