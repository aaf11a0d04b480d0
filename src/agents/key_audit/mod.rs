//! Service Account Key Audit Agent
//!
//! Classifies every public key published for a set of GCP service accounts
//! as one of three kinds, without privileged access:
//!
//! - `GOOGLE_PROVIDED/SYSTEM_MANAGED`: internal keys the platform rotates itself
//! - `GOOGLE_PROVIDED/USER_MANAGED`: keys created and downloaded through IAM
//! - `USER_PROVIDED/USER_MANAGED`: keys uploaded by someone
//!
//! Each certificate is inspected by independent heuristics ([`signals`]); the
//! most suspicious vote wins ([`precedence`]). Ground-truth mode compares the
//! verdicts with the IAM API, which needs `iam.serviceAccountKeys.list`.
//!
//! ## Features
//!
//! - Bounded concurrency against the public x509 endpoint (64 inflight)
//! - Rate-limited IAM reads (5500/minute) in ground-truth mode
//! - A principal whose certificates cannot be fetched is skipped, not fatal
//! - Optional PEM export of every observed certificate
//!
//! ## Example Usage
//!
//! ```ignore
//! use lornu_key_audit::agents::key_audit::{AuditConfig, AuditOptions, KeyAuditAgent, OutputMode, PrincipalSource};
//! use tokio_util::sync::CancellationToken;
//!
//! let agent = KeyAuditAgent::new(AuditConfig::default(), None)?;
//! let principals = agent
//!     .discover(PrincipalSource::Project("example-project".into()))
//!     .await?;
//!
//! let outcome = agent
//!     .audit(principals, &AuditOptions::new(OutputMode::Normal), CancellationToken::new())
//!     .await?;
//! println!("{}", outcome.summary);
//! ```

pub mod certificate;
pub mod collection;
pub mod discovery;
pub mod fetch;
pub mod persist;
pub mod precedence;
pub mod rate_limit;
pub mod report;
pub mod signals;
pub mod tracker;
pub mod types;

pub use collection::{AuditConfig, KeyCollection, KeyReport, PrincipalReport};
pub use discovery::PrincipalSource;
pub use report::{OutputMode, Summary};
pub use types::{AuditError, FetchError, KeyKind, KeyRecord, Signal};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::tools::gcp_auth::{self, GcpSession};
use crate::tools::iam::IamClient;
use crate::tools::x509_metadata::X509MetadataClient;
use discovery::GcpDirectory;
use fetch::GroundTruthSource;

/// Per-run options
#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub mode: OutputMode,
    /// Write every observed certificate here as PEM
    pub out_dir: Option<PathBuf>,
}

impl AuditOptions {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            out_dir: None,
        }
    }

    pub fn out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }
}

/// Result of one audit run
#[derive(Debug)]
pub struct AuditOutcome {
    pub mode: OutputMode,
    pub reports: Vec<PrincipalReport>,
    /// Principals whose certificates could not be fetched
    pub bad_principals: Vec<String>,
    pub summary: Summary,
}

/// Key Audit Agent
pub struct KeyAuditAgent {
    config: AuditConfig,
    session: Arc<GcpSession>,
    certificates: Arc<X509MetadataClient>,
}

impl KeyAuditAgent {
    /// Create a new agent. Credentials are only acquired once a privileged
    /// API is called.
    pub fn new(config: AuditConfig, quota_project: Option<String>) -> Result<Self> {
        let http_client = gcp_auth::http_client()?;

        Ok(Self {
            config,
            session: Arc::new(GcpSession::new(http_client.clone(), quota_project)),
            certificates: Arc::new(X509MetadataClient::new(http_client)),
        })
    }

    /// Resolve the principals to audit
    pub async fn discover(&self, source: PrincipalSource) -> Result<Vec<String>, AuditError> {
        let directory = GcpDirectory::new(Arc::clone(&self.session));
        source.discover(&directory).await
    }

    /// Fetch, optionally verify and export, then classify every key
    pub async fn audit(
        &self,
        principals: Vec<String>,
        options: &AuditOptions,
        cancel: CancellationToken,
    ) -> Result<AuditOutcome, AuditError> {
        info!(
            principals = principals.len(),
            mode = ?options.mode,
            "Starting key audit"
        );

        let ground_truth = (options.mode == OutputMode::GroundTruth).then(|| {
            Arc::new(IamClient::new(Arc::clone(&self.session))) as Arc<dyn GroundTruthSource>
        });

        let mut collection = KeyCollection::new(principals)?;
        collection
            .fetch_keys(&self.config, self.certificates.clone(), ground_truth, cancel)
            .await?;

        if let Some(dir) = &options.out_dir {
            collection.write_public_keys_to_dir(dir)?;
        }

        let reports = collection.analyze()?;
        let summary = report::summarize(&reports, options.mode);

        info!(good = summary.good, bad = summary.bad, "Key audit complete");

        Ok(AuditOutcome {
            mode: options.mode,
            reports,
            bad_principals: collection.bad_principals(),
            summary,
        })
    }
}
