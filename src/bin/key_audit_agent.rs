//! Key Audit Agent - Standalone Binary
//!
//! Classifies the public keys of GCP service accounts as system-managed,
//! user-managed, or user-provided, and exits non-zero if any service account
//! has a key that is not system-managed.
//!
//! ## Usage
//!
//! ```bash
//! # Audit a few service accounts
//! key-audit-agent builder@my-project.iam.gserviceaccount.com deployer@my-project.iam.gserviceaccount.com
//!
//! # Every enabled service account in a project, checked against IAM
//! key-audit-agent --project my-project --ground-truth
//!
//! # Every enabled service account in an organization, exporting certificates
//! key-audit-agent --scope organizations/123456789 --quota-project my-project --out-dir ./certs
//!
//! # JSON report
//! key-audit-agent --in service-accounts.txt --verbose --output json
//! ```

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use lornu_key_audit::agents::key_audit::fetch::DEFAULT_MAX_INFLIGHT;
use lornu_key_audit::agents::key_audit::rate_limit::DEFAULT_IAM_READS_PER_MINUTE;
use lornu_key_audit::agents::key_audit::{
    report, AuditConfig, AuditError, AuditOptions, KeyAuditAgent, OutputMode, PrincipalSource,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Exit status when an internal invariant does not hold
const EXIT_INVARIANT_VIOLATION: i32 = 2;

/// Key Audit Agent - Classify GCP service account keys by provenance
#[derive(Parser, Debug)]
#[command(name = "key-audit-agent", version, about)]
#[command(group(ArgGroup::new("source").args(["principals", "input", "project", "scope"])))]
struct Args {
    /// Service account emails to audit
    principals: Vec<String>,

    /// File to read service accounts from, one per line
    #[arg(long = "in", value_name = "FILE")]
    input: Option<PathBuf>,

    /// List every enabled service account in this project
    #[arg(long)]
    project: Option<String>,

    /// Search enabled service accounts with Cloud Asset Inventory under this
    /// scope (e.g. organizations/{ORGANIZATION_NUMBER}, folders/{FOLDER_NUMBER})
    #[arg(long)]
    scope: Option<String>,

    /// Compare every verdict with the IAM API (needs iam.serviceAccountKeys.list)
    #[arg(long, conflicts_with = "verbose")]
    ground_truth: bool,

    /// Print every service account and key, not only flagged ones
    #[arg(long)]
    verbose: bool,

    /// Directory to write observed certificates to as PEM
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Project billed for IAM and Cloud Asset API quota
    #[arg(long, env = "GOOGLE_CLOUD_QUOTA_PROJECT")]
    quota_project: Option<String>,

    /// Maximum concurrent requests to the public certificate endpoint
    #[arg(long, default_value_t = DEFAULT_MAX_INFLIGHT, env = "KEY_AUDIT_MAX_INFLIGHT")]
    max_inflight: usize,

    /// IAM key list requests per minute in ground-truth mode
    #[arg(long, default_value_t = DEFAULT_IAM_READS_PER_MINUTE, env = "KEY_AUDIT_IAM_READS_PER_MINUTE")]
    iam_reads_per_minute: u32,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

impl Args {
    fn mode(&self) -> OutputMode {
        if self.ground_truth {
            OutputMode::GroundTruth
        } else if self.verbose {
            OutputMode::Verbose
        } else {
            OutputMode::Normal
        }
    }

    fn source(&self) -> PrincipalSource {
        if let Some(path) = &self.input {
            PrincipalSource::File(path.clone())
        } else if let Some(project) = &self.project {
            PrincipalSource::Project(project.clone())
        } else if let Some(scope) = &self.scope {
            PrincipalSource::Scope(scope.clone())
        } else {
            PrincipalSource::Explicit(self.principals.clone())
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let mode = args.mode();
    info!(
        mode = ?mode,
        max_inflight = args.max_inflight,
        iam_reads_per_minute = args.iam_reads_per_minute,
        "Starting Key Audit Agent"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling pending requests");
                cancel.cancel();
            }
        }
    });

    let config = AuditConfig {
        max_inflight: args.max_inflight,
        iam_reads_per_minute: args.iam_reads_per_minute,
    };
    let agent = KeyAuditAgent::new(config, args.quota_project.clone())
        .context("Failed to initialize Key Audit Agent")?;

    let principals = match agent.discover(args.source()).await {
        Ok(principals) => principals,
        Err(AuditError::NoPrincipals) => {
            anyhow::bail!(
                "No service accounts specified. Please specify one or more service accounts or use --in, --project or --scope."
            );
        }
        Err(e) => return Err(e.into()),
    };

    if matches!(args.output, OutputFormat::Text) {
        println!("Analyzing {} service accounts", principals.len());
    }

    let mut options = AuditOptions::new(mode);
    if let Some(dir) = &args.out_dir {
        options = options.out_dir(dir);
    }

    let outcome = match agent.audit(principals, &options, cancel).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_invariant_violation() => {
            error!(error = %e, "Aborting");
            eprintln!("fatal: {}", e);
            std::process::exit(EXIT_INVARIANT_VIOLATION);
        }
        Err(e) => return Err(e.into()),
    };

    if !outcome.bad_principals.is_empty() {
        warn!(
            count = outcome.bad_principals.len(),
            "Some service accounts were skipped because their certificates could not be fetched"
        );
    }

    match args.output {
        OutputFormat::Text => {
            print!("{}", report::render_text(&outcome.reports, outcome.mode));
        }
        OutputFormat::Json => {
            println!(
                "{}",
                report::render_json(&outcome.reports, outcome.mode)
                    .context("Failed to serialize report")?
            );
        }
    }

    if outcome.summary.has_bad() {
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_principal_sources_are_exclusive() {
        assert!(Args::try_parse_from(["key-audit-agent", "--project", "p", "--scope", "folders/1"]).is_err());
        assert!(Args::try_parse_from(["key-audit-agent", "a@p.iam.gserviceaccount.com", "--in", "f"]).is_err());

        let args = Args::try_parse_from(["key-audit-agent", "--scope", "organizations/1"]).unwrap();
        assert_eq!(args.source(), PrincipalSource::Scope("organizations/1".to_string()));
    }

    #[test]
    fn test_output_modes() {
        assert!(Args::try_parse_from(["key-audit-agent", "--ground-truth", "--verbose"]).is_err());

        let args = Args::try_parse_from(["key-audit-agent", "--ground-truth", "a@p.iam.gserviceaccount.com"]).unwrap();
        assert_eq!(args.mode(), OutputMode::GroundTruth);
        assert_eq!(args.source(), PrincipalSource::Explicit(vec!["a@p.iam.gserviceaccount.com".to_string()]));

        let args = Args::try_parse_from(["key-audit-agent", "x@p.iam.gserviceaccount.com"]).unwrap();
        assert_eq!(args.mode(), OutputMode::Normal);
        assert_eq!(args.max_inflight, DEFAULT_MAX_INFLIGHT);
        assert_eq!(args.iam_reads_per_minute, DEFAULT_IAM_READS_PER_MINUTE);
    }
}
