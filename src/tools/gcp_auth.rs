//! GCP authentication
//!
//! Uses ADC (Application Default Credentials): the GCE metadata server when
//! running on GCP (Workload Identity in GKE), otherwise the gcloud CLI for
//! local development. The token is fetched once per session, on first use.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Header selecting the project billed for quota
pub const QUOTA_PROJECT_HEADER: &str = "x-goog-user-project";

/// Shared HTTP client plus credentials for the privileged GCP APIs
#[derive(Debug)]
pub struct GcpSession {
    http_client: Client,
    quota_project: Option<String>,
    token: OnceCell<String>,
}

impl GcpSession {
    pub fn new(http_client: Client, quota_project: Option<String>) -> Self {
        Self {
            http_client,
            quota_project,
            token: OnceCell::new(),
        }
    }

    pub fn quota_project(&self) -> Option<&str> {
        self.quota_project.as_deref()
    }

    /// Authenticated GET, billed to the quota project when one is set
    pub async fn get(&self, url: &str) -> Result<RequestBuilder> {
        let token = self.access_token().await?;
        let request = self.http_client.get(url).bearer_auth(token);

        Ok(match &self.quota_project {
            Some(project) => request.header(QUOTA_PROJECT_HEADER, project),
            None => request,
        })
    }

    /// ADC token, fetched on first use and then reused
    pub async fn access_token(&self) -> Result<&str> {
        let token = self
            .token
            .get_or_try_init(|| async {
                match self.metadata_token().await {
                    Some(token) => Ok(token),
                    None => gcloud_token().await,
                }
            })
            .await?;
        Ok(token.as_str())
    }

    /// Token of the attached service account, if running on GCP
    async fn metadata_token(&self) -> Option<String> {
        let resp = self
            .http_client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .ok()
            .filter(|resp| resp.status().is_success())?;

        let body: TokenResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "Invalid metadata server token response");
                return None;
            }
        };
        debug!("Using metadata server credentials");
        Some(body.access_token)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Local development fallback: `gcloud auth application-default`
async fn gcloud_token() -> Result<String> {
    debug!("Metadata server unavailable, using gcloud application-default credentials");
    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "application-default", "print-access-token"])
        .output()
        .await
        .context("gcloud CLI not available")?;

    if !output.status.success() {
        anyhow::bail!("gcloud auth failed - run 'gcloud auth application-default login'");
    }

    let token = String::from_utf8(output.stdout).context("gcloud printed a non UTF-8 token")?;
    Ok(token.trim().to_string())
}

/// Build the HTTP client shared by every API client
pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")
}
