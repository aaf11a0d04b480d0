//! Cloud Asset Inventory client
//!
//! Finds every enabled service account under a scope such as
//! `organizations/{ORGANIZATION_NUMBER}`, `folders/{FOLDER_NUMBER}` or
//! `projects/{PROJECT_ID}`. The API requires a quota project when called with
//! user credentials.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::gcp_auth::GcpSession;

const CLOUD_ASSET_API_URL: &str = "https://cloudasset.googleapis.com/v1";

const SERVICE_ACCOUNT_ASSET_TYPE: &str = "iam.googleapis.com/ServiceAccount";

/// Largest page the search API allows
const PAGE_SIZE: &str = "500";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchAllResourcesResponse {
    #[serde(default)]
    results: Vec<ResourceSearchResult>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSearchResult {
    #[serde(default)]
    name: String,
    #[serde(default)]
    additional_attributes: serde_json::Value,
}

pub struct AssetInventoryClient {
    session: Arc<GcpSession>,
    base_url: String,
}

impl AssetInventoryClient {
    pub fn new(session: Arc<GcpSession>) -> Self {
        Self {
            session,
            base_url: CLOUD_ASSET_API_URL.to_string(),
        }
    }

    /// Emails of every enabled service account under `scope`
    pub async fn search_service_accounts(&self, scope: &str) -> Result<Vec<String>> {
        let url = format!("{}/{}:searchAllResources", self.base_url, scope);
        let mut emails = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("assetTypes", SERVICE_ACCOUNT_ASSET_TYPE.to_string()),
                ("query", "state=ENABLED".to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }

            let response = self
                .session
                .get(&url)
                .await?
                .query(&params)
                .send()
                .await
                .context("Failed to search Cloud Asset Inventory")?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Cloud Asset API returned {}: {}", status, body);
            }

            let page: SearchAllResourcesResponse = response
                .json()
                .await
                .context("Invalid Cloud Asset search response")?;
            emails.extend(collect_emails(page.results));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(scope = %scope, accounts = emails.len(), "Searched service accounts");
        Ok(emails)
    }
}

fn collect_emails(results: Vec<ResourceSearchResult>) -> Vec<String> {
    results
        .into_iter()
        .filter_map(|result| match result.additional_attributes["email"].as_str() {
            Some(email) => Some(email.to_string()),
            None => {
                warn!(resource = %result.name, "Service account without email attribute");
                None
            }
        })
        .collect()
}
