//! IAM Admin API client
//!
//! Lists the authoritative keys of a service account (ground truth) and the
//! service accounts of a project (discovery).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::gcp_auth::GcpSession;
use crate::agents::key_audit::fetch::GroundTruthSource;
use crate::agents::key_audit::types::{GroundTruthKey, ServiceAccountKeys};

const IAM_API_URL: &str = "https://iam.googleapis.com/v1";

/// More system-managed keys than this on one account is unexpected
const MAX_EXPECTED_SYSTEM_MANAGED_KEYS: usize = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListKeysResponse {
    #[serde(default)]
    keys: Vec<ServiceAccountKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountKey {
    name: String,
    #[serde(default)]
    key_origin: String,
    #[serde(default)]
    key_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListServiceAccountsResponse {
    #[serde(default)]
    accounts: Vec<ServiceAccount>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    email: String,
    #[serde(default)]
    disabled: bool,
}

pub struct IamClient {
    session: Arc<GcpSession>,
    base_url: String,
}

impl IamClient {
    pub fn new(session: Arc<GcpSession>) -> Self {
        Self {
            session,
            base_url: IAM_API_URL.to_string(),
        }
    }

    /// Emails of every enabled service account in `project`
    pub async fn list_service_accounts(&self, project: &str) -> Result<Vec<String>> {
        let url = format!("{}/projects/{}/serviceAccounts", self.base_url, project);
        let mut emails = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.session.get(&url).await?;
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request
                .send()
                .await
                .context("Failed to list service accounts")?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("IAM API returned {}: {}", status, body);
            }

            let page: ListServiceAccountsResponse = response
                .json()
                .await
                .context("Invalid service account list response")?;
            emails.extend(collect_enabled(page.accounts));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(project = %project, accounts = emails.len(), "Listed service accounts");
        Ok(emails)
    }
}

#[async_trait]
impl GroundTruthSource for IamClient {
    async fn list_keys(&self, principal: &str) -> Result<ServiceAccountKeys> {
        let url = format!(
            "{}/projects/-/serviceAccounts/{}/keys",
            self.base_url,
            urlencoding::encode(principal)
        );

        let response = self
            .session
            .get(&url)
            .await?
            .send()
            .await
            .context("Failed to list service account keys")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("IAM API returned {}: {}", status, body);
        }

        let body: ListKeysResponse = response
            .json()
            .await
            .context("Invalid key list response")?;
        let keys = collect_keys(body.keys)?;

        let system_managed = keys
            .values()
            .filter(|k| k.key_origin == "GOOGLE_PROVIDED" && k.key_type == "SYSTEM_MANAGED")
            .count();
        if system_managed > MAX_EXPECTED_SYSTEM_MANAGED_KEYS {
            warn!(
                principal = %principal,
                system_managed,
                "More than {} internal keys found. Please file a bug report.",
                MAX_EXPECTED_SYSTEM_MANAGED_KEYS
            );
        }

        Ok(keys)
    }
}

/// The key ID is whatever follows the last `keys/` in the resource name
fn key_id_from_name(name: &str) -> Option<&str> {
    name.rsplit_once("keys/").map(|(_, id)| id)
}

fn collect_keys(keys: Vec<ServiceAccountKey>) -> Result<ServiceAccountKeys> {
    keys.into_iter()
        .map(|key| {
            let key_id = key_id_from_name(&key.name)
                .with_context(|| format!("Unexpected key name: {}", key.name))?
                .to_string();
            Ok((
                key_id.clone(),
                GroundTruthKey {
                    key_id,
                    key_origin: key.key_origin,
                    key_type: key.key_type,
                },
            ))
        })
        .collect()
}

fn collect_enabled(accounts: Vec<ServiceAccount>) -> impl Iterator<Item = String> {
    accounts
        .into_iter()
        .filter(|account| !account.disabled)
        .map(|account| account.email)
}
