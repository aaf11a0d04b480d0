//! Principal discovery
//!
//! Resolves which service accounts to audit: an explicit list, a file with
//! one email per line, every enabled account in a project, or every enabled
//! account under a Cloud Asset Inventory scope.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::types::AuditError;
use crate::tools::asset_inventory::AssetInventoryClient;
use crate::tools::gcp_auth::GcpSession;
use crate::tools::iam::IamClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalSource {
    Explicit(Vec<String>),
    File(PathBuf),
    Project(String),
    Scope(String),
}

/// Directory services able to enumerate service accounts
#[async_trait]
pub trait ServiceAccountDirectory: Send + Sync {
    async fn list_in_project(&self, project: &str) -> Result<Vec<String>>;
    async fn search_in_scope(&self, scope: &str) -> Result<Vec<String>>;
}

/// IAM for project listings, Cloud Asset Inventory for scope searches
pub struct GcpDirectory {
    iam: IamClient,
    assets: AssetInventoryClient,
}

impl GcpDirectory {
    pub fn new(session: Arc<GcpSession>) -> Self {
        Self {
            iam: IamClient::new(Arc::clone(&session)),
            assets: AssetInventoryClient::new(session),
        }
    }
}

#[async_trait]
impl ServiceAccountDirectory for GcpDirectory {
    async fn list_in_project(&self, project: &str) -> Result<Vec<String>> {
        self.iam.list_service_accounts(project).await
    }

    async fn search_in_scope(&self, scope: &str) -> Result<Vec<String>> {
        self.assets.search_service_accounts(scope).await
    }
}

impl PrincipalSource {
    /// Resolve to a non-empty principal list
    pub async fn discover(
        self,
        directory: &dyn ServiceAccountDirectory,
    ) -> Result<Vec<String>, AuditError> {
        let principals = match self {
            PrincipalSource::Explicit(principals) => principals,
            PrincipalSource::File(path) => read_principals_file(&path).map_err(AuditError::Discovery)?,
            PrincipalSource::Project(project) => {
                info!(project = %project, "Listing service accounts in project");
                directory
                    .list_in_project(&project)
                    .await
                    .map_err(AuditError::Discovery)?
            }
            PrincipalSource::Scope(scope) => {
                info!(scope = %scope, "Searching service accounts in scope");
                directory
                    .search_in_scope(&scope)
                    .await
                    .map_err(AuditError::Discovery)?
            }
        };

        if principals.is_empty() {
            return Err(AuditError::NoPrincipals);
        }
        Ok(principals)
    }
}

/// One principal per line; surrounding whitespace and blank lines are ignored
pub fn read_principals_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read service accounts from {:?}", path))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeDirectory {
        calls: Mutex<Vec<String>>,
        accounts: Vec<String>,
    }

    #[async_trait]
    impl ServiceAccountDirectory for FakeDirectory {
        async fn list_in_project(&self, project: &str) -> Result<Vec<String>> {
            self.calls.lock().unwrap().push(format!("project:{}", project));
            Ok(self.accounts.clone())
        }

        async fn search_in_scope(&self, scope: &str) -> Result<Vec<String>> {
            self.calls.lock().unwrap().push(format!("scope:{}", scope));
            if scope.starts_with("organizations/") {
                Ok(self.accounts.clone())
            } else {
                anyhow::bail!("permission denied on {}", scope)
            }
        }
    }

    fn directory() -> FakeDirectory {
        FakeDirectory {
            accounts: vec!["a@p.iam.gserviceaccount.com".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_explicit_list_skips_directory() {
        let dir = directory();
        let principals = PrincipalSource::Explicit(vec!["x@p.iam.gserviceaccount.com".to_string()])
            .discover(&dir)
            .await
            .unwrap();
        assert_eq!(principals, vec!["x@p.iam.gserviceaccount.com"]);
        assert!(dir.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_source_ignores_blank_lines() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("principals.txt");
        std::fs::write(
            &path,
            "a@p.iam.gserviceaccount.com\n\n  b@p.iam.gserviceaccount.com \r\n",
        )
        .unwrap();

        let principals = PrincipalSource::File(path)
            .discover(&directory())
            .await
            .unwrap();
        assert_eq!(
            principals,
            vec!["a@p.iam.gserviceaccount.com", "b@p.iam.gserviceaccount.com"]
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_discovery_error() {
        let err = PrincipalSource::File(PathBuf::from("/nonexistent/principals.txt"))
            .discover(&directory())
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_project_and_scope_dispatch() {
        let dir = directory();
        PrincipalSource::Project("example-project".to_string())
            .discover(&dir)
            .await
            .unwrap();
        PrincipalSource::Scope("organizations/1234".to_string())
            .discover(&dir)
            .await
            .unwrap();

        assert_eq!(
            *dir.calls.lock().unwrap(),
            vec!["project:example-project", "scope:organizations/1234"]
        );
    }

    #[tokio::test]
    async fn test_directory_failure_is_discovery_error() {
        let err = PrincipalSource::Scope("folders/42".to_string())
            .discover(&directory())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("permission denied on folders/42"));
    }

    #[tokio::test]
    async fn test_empty_result_is_rejected() {
        let err = PrincipalSource::Project("empty".to_string())
            .discover(&FakeDirectory::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::NoPrincipals));
    }
}
