//! Certificate persistence
//!
//! Writes every observed certificate as a single PEM `CERTIFICATE` block to
//! `{dir}/{principal}_{keyID}.pem`.

use std::fs;
use std::path::PathBuf;
use tracing::debug;

use super::certificate::Certificate;
use super::types::AuditError;

/// A directory receiving one PEM file per observed key
#[derive(Debug, Clone)]
pub struct PemDirectory {
    dir: PathBuf,
}

impl PemDirectory {
    /// Use `dir`, creating it (and its parents) when missing
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| AuditError::Persist {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, principal: &str, key_id: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.pem", principal, key_id))
    }

    pub fn write(
        &self,
        principal: &str,
        key_id: &str,
        cert: &Certificate,
    ) -> Result<PathBuf, AuditError> {
        let path = self.path_for(principal, key_id);
        fs::write(&path, cert.to_pem()).map_err(|source| AuditError::Persist {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "Wrote certificate");
        Ok(path)
    }
}
