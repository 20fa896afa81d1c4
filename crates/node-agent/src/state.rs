//! Local persistence of the allocation table.
//!
//! The table is written as one JSON document after every change. Writes go
//! to a temporary sibling file that is then renamed over the target, so a
//! crash leaves either the old or the new table, never a torn one.

use crate::identity::PodIdentity;
use ipam_core::IpamError;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// One row of the allocation table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    pub identity: PodIdentity,
    pub block_name: String,
    pub address: IpAddr,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    allocations: Vec<AllocationRecord>,
}

/// Allocation table file
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    /// Serializes writers so the last snapshot taken is the last one written
    write_lock: Mutex<()>,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
    
    pub fn path(&self) -> &Path {
        &self.path
    }
    
    /// Reads the table; a missing file is an empty table.
    pub async fn load(&self) -> Result<Vec<AllocationRecord>, IpamError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error("read", &e)),
        };
        let document: StateDocument = serde_json::from_str(&contents).map_err(|e| {
            IpamError::Internal(format!("corrupt state file {}: {}", self.path.display(), e))
        })?;
        Ok(document.allocations)
    }
    
    /// Replaces the table with the one produced by `snapshot`.
    ///
    /// `snapshot` runs while holding the write lock.
    pub async fn save_with(
        &self,
        snapshot: impl FnOnce() -> Vec<AllocationRecord>,
    ) -> Result<(), IpamError> {
        let _guard = self.write_lock.lock().await;
        let mut allocations = snapshot();
        allocations.sort_by(|a, b| a.identity.cmp(&b.identity));
        let contents = serde_json::to_vec_pretty(&StateDocument { allocations })?;
        
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("create directory for", &e))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| self.io_error("write", &e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error("replace", &e))?;
        Ok(())
    }
    
    fn io_error(&self, action: &str, err: &std::io::Error) -> IpamError {
        IpamError::Internal(format!("failed to {} state file {}: {}", action, self.path.display(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("ipamd-state-{}", uuid::Uuid::new_v4()))
            .join("allocations.json")
    }

    fn record(pod: &str, address: &str) -> AllocationRecord {
        AllocationRecord {
            identity: PodIdentity::new("ns1", pod, "c1").unwrap(),
            block_name: "default-0".to_string(),
            address: address.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let file = StateFile::new(temp_path());
        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let path = temp_path();
        let file = StateFile::new(&path);
        let records = vec![record("pod2", "10.1.0.1"), record("pod1", "10.1.0.0")];
        
        file.save_with(|| records.clone()).await.unwrap();
        
        let loaded = StateFile::new(&path).load().await.unwrap();
        assert_eq!(loaded, vec![record("pod1", "10.1.0.0"), record("pod2", "10.1.0.1")]);
        assert!(!path.with_extension("tmp").exists());
        
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        
        let result = StateFile::new(&path).load().await;
        assert!(matches!(result, Err(IpamError::Internal(_))));
        
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
