use super::{Permission, PermissionStore, SettingsStore, StoreData, User, UserStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Store backed by a single JSON document.
///
/// The document is re-read on every call so that edits on disk become
/// visible on the next refresh tick without restarting the kernel.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<StoreData, StoreError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to read {}: {}", self.path.display(), e))
        })?;

        serde_json::from_str(&raw).map_err(|e| {
            StoreError::Malformed(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl SettingsStore for FileStore {
    async fn get_all(&self) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.load().await?.settings)
    }
}

#[async_trait]
impl PermissionStore for FileStore {
    async fn get_all(&self) -> Result<Vec<Permission>, StoreError> {
        Ok(self.load().await?.permissions)
    }

    async fn get_user_permission_ids(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self.load().await?.permission_ids(user_id))
    }
}

#[async_trait]
impl UserStore for FileStore {
    async fn get(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.load().await?.user(user_id))
    }
}
