//! Interfaces to the external stores the kernel depends on.
//!
//! Persistence of users, settings and permissions lives outside the kernel.
//! The kernel only reads through these traits; `InMemoryStore` and
//! `FileStore` are provided for tests and single-node deployments.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Public view of a user, safe to hand back to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDisplay {
    pub id: i64,
    pub full_name: String,
    pub email: String,
}

fn default_enabled() -> bool {
    true
}

impl User {
    pub fn display(&self) -> UserDisplay {
        UserDisplay {
            id: self.id,
            full_name: self.full_name.clone(),
            email: self.email.clone(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Every setting as name -> raw value
    async fn get_all(&self) -> Result<HashMap<String, String>, StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Permission>, StoreError>;

    async fn get_user_permission_ids(&self, user_id: i64) -> Result<Vec<i64>, StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, user_id: i64) -> Result<Option<User>, StoreError>;
}

/// Serialized shape shared by the in-memory and file-backed stores
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreData {
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub user_permissions: HashMap<i64, Vec<i64>>,
}

impl StoreData {
    pub(crate) fn user(&self, user_id: i64) -> Option<User> {
        self.users.iter().find(|u| u.id == user_id).cloned()
    }

    pub(crate) fn permission_ids(&self, user_id: i64) -> Vec<i64> {
        self.user_permissions
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}
