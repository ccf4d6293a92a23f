use super::{Permission, PermissionStore, SettingsStore, StoreData, User, UserStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Mutable in-process store. `set_unavailable(true)` makes every read fail,
/// which is how tests simulate an outage of the backing database.
#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<StoreData>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: StoreData) -> Self {
        Self {
            data: RwLock::new(data),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_setting(&self, name: impl Into<String>, value: impl Into<String>) {
        self.write().settings.insert(name.into(), value.into());
    }

    pub fn remove_setting(&self, name: &str) {
        self.write().settings.remove(name);
    }

    pub fn add_user(&self, user: User) {
        let mut data = self.write();
        data.users.retain(|u| u.id != user.id);
        data.users.push(user);
    }

    /// Replace the whole permission catalog in one step
    pub fn set_permissions(&self, permissions: Vec<Permission>) {
        self.write().permissions = permissions;
    }

    pub fn grant(&self, user_id: i64, permission_id: i64) {
        self.write()
            .user_permissions
            .entry(user_id)
            .or_default()
            .push(permission_id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreData>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(self.data.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreData> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get_all(&self) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.read()?.settings.clone())
    }
}

#[async_trait]
impl PermissionStore for InMemoryStore {
    async fn get_all(&self) -> Result<Vec<Permission>, StoreError> {
        Ok(self.read()?.permissions.clone())
    }

    async fn get_user_permission_ids(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self.read()?.permission_ids(user_id))
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn get(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.read()?.user(user_id))
    }
}
