use crate::error::{AuthError, StoreError};
use crate::settings::spawn_periodic;
use crate::state::Metrics;
use crate::store::{Permission, PermissionStore};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub type PermissionMap = HashMap<String, Permission>;

/// Name -> permission catalog, refreshed wholesale.
///
/// A refresh builds a complete new map and swaps it in with one store, so a
/// reader holding a snapshot sees either the old or the new catalog.
pub struct PermissionCache {
    store: Arc<dyn PermissionStore>,
    cache: ArcSwap<PermissionMap>,
    metrics: Option<Arc<Metrics>>,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self {
            store,
            cache: ArcSwap::from_pointee(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let permissions = match self.store.get_all().await {
            Ok(permissions) => permissions,
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_permission_refresh_failure();
                }
                tracing::error!(error = %e, "Permission refresh failed, keeping previous cache");
                return Err(e);
            }
        };

        let catalog: PermissionMap = permissions
            .into_iter()
            .map(|permission| (permission.name.clone(), permission))
            .collect();
        let count = catalog.len();

        self.cache.store(Arc::new(catalog));
        tracing::debug!(permissions = count, "Refreshed permission cache");
        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<PermissionMap> {
        self.cache.load_full()
    }

    pub fn get(&self, name: &str) -> Option<Permission> {
        self.cache.load().get(name).cloned()
    }

    /// Ok when `user_id` holds the named permission.
    pub async fn is_authorized(&self, permission: &str, user_id: i64) -> Result<(), AuthError> {
        let required = self
            .get(permission)
            .ok_or_else(|| AuthError::Forbidden(permission.to_string()))?;

        let assigned = self
            .store
            .get_user_permission_ids(user_id)
            .await
            .map_err(|e| {
                tracing::error!(user_id, error = %e, "Error getting user permissions");
                AuthError::Forbidden(permission.to_string())
            })?;

        if assigned.contains(&required.id) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(permission.to_string()))
        }
    }

    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        spawn_periodic("permissions", interval, shutdown, move || {
            let cache = self.clone();
            async move { cache.refresh().await }
        })
    }
}
