//! The kernel's shared state, built once at bootstrap and passed by `Arc`

use crate::auth::{AuthGate, PermissionCache};
use crate::config::Config;
use crate::error::Result;
use crate::plugin::{PluginDefinition, PluginEndpoint, PluginRegistry, ProcessSupervisor, UpstreamClient};
use crate::settings::{LiveSettings, SettingsRefresher};
use crate::store::{PermissionStore, SettingsStore, UserStore};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub mod metrics;

pub use metrics::Metrics;

/// The external stores the kernel reads from
#[derive(Clone)]
pub struct Stores {
    pub settings: Arc<dyn SettingsStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub users: Arc<dyn UserStore>,
}

impl Stores {
    /// Use one backend for all three stores
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: SettingsStore + PermissionStore + UserStore + 'static,
    {
        Self {
            settings: store.clone(),
            permissions: store.clone(),
            users: store,
        }
    }
}

pub struct Kernel {
    pub config: Config,
    pub settings: LiveSettings,
    pub permissions: Arc<PermissionCache>,
    pub gate: Arc<AuthGate>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub upstream: UpstreamClient,
    pub plugins: Vec<Arc<PluginDefinition>>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: broadcast::Sender<()>,
    settings_refresher: Arc<SettingsRefresher>,
}

impl Kernel {
    /// Load settings and permissions, then discover plugins.
    ///
    /// Any failure here is fatal: the kernel does not serve without a
    /// settings snapshot, a permission catalog and a readable plugin root.
    pub async fn bootstrap(config: Config, stores: Stores) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());

        let initial = SettingsRefresher::load(stores.settings.as_ref()).await?;
        let settings = LiveSettings::new(initial);
        let settings_refresher = Arc::new(
            SettingsRefresher::new(stores.settings.clone(), settings.clone())
                .with_metrics(metrics.clone()),
        );
        tracing::info!("Loaded settings");

        let permissions = Arc::new(
            PermissionCache::new(stores.permissions.clone()).with_metrics(metrics.clone()),
        );
        let count = permissions.refresh().await?;
        tracing::info!(permissions = count, "Loaded permissions");

        let gate = Arc::new(AuthGate::new(
            stores.users.clone(),
            settings.clone(),
            permissions.clone(),
        ));

        let plugins = if config.plugins.enabled {
            let discovery = PluginRegistry::new(&config.plugins).discover(&config.plugins.root_dir)?;
            for error in &discovery.errors {
                tracing::warn!("Plugin skipped: {}", error);
            }
            discovery.plugins
        } else {
            tracing::info!("Plugins are disabled");
            Vec::new()
        };

        let supervisor =
            Arc::new(ProcessSupervisor::new(&config.plugins).with_metrics(metrics.clone()));
        let upstream = UpstreamClient::new(&config.plugins)?.with_metrics(metrics.clone());
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Arc::new(Self {
            config,
            settings,
            permissions,
            gate,
            supervisor,
            upstream,
            plugins,
            metrics,
            shutdown_tx,
            settings_refresher,
        }))
    }

    /// Spawn every discovered plugin. Returns the ones now running.
    pub fn start_plugins(&self) -> Vec<PluginEndpoint> {
        let started = self.supervisor.start_all(&self.plugins);
        tracing::info!(
            started = started.len(),
            discovered = self.plugins.len(),
            "Plugins started"
        );
        started
    }

    /// Start the periodic settings and permission refreshers
    pub fn spawn_refreshers(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.settings_refresher
                .clone()
                .start(self.config.settings.refresh_interval(), self.shutdown_tx.subscribe()),
            self.permissions.clone().start(
                self.config.settings.permissions_refresh_interval(),
                self.shutdown_tx.subscribe(),
            ),
        ]
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast shutdown and stop every plugin process
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down kernel");
        let _ = self.shutdown_tx.send(());
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::settings::AUTHENTICATION_KEY;
    use crate::store::{InMemoryStore, Permission};
    use tempfile::TempDir;

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.plugins.root_dir = root.to_path_buf();
        config
    }

    fn store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.set_setting(AUTHENTICATION_KEY, "key");
        store.set_permissions(vec![Permission {
            id: 1,
            name: "admin".into(),
        }]);
        store
    }

    #[tokio::test]
    async fn test_bootstrap_loads_snapshots() {
        let temp = TempDir::new().unwrap();
        let kernel = Kernel::bootstrap(config(temp.path()), Stores::shared(store()))
            .await
            .unwrap();

        assert_eq!(kernel.settings.load().auth_key, "key");
        assert!(kernel.permissions.get("admin").is_some());
        assert!(kernel.plugins.is_empty());
    }

    #[tokio::test]
    async fn test_missing_settings_is_fatal() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let result = Kernel::bootstrap(config(temp.path()), Stores::shared(store)).await;
        assert!(matches!(result, Err(KernelError::Settings(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store_is_fatal() {
        let temp = TempDir::new().unwrap();
        let store = store();
        store.set_unavailable(true);
        let result = Kernel::bootstrap(config(temp.path()), Stores::shared(store)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_plugin_root_is_fatal() {
        let temp = TempDir::new().unwrap();
        let result = Kernel::bootstrap(config(&temp.path().join("nope")), Stores::shared(store())).await;
        assert!(matches!(result, Err(KernelError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_refreshers_stop_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let kernel = Kernel::bootstrap(config(temp.path()), Stores::shared(store()))
            .await
            .unwrap();

        let handles = kernel.spawn_refreshers();
        assert_eq!(handles.len(), 2);
        kernel.shutdown().await;

        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .expect("refresher did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_disabled_plugins_skip_discovery() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp.path().join("nope"));
        config.plugins.enabled = false;
        let kernel = Kernel::bootstrap(config, Stores::shared(store())).await.unwrap();
        assert!(kernel.plugins.is_empty());
    }
}
