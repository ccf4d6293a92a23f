use super::{LiveSettings, Settings};
use crate::error::SettingsError;
use crate::state::Metrics;
use crate::store::SettingsStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Reloads the settings store and republishes it as one snapshot
pub struct SettingsRefresher {
    store: Arc<dyn SettingsStore>,
    live: LiveSettings,
    metrics: Option<Arc<Metrics>>,
}

impl SettingsRefresher {
    pub fn new(store: Arc<dyn SettingsStore>, live: LiveSettings) -> Self {
        Self {
            store,
            live,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load the store and build a snapshot without publishing it
    pub async fn load(store: &dyn SettingsStore) -> Result<Settings, SettingsError> {
        let entries = store.get_all().await?;
        Settings::from_entries(entries)
    }

    /// One refresh cycle. On failure the current snapshot stays in effect.
    pub async fn refresh(&self) -> Result<Arc<Settings>, SettingsError> {
        match Self::load(self.store.as_ref()).await {
            Ok(settings) => {
                self.live.publish(settings);
                tracing::debug!("Refreshed settings snapshot");
                Ok(self.live.load())
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_settings_refresh_failure();
                }
                tracing::error!(error = %e, "Settings refresh failed, keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Refresh every `interval` until shutdown is broadcast
    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        spawn_periodic("settings", interval, shutdown, move || {
            let refresher = self.clone();
            async move { refresher.refresh().await }
        })
    }
}

/// Run `tick` on a fixed interval in its own task. The first tick fires one
/// full interval after start; callers load the initial state themselves.
pub fn spawn_periodic<F, Fut, T, E>(
    name: &'static str,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(task = name, interval_secs = interval.as_secs(), "Periodic refresh started");

        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = ticker.tick() => match tick().await {
                    Ok(_) => failures = 0,
                    Err(_) => {
                        // The tick has already logged the cause
                        failures += 1;
                        tracing::debug!(task = name, failures, "Refresh failed, retrying next interval");
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!(task = name, "Periodic refresh stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::settings::{AUTHENTICATION_KEY, USE_TWO_FACTOR};
    use crate::store::{InMemoryStore, MockSettingsStore};
    use std::collections::HashMap;

    fn initial() -> Settings {
        let mut raw = HashMap::new();
        raw.insert(AUTHENTICATION_KEY.to_string(), "initial".to_string());
        Settings::from_entries(raw).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_publishes_new_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        store.set_setting(AUTHENTICATION_KEY, "rotated");
        store.set_setting(USE_TWO_FACTOR, "true");

        let live = LiveSettings::new(initial());
        let refresher = SettingsRefresher::new(store, live.clone());

        refresher.refresh().await.unwrap();
        let snapshot = live.load();
        assert_eq!(snapshot.auth_key, "rotated");
        assert!(snapshot.use_two_factor);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_previous_snapshot() {
        let mut store = MockSettingsStore::new();
        store
            .expect_get_all()
            .returning(|| Err(StoreError::Unavailable("db down".into())));

        let live = LiveSettings::new(initial());
        let refresher = SettingsRefresher::new(Arc::new(store), live.clone());

        assert!(refresher.refresh().await.is_err());
        assert_eq!(live.load().auth_key, "initial");
    }

    #[tokio::test]
    async fn test_invalid_values_never_partially_apply() {
        let store = Arc::new(InMemoryStore::new());
        store.set_setting(AUTHENTICATION_KEY, "new-key");
        store.set_setting(USE_TWO_FACTOR, "maybe");

        let live = LiveSettings::new(initial());
        let refresher = SettingsRefresher::new(store, live.clone());

        assert!(refresher.refresh().await.is_err());
        let snapshot = live.load();
        assert_eq!(snapshot.auth_key, "initial");
        assert!(!snapshot.use_two_factor);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_until_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        store.set_setting(AUTHENTICATION_KEY, "ticked");

        let live = LiveSettings::new(initial());
        let refresher = Arc::new(SettingsRefresher::new(store, live.clone()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = refresher.start(Duration::from_secs(60), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(live.load().auth_key, "initial");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(live.load().auth_key, "ticked");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_ticks_keep_the_task_alive() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ticks = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let counter = ticks.clone();
        let handle = spawn_periodic("failing", Duration::from_secs(10), shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Unavailable("db down".into()))
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!handle.is_finished());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
