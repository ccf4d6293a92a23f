use crate::config::Config;
use crate::error::{ConfigError, KernelError, Result};
use crate::plugin::PluginRegistry;
use crate::settings::SettingsRefresher;
use crate::store::{FileStore, PermissionStore};
use crate::web::router::parse_method;
use crate::web::{MiddlewareRank, RouteGroup};
use tracing::{error, info, warn};

/// Validate the configuration, the store and every plugin manifest without
/// starting anything.
pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");
    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    let mut all_ok = true;

    let store = FileStore::new(&config.store.path);
    match SettingsRefresher::load(&store).await {
        Ok(settings) => info!(
            "✓ Settings loaded (two-factor: {}, CORS host: {})",
            settings.use_two_factor, settings.cors_host
        ),
        Err(e) => {
            error!("✗ Settings: {}", e);
            all_ok = false;
        }
    }
    match PermissionStore::get_all(&store).await {
        Ok(permissions) => info!("✓ {} permission(s) loaded", permissions.len()),
        Err(e) => {
            error!("✗ Permissions: {}", e);
            all_ok = false;
        }
    }

    if !config.plugins.enabled {
        info!("Plugins are disabled, skipping discovery");
    } else {
        let discovery = PluginRegistry::new(&config.plugins).discover(&config.plugins.root_dir)?;
        info!(
            "Found {} plugin(s) under {}",
            discovery.plugins.len(),
            config.plugins.root_dir.display()
        );

        for e in &discovery.errors {
            error!("✗ {}", e);
            all_ok = false;
        }

        for plugin in &discovery.plugins {
            info!("\n--- Plugin: {} ({}) ---", plugin.name(), plugin.id());
            info!("Entry point: {}", plugin.entry_point.display());

            for route in plugin.routes() {
                match (route.route.parse::<RouteGroup>(), parse_method(&route.method)) {
                    (Ok(group), Some(method)) => info!("  ✓ {} {} [{}]", method, route.url, group),
                    (Err(_), _) => {
                        warn!(
                            "  ✗ {} {}: route group {} doesn't exist",
                            route.method, route.url, route.route
                        );
                        all_ok = false;
                    }
                    (_, None) => {
                        warn!("  ✗ {} {}: unsupported HTTP method", route.method, route.url);
                        all_ok = false;
                    }
                }
            }

            for middleware in plugin.middleware() {
                match MiddlewareRank::try_from(&middleware.rank) {
                    Ok(rank) => info!("  ✓ middleware {} at rank {}", middleware.name, rank.value()),
                    Err(rank) => {
                        warn!("  ✗ middleware {}: rank {} doesn't exist", middleware.name, rank);
                        all_ok = false;
                    }
                }
            }
        }
    }

    if all_ok {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(KernelError::Config(ConfigError::Validation(
            "One or more checks failed".to_string(),
        )))
    }
}
