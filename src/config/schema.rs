use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Prefix shared by every route group except Root
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Permission name required by the Admin route group
    #[serde(default = "default_admin_permission")]
    pub admin_permission: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginsConfig {
    #[serde(default = "default_plugins_enabled")]
    pub enabled: bool,
    /// Directory tree scanned for plugin manifests
    #[serde(default = "default_plugin_root")]
    pub root_dir: PathBuf,
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    /// Entry point used when a manifest leaves `services.bin` empty
    #[serde(default = "default_entry_point")]
    pub default_entry_point: String,
    #[serde(default = "default_plugin_host")]
    pub host: String,
    #[serde(default = "default_plugin_schema")]
    pub schema: String,
    /// First port handed to a plugin process
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Upper bound on a whole plugin exchange, from connect to the last body byte
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_ms: u64,
    /// Grace period between SIGTERM and kill on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsConfig {
    #[serde(default = "default_settings_refresh")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_permissions_refresh")]
    pub permissions_refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// JSON document backing the settings, user and permission stores
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs are also written to a daily rolling file here
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions
fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_admin_permission() -> String {
    "admin".to_string()
}

fn default_plugins_enabled() -> bool {
    true
}

fn default_plugin_root() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_manifest_name() -> String {
    "manifest.json".to_string()
}

fn default_entry_point() -> String {
    "main".to_string()
}

fn default_plugin_host() -> String {
    "localhost".to_string()
}

fn default_plugin_schema() -> String {
    "http".to_string()
}

fn default_base_port() -> u16 {
    30002
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_proxy_timeout() -> u64 {
    30000
}

fn default_shutdown_grace() -> u64 {
    3000
}

fn default_settings_refresh() -> u64 {
    300
}

fn default_permissions_refresh() -> u64 {
    300
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./cms-store.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            api_prefix: default_api_prefix(),
            admin_permission: default_admin_permission(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: default_plugins_enabled(),
            root_dir: default_plugin_root(),
            manifest_name: default_manifest_name(),
            default_entry_point: default_entry_point(),
            host: default_plugin_host(),
            schema: default_plugin_schema(),
            base_port: default_base_port(),
            connect_timeout_ms: default_connect_timeout(),
            proxy_timeout_ms: default_proxy_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_settings_refresh(),
            permissions_refresh_interval_secs: default_permissions_refresh(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl PluginsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl SettingsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn permissions_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.permissions_refresh_interval_secs)
    }
}
