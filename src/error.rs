use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Plugin supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Route registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Per-plugin discovery failures. Only `RootUnreadable` aborts a scan.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Plugin root {path} cannot be read: {reason}")]
    RootUnreadable { path: PathBuf, reason: String },

    #[error("Error traversing {path}: {reason}")]
    Traversal { path: PathBuf, reason: String },

    #[error("Malformed manifest {path}: {reason}")]
    MalformedManifest { path: PathBuf, reason: String },

    #[error("No entry point for plugin {plugin}: expected {path}")]
    MissingEntryPoint { plugin: String, path: PathBuf },

    #[error("Plugin id {plugin} at {path} is already taken by another plugin")]
    DuplicatePlugin { plugin: String, path: PathBuf },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Entry point for plugin {plugin} is missing: {path}")]
    BinaryMissing { plugin: String, path: PathBuf },

    #[error("Failed to spawn plugin {plugin}: {reason}")]
    SpawnFailed { plugin: String, reason: String },

    #[error("Plugin port range exhausted")]
    PortsExhausted,

    #[error("Plugin {0} is already supervised")]
    AlreadyStarted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Plugin {plugin} -> route {route} ({method} {path}): route group {group} doesn't exist")]
    UnknownRouteGroup {
        plugin: String,
        route: String,
        method: String,
        path: String,
        group: String,
    },

    #[error("Plugin {plugin} -> route {route} ({method} {path}): unsupported HTTP method")]
    UnknownMethod {
        plugin: String,
        route: String,
        method: String,
        path: String,
    },

    #[error("Plugin {plugin} -> middleware {middleware}: rank {rank} doesn't exist")]
    UnknownRank {
        plugin: String,
        middleware: String,
        rank: String,
    },

    #[error("Plugin {plugin} -> route {route} ({method} {path}): path is already registered")]
    DuplicateRoute {
        plugin: String,
        route: String,
        method: String,
        path: String,
    },

    #[error("Plugin {plugin} -> {target}: invalid upstream address: {reason}")]
    InvalidUpstream {
        plugin: String,
        target: String,
        reason: String,
    },
}

/// Failures talking to a plugin process at request time.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Plugin {plugin} is unreachable: {reason}")]
    Unreachable { plugin: String, reason: String },

    #[error("Plugin {plugin} timed out after {timeout_ms}ms")]
    Timeout { plugin: String, timeout_ms: u64 },

    #[error("Invalid upstream response from plugin {plugin}: {reason}")]
    InvalidResponse { plugin: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("A valid user token is required")]
    MissingUser,

    #[error("A verified device token is required")]
    MissingDevice,

    #[error("Device token is invalid: {0}")]
    InvalidDevice(String),

    #[error("Token has expired")]
    Expired,

    #[error("Token is invalid: {0}")]
    InvalidToken(String),

    #[error("You must have the \"{0}\" permission to access this resource.")]
    Forbidden(String),

    #[error("Failed to issue token: {0}")]
    Issue(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store data is malformed: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] StoreError),

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Setting {name} has invalid value {value:?}: expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;
