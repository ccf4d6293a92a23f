//! Live runtime settings.
//!
//! The settings store holds mutable configuration (signing key, token
//! timeouts, two-factor toggle, CORS host). It is parsed into an immutable
//! [`Settings`] snapshot and published through [`LiveSettings`], an
//! `ArcSwap` cell. Readers take a snapshot per request; the refresher
//! replaces the whole snapshot in a single store.

use crate::error::SettingsError;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod refresher;

pub use refresher::{spawn_periodic, SettingsRefresher};

pub const AUTHENTICATION_KEY: &str = "AUTHENTICATION_KEY";
pub const USER_AUTHENTICATION_TIMEOUT: &str = "USER_AUTHENTICATION_TIMEOUT";
pub const DEVICE_AUTHENTICATION_TIMEOUT: &str = "DEVICE_AUTHENTICATION_TIMEOUT";
pub const USE_TWO_FACTOR: &str = "USE_TWO_FACTOR";
pub const CORS_HOST: &str = "CORS_HOST";
pub const REDIRECT_ROOT_URL: &str = "REDIRECT_ROOT_URL";

const DEFAULT_USER_AUTH_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_DEVICE_AUTH_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// One immutable view of the settings store
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub auth_key: String,
    pub user_auth_timeout: Duration,
    pub device_auth_timeout: Duration,
    pub use_two_factor: bool,
    pub cors_host: String,
    pub redirect_root_url: Option<String>,
    /// Every entry as loaded, including ones the kernel doesn't interpret
    pub raw: HashMap<String, String>,
}

impl Settings {
    /// Parse a full settings set. Any invalid value rejects the whole set.
    pub fn from_entries(raw: HashMap<String, String>) -> Result<Self, SettingsError> {
        let auth_key = raw
            .get(AUTHENTICATION_KEY)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or(SettingsError::Missing(AUTHENTICATION_KEY))?
            .to_string();

        let user_auth_timeout = Duration::from_secs(parse_secs(
            &raw,
            USER_AUTHENTICATION_TIMEOUT,
            DEFAULT_USER_AUTH_TIMEOUT_SECS,
        )?);
        let device_auth_timeout = Duration::from_secs(parse_secs(
            &raw,
            DEVICE_AUTHENTICATION_TIMEOUT,
            DEFAULT_DEVICE_AUTH_TIMEOUT_SECS,
        )?);
        let use_two_factor = parse_bool(&raw, USE_TWO_FACTOR, false)?;

        let cors_host = raw
            .get(CORS_HOST)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "*".to_string());

        Ok(Self {
            auth_key,
            user_auth_timeout,
            device_auth_timeout,
            use_two_factor,
            cors_host,
            redirect_root_url: non_empty(&raw, REDIRECT_ROOT_URL),
            raw,
        })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.raw.get(name).map(String::as_str)
    }
}

fn parse_secs(
    raw: &HashMap<String, String>,
    name: &'static str,
    default: u64,
) -> Result<u64, SettingsError> {
    match raw.get(name).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(value) => match value.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(secs),
            _ => Err(SettingsError::Invalid {
                name,
                value: value.to_string(),
                expected: "a positive number of seconds",
            }),
        },
    }
}

fn parse_bool(
    raw: &HashMap<String, String>,
    name: &'static str,
    default: bool,
) -> Result<bool, SettingsError> {
    match raw.get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(value) => match value.as_str() {
            "" => Ok(default),
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(SettingsError::Invalid {
                name,
                value,
                expected: "a boolean",
            }),
        },
    }
}

fn non_empty(raw: &HashMap<String, String>, name: &str) -> Option<String> {
    raw.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Shared handle to the current settings snapshot
#[derive(Clone)]
pub struct LiveSettings {
    inner: Arc<ArcSwap<Settings>>,
}

impl LiveSettings {
    pub fn new(initial: Settings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Current snapshot; stays valid even if a refresh lands meanwhile
    pub fn load(&self) -> Arc<Settings> {
        self.inner.load_full()
    }

    pub fn publish(&self, settings: Settings) {
        self.inner.store(Arc::new(settings));
    }
}
