use super::permissions::PermissionCache;
use super::token;
use crate::error::AuthError;
use crate::settings::{LiveSettings, Settings};
use crate::store::{User, UserStore};
use std::sync::Arc;
use warp::http::HeaderMap;

pub const AUTH_TOKEN_HEADER: &str = "X-AUTH-TOKEN";
pub const DEVICE_TOKEN_HEADER: &str = "X-DEVICE-TOKEN";

/// Token checks behind the route-group policies.
///
/// Every check reads the settings snapshot current at call time, so a rotated
/// signing key or a toggled two-factor flag applies to the next request.
pub struct AuthGate {
    users: Arc<dyn UserStore>,
    settings: LiveSettings,
    permissions: Arc<PermissionCache>,
}

impl AuthGate {
    pub fn new(
        users: Arc<dyn UserStore>,
        settings: LiveSettings,
        permissions: Arc<PermissionCache>,
    ) -> Self {
        Self {
            users,
            settings,
            permissions,
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load()
    }

    pub fn permissions(&self) -> &Arc<PermissionCache> {
        &self.permissions
    }

    /// Resolve the session token into an enabled user.
    ///
    /// `Ok(None)` when no token is presented. A presented token that fails
    /// verification, or names an unknown or disabled user, is an error.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<User>, AuthError> {
        let Some(raw) = header_value(headers, AUTH_TOKEN_HEADER) else {
            return Ok(None);
        };

        let settings = self.settings.load();
        let claims = token::verify(raw, &settings.auth_key)?;

        match self.users.get(claims.user_id).await {
            Ok(Some(user)) if user.enabled => Ok(Some(user)),
            Ok(Some(_)) => Err(AuthError::InvalidToken("user is disabled".into())),
            Ok(None) => Err(AuthError::InvalidToken("unknown user".into())),
            Err(e) => {
                tracing::error!(user_id = claims.user_id, error = %e, "User lookup failed");
                Err(AuthError::InvalidToken("user lookup failed".into()))
            }
        }
    }

    /// Device check for the authenticated policy. Only enforced while
    /// two-factor authentication is switched on.
    pub fn require_device(&self, headers: &HeaderMap, user: &User) -> Result<(), AuthError> {
        let settings = self.settings.load();
        if !settings.use_two_factor {
            return Ok(());
        }

        let raw = header_value(headers, DEVICE_TOKEN_HEADER).ok_or(AuthError::MissingDevice)?;
        let claims = token::verify(raw, &settings.auth_key).map_err(|e| match e {
            AuthError::Expired => AuthError::InvalidDevice("device token has expired".into()),
            other => AuthError::InvalidDevice(other.to_string()),
        })?;

        if claims.user_id != user.id {
            return Err(AuthError::InvalidDevice(
                "device token belongs to another user".into(),
            ));
        }
        Ok(())
    }

    pub async fn require_permission(&self, permission: &str, user: &User) -> Result<(), AuthError> {
        self.permissions.is_authorized(permission, user.id).await
    }

    pub fn issue_session_token(&self, user_id: i64) -> Result<String, AuthError> {
        let settings = self.settings.load();
        token::issue(user_id, &settings.auth_key, settings.user_auth_timeout)
    }

    pub fn issue_device_token(&self, user_id: i64) -> Result<String, AuthError> {
        let settings = self.settings.load();
        token::issue(user_id, &settings.auth_key, settings.device_auth_timeout)
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
