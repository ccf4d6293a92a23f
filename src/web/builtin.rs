//! Kernel middleware stages

use super::context::{context, route_match, update_context};
use super::pipeline::{HttpRequest, HttpResponse, Middleware, Next};
use super::response;
use super::router::{GroupPolicy, Router};
use crate::auth::AuthGate;
use crate::error::AuthError;
use crate::plugin::proxy::REQUEST_ID_HEADER;
use crate::settings::LiveSettings;
use crate::state::Metrics;
use async_trait::async_trait;
use chrono::FixedOffset;
use std::sync::Arc;
use tracing::Instrument;
use warp::http::header::{self, HeaderValue};
use warp::http::{Method, Response, StatusCode};
use warp::hyper::Body;

pub const TIMEZONE_HEADER: &str = "X-Timezone";

/// Tags each request with an id, reusing a sane incoming `X-Request-Id`
pub struct RequestIdMiddleware;

fn valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[async_trait]
impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        "request-id"
    }

    async fn handle(&self, mut req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| valid_request_id(v))
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        update_context(&mut req, |ctx| ctx.request_id = Some(id.clone()));

        let span = tracing::info_span!(
            "request",
            request_id = %id,
            method = %req.method(),
            path = %req.uri().path()
        );
        let mut response = next.run(req).instrument(span).await;

        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

/// CORS headers from the current settings; preflight requests stop here
pub struct CorsMiddleware {
    settings: LiveSettings,
}

impl CorsMiddleware {
    pub fn new(settings: LiveSettings) -> Self {
        Self { settings }
    }

    fn apply(&self, response: &mut HttpResponse) {
        let settings = self.settings.load();
        let headers = response.headers_mut();
        if let Ok(origin) = HeaderValue::from_str(&settings.cors_host) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(
                "Origin, Authorization, Content-Type, X-AUTH-TOKEN, X-DEVICE-TOKEN, X-Timezone, X-Request-Id",
            ),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("X-AUTH-TOKEN, X-DEVICE-TOKEN, X-Request-Id"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    async fn handle(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let mut response = if req.method() == Method::OPTIONS {
            let mut preflight = Response::new(Body::empty());
            *preflight.status_mut() = StatusCode::OK;
            preflight
        } else {
            next.run(req).await
        };
        self.apply(&mut response);
        response
    }
}

/// Parse `Z`, `UTC`, `+02`, `+02:00` or `-0530`
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.chars().next()? {
        '+' => (1, &raw[1..]),
        '-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Records the caller's UTC offset from `X-Timezone`; UTC otherwise
pub struct TimezoneMiddleware;

#[async_trait]
impl Middleware for TimezoneMiddleware {
    fn name(&self) -> &str {
        "timezone"
    }

    async fn handle(&self, mut req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let offset = req
            .headers()
            .get(TIMEZONE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_utc_offset);

        if let Some(offset) = offset {
            update_context(&mut req, |ctx| ctx.utc_offset = offset);
        }
        next.run(req).await
    }
}

/// Attaches the user named by a valid session token. Never rejects: the
/// route-group policy decides whether a user is needed.
pub struct AuthenticationMiddleware {
    gate: Arc<AuthGate>,
}

impl AuthenticationMiddleware {
    pub fn new(gate: Arc<AuthGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Middleware for AuthenticationMiddleware {
    fn name(&self) -> &str {
        "authentication"
    }

    async fn handle(&self, mut req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let outcome = self.gate.authenticate(req.headers()).await;
        if let Err(e) = &outcome {
            tracing::debug!(error = %e, "Session token not accepted");
        }

        update_context(&mut req, |ctx| match outcome {
            Ok(user) => ctx.user = user,
            Err(e) => {
                ctx.user = None;
                ctx.auth_failure = Some(e);
            }
        });
        next.run(req).await
    }
}

/// Resolves the route and enforces its group's policy
pub struct RouteGroupMiddleware {
    router: Arc<Router>,
    gate: Arc<AuthGate>,
    admin_permission: String,
    metrics: Option<Arc<Metrics>>,
}

impl RouteGroupMiddleware {
    pub fn new(router: Arc<Router>, gate: Arc<AuthGate>, admin_permission: impl Into<String>) -> Self {
        Self {
            router,
            gate,
            admin_permission: admin_permission.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn enforce(&self, policy: GroupPolicy, req: &HttpRequest) -> Result<(), AuthError> {
        if policy == GroupPolicy::Open {
            return Ok(());
        }

        let ctx = context(req);
        let user = match ctx.and_then(|c| c.user.as_ref()) {
            Some(user) => user,
            None => {
                return Err(ctx
                    .and_then(|c| c.auth_failure.clone())
                    .unwrap_or(AuthError::MissingUser))
            }
        };
        if policy == GroupPolicy::User {
            return Ok(());
        }

        self.gate.require_device(req.headers(), user)?;
        if policy == GroupPolicy::Admin {
            self.gate
                .require_permission(&self.admin_permission, user)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for RouteGroupMiddleware {
    fn name(&self) -> &str {
        "route-groups"
    }

    async fn handle(&self, mut req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let Some(matched) = self.router.resolve(req.method(), req.uri().path()) else {
            return next.run(req).await;
        };

        let group = matched.group;
        req.extensions_mut().insert(matched);

        if let Err(e) = self.enforce(group.policy(), &req).await {
            if let Some(metrics) = &self.metrics {
                metrics.record_auth_rejection();
            }
            tracing::debug!(group = %group, error = %e, "Request rejected by route group");
            let settings = self.gate.settings();
            return response::auth_failure(&e, settings.redirect_root_url.as_deref());
        }
        next.run(req).await
    }
}

/// Calls the matched route's handler when the route came from the right
/// origin; otherwise passes the request on.
pub struct DispatchMiddleware {
    router: Arc<Router>,
    builtin: bool,
}

impl DispatchMiddleware {
    pub fn builtin(router: Arc<Router>) -> Self {
        Self {
            router,
            builtin: true,
        }
    }

    pub fn plugins(router: Arc<Router>) -> Self {
        Self {
            router,
            builtin: false,
        }
    }
}

#[async_trait]
impl Middleware for DispatchMiddleware {
    fn name(&self) -> &str {
        if self.builtin {
            "builtin-routes"
        } else {
            "plugin-routes"
        }
    }

    async fn handle(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let handler = route_match(&req)
            .filter(|m| m.origin.is_builtin() == self.builtin)
            .and_then(|m| self.router.route(m.index))
            .map(|route| route.handler.clone());

        match handler {
            Some(handler) => handler.call(req).await,
            None => next.run(req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offsets() {
        assert_eq!(parse_utc_offset("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_utc_offset("+02:00"), FixedOffset::east_opt(7200));
        assert_eq!(parse_utc_offset("-0530"), FixedOffset::west_opt(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("+09"), FixedOffset::east_opt(9 * 3600));
        assert_eq!(parse_utc_offset("Europe/Paris"), None);
        assert_eq!(parse_utc_offset("+25:00"), None);
        assert_eq!(parse_utc_offset("+02:75"), None);
        assert_eq!(parse_utc_offset(""), None);
    }

    #[test]
    fn test_request_id_validation() {
        assert!(valid_request_id("abc-123_x.y"));
        assert!(!valid_request_id(""));
        assert!(!valid_request_id("has space"));
        assert!(!valid_request_id(&"x".repeat(200)));
    }
}
