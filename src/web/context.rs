use super::pipeline::HttpRequest;
use super::router::{RouteGroup, RouteOrigin};
use crate::error::AuthError;
use crate::store::User;
use chrono::{FixedOffset, Offset, Utc};
use std::collections::HashMap;

/// Per-request state carried in the request extensions
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Option<String>,
    /// Set when a valid session token named an enabled user
    pub user: Option<User>,
    /// Why a presented session token was not accepted
    pub auth_failure: Option<AuthError>,
    pub utc_offset: FixedOffset,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: None,
            user: None,
            auth_failure: None,
            utc_offset: utc(),
        }
    }
}

pub(crate) fn utc() -> FixedOffset {
    Utc.fix()
}

/// The route a request resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub index: usize,
    pub group: RouteGroup,
    pub origin: RouteOrigin,
    pub params: HashMap<String, String>,
    /// Request path with the route group prefix removed
    pub forward_path: String,
}

pub fn context(req: &HttpRequest) -> Option<&RequestContext> {
    req.extensions().get::<RequestContext>()
}

/// Modify the request's context, starting from a default one if missing
pub fn update_context(req: &mut HttpRequest, update: impl FnOnce(&mut RequestContext)) {
    let mut ctx = req
        .extensions_mut()
        .remove::<RequestContext>()
        .unwrap_or_default();
    update(&mut ctx);
    req.extensions_mut().insert(ctx);
}

pub fn route_match(req: &HttpRequest) -> Option<&RouteMatch> {
    req.extensions().get::<RouteMatch>()
}
