use super::context::RouteMatch;
use super::pipeline::Handler;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use warp::http::Method;

/// The fixed set of route groups a route can be mounted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RouteGroup {
    Public,
    PreTwofactor,
    Authenticated,
    Admin,
    Root,
}

impl RouteGroup {
    pub const ALL: [RouteGroup; 5] = [
        RouteGroup::Public,
        RouteGroup::PreTwofactor,
        RouteGroup::Authenticated,
        RouteGroup::Admin,
        RouteGroup::Root,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RouteGroup::Public => "Public",
            RouteGroup::PreTwofactor => "PreTwofactor",
            RouteGroup::Authenticated => "Authenticated",
            RouteGroup::Admin => "Admin",
            RouteGroup::Root => "Root",
        }
    }

    pub fn policy(self) -> GroupPolicy {
        match self {
            RouteGroup::Public | RouteGroup::Root => GroupPolicy::Open,
            RouteGroup::PreTwofactor => GroupPolicy::User,
            RouteGroup::Authenticated => GroupPolicy::UserAndDevice,
            RouteGroup::Admin => GroupPolicy::Admin,
        }
    }
}

impl fmt::Display for RouteGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact, case-sensitive match on the group name
impl FromStr for RouteGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouteGroup::ALL
            .into_iter()
            .find(|group| group.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// What a route group requires before its handlers run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPolicy {
    Open,
    /// An authenticated user
    User,
    /// An authenticated user plus a device token while two-factor is on
    UserAndDevice,
    /// `UserAndDevice` plus the admin permission
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteOrigin {
    Builtin,
    Plugin(String),
}

impl RouteOrigin {
    pub fn is_builtin(&self) -> bool {
        matches!(self, RouteOrigin::Builtin)
    }
}

/// Methods a route may be registered for
pub fn parse_method(raw: &str) -> Option<Method> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "GET" => Some(Method::GET),
        "POST" => Some(Method::POST),
        "PUT" => Some(Method::PUT),
        "PATCH" => Some(Method::PATCH),
        "DELETE" => Some(Method::DELETE),
        "HEAD" => Some(Method::HEAD),
        "OPTIONS" => Some(Method::OPTIONS),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

/// A route path such as `/posts/:id` or `/assets/*path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(path: &str) -> Result<Self, String> {
        if !path.starts_with('/') {
            return Err(format!("path {path:?} must start with '/'"));
        }

        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(format!("path {path:?} has an unnamed parameter"));
                }
                Segment::Param(name.to_string())
            } else if let Some(name) = part.strip_prefix('*') {
                if i + 1 != parts.len() {
                    return Err(format!("path {path:?} has a wildcard before the last segment"));
                }
                Segment::Wildcard(if name.is_empty() { "path" } else { name }.to_string())
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    /// Captured parameters when `path` matches
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = HashMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard(name) => {
                    params.insert(name.clone(), parts.get(i..).unwrap_or(&[]).join("/"));
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    if parts.get(i) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), (*parts.get(i)?).to_string());
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => write!(f, "/{s}")?,
                Segment::Param(s) => write!(f, "/:{s}")?,
                Segment::Wildcard(s) => write!(f, "/*{s}")?,
            }
        }
        Ok(())
    }
}

pub struct Route {
    pub method: Method,
    pub group: RouteGroup,
    pub pattern: PathPattern,
    pub origin: RouteOrigin,
    pub handler: Arc<dyn Handler>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    InvalidPath(String),
    Duplicate { method: Method, path: String },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::InvalidPath(reason) => f.write_str(reason),
            RouteError::Duplicate { method, path } => {
                write!(f, "{method} {path} is already registered")
            }
        }
    }
}

/// Route table for every group, frozen once the pipeline is built
pub struct Router {
    prefixes: HashMap<RouteGroup, String>,
    routes: Vec<Route>,
}

impl Router {
    /// `Root` is mounted at `/`; every other group under `api_prefix`
    pub fn new(api_prefix: &str) -> Self {
        let api_prefix = api_prefix.trim_end_matches('/').to_string();
        let prefixes = RouteGroup::ALL
            .into_iter()
            .map(|group| {
                let prefix = match group {
                    RouteGroup::Root => String::new(),
                    _ => api_prefix.clone(),
                };
                (group, prefix)
            })
            .collect();

        Self {
            prefixes,
            routes: Vec::new(),
        }
    }

    pub fn prefix(&self, group: RouteGroup) -> &str {
        self.prefixes.get(&group).map(String::as_str).unwrap_or("")
    }

    /// Mount `handler` at `path` inside `group`
    pub fn add(
        &mut self,
        group: RouteGroup,
        method: Method,
        path: &str,
        origin: RouteOrigin,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RouteError> {
        let full = format!("{}{}", self.prefix(group), path);
        let pattern = PathPattern::parse(&full).map_err(RouteError::InvalidPath)?;

        let duplicate = self
            .routes
            .iter()
            .any(|route| route.method == method && route.pattern == pattern);
        if duplicate {
            return Err(RouteError::Duplicate {
                method,
                path: pattern.to_string(),
            });
        }

        tracing::debug!(group = %group, method = %method, path = %pattern, "Mounted route");
        self.routes.push(Route {
            method,
            group,
            pattern,
            origin,
            handler,
        });
        Ok(())
    }

    pub fn route(&self, index: usize) -> Option<&Route> {
        self.routes.get(index)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Find the route for a request. Built-in routes win over plugin routes.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let builtin_first = self
            .routes
            .iter()
            .enumerate()
            .filter(|(_, route)| route.origin.is_builtin())
            .chain(
                self.routes
                    .iter()
                    .enumerate()
                    .filter(|(_, route)| !route.origin.is_builtin()),
            );

        for (index, route) in builtin_first {
            if &route.method != method {
                continue;
            }
            if let Some(params) = route.pattern.matches(path) {
                let prefix = self.prefix(route.group);
                let stripped = path.strip_prefix(prefix).unwrap_or(path);
                let forward_path = if stripped.starts_with('/') {
                    stripped.to_string()
                } else {
                    format!("/{stripped}")
                };

                return Some(RouteMatch {
                    index,
                    group: route.group,
                    origin: route.origin.clone(),
                    params,
                    forward_path,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::pipeline::HttpRequest;
    use warp::http::Response;
    use warp::hyper::Body;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(|_req: HttpRequest| async { Response::new(Body::empty()) })
    }

    #[test]
    fn test_group_names_are_exact() {
        assert_eq!("Authenticated".parse::<RouteGroup>(), Ok(RouteGroup::Authenticated));
        assert_eq!("PreTwofactor".parse::<RouteGroup>(), Ok(RouteGroup::PreTwofactor));
        assert!("public".parse::<RouteGroup>().is_err());
        assert!("Auth".parse::<RouteGroup>().is_err());
        assert!("".parse::<RouteGroup>().is_err());
    }

    #[test]
    fn test_group_policies() {
        assert_eq!(RouteGroup::Public.policy(), GroupPolicy::Open);
        assert_eq!(RouteGroup::Root.policy(), GroupPolicy::Open);
        assert_eq!(RouteGroup::PreTwofactor.policy(), GroupPolicy::User);
        assert_eq!(RouteGroup::Authenticated.policy(), GroupPolicy::UserAndDevice);
        assert_eq!(RouteGroup::Admin.policy(), GroupPolicy::Admin);
    }

    #[test]
    fn test_pattern_matching() {
        let pattern = PathPattern::parse("/api/posts/:id").unwrap();
        let params = pattern.matches("/api/posts/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert!(pattern.matches("/api/posts").is_none());
        assert!(pattern.matches("/api/posts/42/comments").is_none());

        let wildcard = PathPattern::parse("/content/:plugin/*path").unwrap();
        let params = wildcard.matches("/content/blog/css/site.css").unwrap();
        assert_eq!(params.get("plugin").map(String::as_str), Some("blog"));
        assert_eq!(params.get("path").map(String::as_str), Some("css/site.css"));
    }

    #[test]
    fn test_pattern_errors() {
        assert!(PathPattern::parse("no-slash").is_err());
        assert!(PathPattern::parse("/a/:/b").is_err());
        assert!(PathPattern::parse("/a/*rest/b").is_err());
        assert_eq!(PathPattern::parse("/").unwrap().to_string(), "/");
    }

    #[test]
    fn test_prefixes_and_forward_path() {
        let mut router = Router::new("/api");
        router
            .add(RouteGroup::Public, Method::GET, "/widgets", RouteOrigin::Plugin("w".into()), noop())
            .unwrap();
        router
            .add(RouteGroup::Root, Method::GET, "/feed.xml", RouteOrigin::Plugin("w".into()), noop())
            .unwrap();

        let api = router.resolve(&Method::GET, "/api/widgets").unwrap();
        assert_eq!(api.forward_path, "/widgets");
        assert_eq!(api.group, RouteGroup::Public);

        let root = router.resolve(&Method::GET, "/feed.xml").unwrap();
        assert_eq!(root.forward_path, "/feed.xml");

        assert!(router.resolve(&Method::POST, "/api/widgets").is_none());
        assert!(router.resolve(&Method::GET, "/widgets").is_none());
    }

    #[test]
    fn test_builtin_wins_over_plugin() {
        let mut router = Router::new("/api");
        router
            .add(RouteGroup::Public, Method::GET, "/:anything", RouteOrigin::Plugin("p".into()), noop())
            .unwrap();
        router
            .add(RouteGroup::Public, Method::GET, "/healthy", RouteOrigin::Builtin, noop())
            .unwrap();

        let found = router.resolve(&Method::GET, "/api/healthy").unwrap();
        assert_eq!(found.origin, RouteOrigin::Builtin);
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut router = Router::new("/api");
        router
            .add(RouteGroup::Public, Method::GET, "/healthy", RouteOrigin::Builtin, noop())
            .unwrap();
        let err = router
            .add(RouteGroup::Authenticated, Method::GET, "/healthy", RouteOrigin::Plugin("p".into()), noop())
            .unwrap_err();
        assert!(matches!(err, RouteError::Duplicate { .. }));
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get"), Some(Method::GET));
        assert_eq!(parse_method("DELETE"), Some(Method::DELETE));
        assert_eq!(parse_method("FETCH"), None);
    }
}
