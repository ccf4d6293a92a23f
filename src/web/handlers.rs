use super::context::{context, route_match};
use super::pipeline::{Handler, HttpRequest, HttpResponse};
use super::response;
use crate::plugin::{PluginDefinition, ProcessSupervisor};
use crate::state::Metrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use warp::http::{header, Response, StatusCode};
use warp::hyper::Body;

/// Fallback for requests no route claimed
pub struct NotFoundHandler;

#[async_trait]
impl Handler for NotFoundHandler {
    async fn call(&self, _req: HttpRequest) -> HttpResponse {
        response::not_found()
    }
}

/// `GET /api/healthy`
pub struct HealthHandler;

#[async_trait]
impl Handler for HealthHandler {
    async fn call(&self, _req: HttpRequest) -> HttpResponse {
        Response::new(Body::empty())
    }
}

/// `GET /api/verify`: the authenticated user
pub struct VerifyHandler;

#[async_trait]
impl Handler for VerifyHandler {
    async fn call(&self, req: HttpRequest) -> HttpResponse {
        match context(&req).and_then(|ctx| ctx.user.as_ref()) {
            Some(user) => response::json(StatusCode::OK, &user.display()),
            None => response::error(StatusCode::UNAUTHORIZED, "A valid user token is required"),
        }
    }
}

/// `GET /api/plugins`: supervisor snapshot
pub struct PluginsHandler {
    supervisor: Arc<ProcessSupervisor>,
}

impl PluginsHandler {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Handler for PluginsHandler {
    async fn call(&self, _req: HttpRequest) -> HttpResponse {
        response::json(StatusCode::OK, &self.supervisor.endpoints())
    }
}

/// `GET /metrics`
pub struct MetricsHandler {
    metrics: Arc<Metrics>,
}

impl MetricsHandler {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn call(&self, _req: HttpRequest) -> HttpResponse {
        Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(self.metrics.encode()))
            .unwrap_or_else(|_| response::error(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Public,
    Docs,
}

/// Serves files from each plugin's public or docs directory.
///
/// Routed as `/content/plugins/:pluginId/<kind>/*path`.
pub struct StaticAssets {
    dirs: HashMap<String, PathBuf>,
}

impl StaticAssets {
    pub fn new(kind: AssetKind, plugins: &[Arc<PluginDefinition>]) -> Self {
        let dirs = plugins
            .iter()
            .filter_map(|plugin| {
                let dir = match kind {
                    AssetKind::Public => plugin.public_dir(),
                    AssetKind::Docs => plugin.docs_dir(),
                }?;
                Some((plugin.id().to_string(), dir))
            })
            .collect();
        Self { dirs }
    }

    fn resolve(&self, plugin_id: &str, relative: &str) -> Option<PathBuf> {
        let base = self.dirs.get(plugin_id)?;
        let relative = if relative.is_empty() { "index.html" } else { relative };
        let relative = Path::new(relative);

        // Only plain names below the asset directory
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        safe.then(|| base.join(relative))
    }
}

#[async_trait]
impl Handler for StaticAssets {
    async fn call(&self, req: HttpRequest) -> HttpResponse {
        let Some(matched) = route_match(&req) else {
            return response::not_found();
        };
        let plugin_id = matched.params.get("pluginId").map(String::as_str).unwrap_or("");
        let relative = matched.params.get("path").map(String::as_str).unwrap_or("");

        let Some(path) = self.resolve(plugin_id, relative) else {
            return response::not_found();
        };

        match tokio::fs::read(&path).await {
            Ok(content) => Response::builder()
                .header(header::CONTENT_TYPE, content_type(&path))
                .body(Body::from(content))
                .unwrap_or_else(|_| response::not_found()),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Asset not served");
                response::not_found()
            }
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "txt" | "md" => "text/plain; charset=utf-8",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginManifest;
    use crate::web::context::RouteMatch;
    use crate::web::router::{RouteGroup, RouteOrigin};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn plugin(root: &Path) -> Arc<PluginDefinition> {
        let manifest: PluginManifest = serde_json::from_value(serde_json::json!({
            "id": "blog",
            "name": "Blog",
            "services": { "docs": "docs" },
            "interface": { "public": "public" }
        }))
        .unwrap();
        Arc::new(PluginDefinition {
            manifest,
            root: root.to_path_buf(),
            entry_point: root.join("main"),
        })
    }

    fn asset_request(plugin_id: &str, path: &str) -> HttpRequest {
        let mut req = warp::http::Request::builder()
            .uri("/content/plugins/x")
            .body(Bytes::new())
            .unwrap();
        let mut params = HashMap::new();
        params.insert("pluginId".to_string(), plugin_id.to_string());
        params.insert("path".to_string(), path.to_string());
        req.extensions_mut().insert(RouteMatch {
            index: 0,
            group: RouteGroup::Root,
            origin: RouteOrigin::Builtin,
            params,
            forward_path: "/".into(),
        });
        req
    }

    #[tokio::test]
    async fn test_serves_public_asset() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("public/css")).unwrap();
        std::fs::write(temp.path().join("public/css/site.css"), "body{}").unwrap();

        let assets = StaticAssets::new(AssetKind::Public, &[plugin(temp.path())]);
        let response = assets.call(asset_request("blog", "css/site.css")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
        let body = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"body{}");
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("docs")).unwrap();
        std::fs::write(temp.path().join("secret.txt"), "nope").unwrap();

        let assets = StaticAssets::new(AssetKind::Docs, &[plugin(temp.path())]);
        let response = assets.call(asset_request("blog", "../secret.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_not_found() {
        let temp = TempDir::new().unwrap();
        let assets = StaticAssets::new(AssetKind::Docs, &[plugin(temp.path())]);
        let response = assets.call(asset_request("other", "index.html")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
