//! Forwarding requests to plugin processes

use super::manifest::PluginDefinition;
use super::supervisor::PluginEndpoint;
use crate::config::PluginsConfig;
use crate::error::{GatewayError, RegistrationError};
use crate::state::Metrics;
use crate::web::context::{context, route_match};
use crate::web::pipeline::{Handler, HttpRequest, HttpResponse};
use crate::web::response;
use crate::web::router::{parse_method, RouteGroup, RouteOrigin, Router};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use warp::http::{HeaderMap, Response};
use warp::hyper::Body;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Shared HTTP client and limits for talking to plugins
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl UpstreamClient {
    pub fn new(config: &PluginsConfig) -> Result<Self, reqwest::Error> {
        // `timeout` covers the whole exchange, body included
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.proxy_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            timeout: config.proxy_timeout(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one request, bounded by the proxy timeout
    pub(crate) async fn send(
        &self,
        plugin: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_proxied_request();
        }

        let result = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(self.timed_out(plugin)),
            Ok(Err(e)) => Err(GatewayError::Unreachable {
                plugin: plugin.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(self.timed_out(plugin)),
        };

        if let Err(e) = &result {
            tracing::warn!(plugin = %plugin, error = %e, "Plugin request failed");
            if let Some(metrics) = &self.metrics {
                metrics.record_proxy_failure(matches!(e, GatewayError::Timeout { .. }));
            }
        }
        result
    }

    pub(crate) fn timed_out(&self, plugin: &str) -> GatewayError {
        GatewayError::Timeout {
            plugin: plugin.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    pub(crate) fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client.request(method, url)
    }
}

/// Copy end-to-end request headers into a reqwest header map
pub(crate) fn forward_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut forwarded = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            forwarded.append(name, value);
        }
    }
    forwarded
}

pub(crate) fn convert_method(method: &warp::http::Method) -> Option<reqwest::Method> {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).ok()
}

/// Build the host response from an upstream one, streaming its body
pub(crate) fn stream_back(plugin: &str, upstream: reqwest::Response) -> HttpResponse {
    let mut builder = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder
        .body(Body::wrap_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            response::gateway_failure(&GatewayError::InvalidResponse {
                plugin: plugin.to_string(),
                reason: e.to_string(),
            })
        })
}

/// Forwards matched requests to one plugin process
pub struct PluginProxy {
    plugin_id: String,
    base_url: String,
    upstream: UpstreamClient,
}

impl PluginProxy {
    pub fn new(endpoint: &PluginEndpoint, upstream: UpstreamClient) -> Result<Self, String> {
        let base_url = endpoint.base_url();
        url::Url::parse(&base_url).map_err(|e| e.to_string())?;
        Ok(Self {
            plugin_id: endpoint.plugin_id.clone(),
            base_url,
            upstream,
        })
    }

    fn target(&self, req: &HttpRequest) -> String {
        let path = route_match(req)
            .map(|m| m.forward_path.as_str())
            .unwrap_or_else(|| req.uri().path());
        match req.uri().query() {
            Some(query) => format!("{}{}?{}", self.base_url, path, query),
            None => format!("{}{}", self.base_url, path),
        }
    }

    async fn forward(&self, req: HttpRequest) -> Result<HttpResponse, GatewayError> {
        let url = self.target(&req);
        let method = convert_method(req.method()).ok_or_else(|| GatewayError::InvalidResponse {
            plugin: self.plugin_id.clone(),
            reason: format!("unsupported method {}", req.method()),
        })?;

        let mut headers = forward_headers(req.headers());
        if let Some(id) = context(&req).and_then(|ctx| ctx.request_id.as_deref()) {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(id) {
                headers.insert(REQUEST_ID_HEADER, value);
            }
        }

        tracing::debug!(plugin = %self.plugin_id, method = %method, url = %url, "Forwarding request");

        let request = self
            .upstream
            .request(method, &url)
            .headers(headers)
            .body(req.into_body());
        let upstream = self.upstream.send(&self.plugin_id, request).await?;
        Ok(stream_back(&self.plugin_id, upstream))
    }
}

#[async_trait]
impl Handler for PluginProxy {
    async fn call(&self, req: HttpRequest) -> HttpResponse {
        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => response::gateway_failure(&e),
        }
    }
}

/// Mount every route the plugins declare. A bad route is reported and
/// skipped; the plugin's other routes still register.
pub fn register_plugin_routes(
    plugins: &[Arc<PluginDefinition>],
    endpoints: &[PluginEndpoint],
    router: &mut Router,
    upstream: &UpstreamClient,
) -> Vec<RegistrationError> {
    let mut errors = Vec::new();

    for plugin in plugins {
        let Some(endpoint) = endpoints
            .iter()
            .find(|e| e.plugin_id == plugin.id() && e.is_running())
        else {
            tracing::warn!(plugin = %plugin.id(), "Plugin is not running, skipping its routes");
            continue;
        };

        let proxy: Arc<dyn Handler> = match PluginProxy::new(endpoint, upstream.clone()) {
            Ok(proxy) => Arc::new(proxy),
            Err(reason) => {
                errors.push(RegistrationError::InvalidUpstream {
                    plugin: plugin.id().to_string(),
                    target: endpoint.base_url(),
                    reason,
                });
                continue;
            }
        };

        for descriptor in plugin.routes() {
            let group = match descriptor.route.parse::<RouteGroup>() {
                Ok(group) => group,
                Err(group) => {
                    errors.push(RegistrationError::UnknownRouteGroup {
                        plugin: plugin.id().to_string(),
                        route: descriptor.name.clone(),
                        method: descriptor.method.clone(),
                        path: descriptor.url.clone(),
                        group,
                    });
                    continue;
                }
            };

            let Some(method) = parse_method(&descriptor.method) else {
                errors.push(RegistrationError::UnknownMethod {
                    plugin: plugin.id().to_string(),
                    route: descriptor.name.clone(),
                    method: descriptor.method.clone(),
                    path: descriptor.url.clone(),
                });
                continue;
            };

            let origin = RouteOrigin::Plugin(plugin.id().to_string());
            if let Err(e) = router.add(group, method, &descriptor.url, origin, proxy.clone()) {
                tracing::debug!(plugin = %plugin.id(), error = %e, "Route rejected");
                errors.push(RegistrationError::DuplicateRoute {
                    plugin: plugin.id().to_string(),
                    route: descriptor.name.clone(),
                    method: descriptor.method.clone(),
                    path: descriptor.url.clone(),
                });
                continue;
            }

            tracing::info!(
                plugin = %plugin.id(),
                group = %group,
                method = %descriptor.method,
                path = %descriptor.url,
                "Registered plugin route"
            );
        }
    }

    for error in &errors {
        tracing::error!("{}", error);
    }
    errors
}
