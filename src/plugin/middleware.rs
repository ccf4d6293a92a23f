//! Middleware declared by plugins
//!
//! A plugin middleware is a callout: the host sends the request line and
//! headers to the plugin and either continues (2xx) or returns the plugin's
//! answer to the caller unchanged.

use super::manifest::{MiddlewareDescriptor, PluginDefinition};
use super::proxy::{convert_method, forward_headers, UpstreamClient, REQUEST_ID_HEADER};
use super::supervisor::PluginEndpoint;
use crate::error::{GatewayError, RegistrationError};
use crate::web::context::context;
use crate::web::pipeline::{HttpRequest, HttpResponse, Middleware, MiddlewareRank, Next, PipelineBuilder};
use crate::web::response;
use async_trait::async_trait;
use std::sync::Arc;
use warp::http::Response;
use warp::hyper::Body;

pub const ORIGINAL_URI_HEADER: &str = "X-Original-Uri";

pub struct PluginMiddleware {
    plugin_id: String,
    name: String,
    url: String,
    upstream: UpstreamClient,
}

impl PluginMiddleware {
    pub fn new(
        endpoint: &PluginEndpoint,
        descriptor: &MiddlewareDescriptor,
        upstream: UpstreamClient,
    ) -> Result<Self, String> {
        if !descriptor.url.starts_with('/') {
            return Err(format!("callout path {:?} must start with '/'", descriptor.url));
        }
        let url = format!("{}{}", endpoint.base_url(), descriptor.url);
        url::Url::parse(&url).map_err(|e| e.to_string())?;

        let name = if descriptor.name.is_empty() {
            format!("{}{}", endpoint.plugin_id, descriptor.url)
        } else {
            format!("{}:{}", endpoint.plugin_id, descriptor.name)
        };

        Ok(Self {
            plugin_id: endpoint.plugin_id.clone(),
            name,
            url,
            upstream,
        })
    }

    /// Ask the plugin about the request. `None` means continue.
    async fn check(&self, req: &HttpRequest) -> Result<Option<HttpResponse>, GatewayError> {
        let method = convert_method(req.method()).ok_or_else(|| GatewayError::InvalidResponse {
            plugin: self.plugin_id.clone(),
            reason: format!("unsupported method {}", req.method()),
        })?;

        let mut headers = forward_headers(req.headers());
        let original_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if let Ok(value) = reqwest::header::HeaderValue::from_str(original_uri) {
            headers.insert(ORIGINAL_URI_HEADER, value);
        }
        if let Some(id) = context(req).and_then(|ctx| ctx.request_id.as_deref()) {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(id) {
                headers.insert(REQUEST_ID_HEADER, value);
            }
        }

        let request = self.upstream.request(method, &self.url).headers(headers);
        let answer = self.upstream.send(&self.plugin_id, request).await?;

        if answer.status().is_success() {
            return Ok(None);
        }

        tracing::debug!(
            middleware = %self.name,
            status = answer.status().as_u16(),
            "Plugin middleware stopped the request"
        );

        let status = answer.status().as_u16();
        let mut builder = Response::builder().status(status);
        for (name, value) in answer.headers() {
            if super::proxy::is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let body = answer.bytes().await.map_err(|e| {
            if e.is_timeout() {
                self.upstream.timed_out(&self.plugin_id)
            } else {
                GatewayError::InvalidResponse {
                    plugin: self.plugin_id.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        builder
            .body(Body::from(body))
            .map(Some)
            .map_err(|e| GatewayError::InvalidResponse {
                plugin: self.plugin_id.clone(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Middleware for PluginMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse {
        match self.check(&req).await {
            Ok(None) => next.run(req).await,
            Ok(Some(answer)) => answer,
            Err(e) => response::gateway_failure(&e),
        }
    }
}

/// Register the middleware every running plugin declares, in discovery order
pub fn register_plugin_middleware(
    plugins: &[Arc<PluginDefinition>],
    endpoints: &[PluginEndpoint],
    builder: &mut PipelineBuilder,
    upstream: &UpstreamClient,
) -> Vec<RegistrationError> {
    let mut errors = Vec::new();

    for plugin in plugins {
        if plugin.middleware().is_empty() {
            continue;
        }
        let Some(endpoint) = endpoints
            .iter()
            .find(|e| e.plugin_id == plugin.id() && e.is_running())
        else {
            tracing::warn!(plugin = %plugin.id(), "Plugin is not running, skipping its middleware");
            continue;
        };

        for descriptor in plugin.middleware() {
            let rank = match MiddlewareRank::try_from(&descriptor.rank) {
                Ok(rank) => rank,
                Err(rank) => {
                    errors.push(RegistrationError::UnknownRank {
                        plugin: plugin.id().to_string(),
                        middleware: descriptor.name.clone(),
                        rank,
                    });
                    continue;
                }
            };

            match PluginMiddleware::new(endpoint, descriptor, upstream.clone()) {
                Ok(middleware) => {
                    tracing::info!(
                        plugin = %plugin.id(),
                        middleware = %middleware.name,
                        rank = rank.value(),
                        "Registered plugin middleware"
                    );
                    builder.add(rank, Arc::new(middleware));
                }
                Err(reason) => errors.push(RegistrationError::InvalidUpstream {
                    plugin: plugin.id().to_string(),
                    target: descriptor.url.clone(),
                    reason,
                }),
            }
        }
    }

    for error in &errors {
        tracing::error!("{}", error);
    }
    errors
}
