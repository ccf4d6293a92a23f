use crate::error::{RegistrationError, Result};
use crate::plugin::{register_plugin_middleware, register_plugin_routes, PluginEndpoint};
use crate::state::Kernel;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use warp::http::{HeaderMap, Method, Request, StatusCode};
use warp::path::FullPath;
use warp::Filter;

pub mod builtin;
pub mod context;
pub mod handlers;
pub mod pipeline;
pub mod response;
pub mod router;

pub use pipeline::{
    Handler, HttpRequest, HttpResponse, Middleware, MiddlewareRank, Next, Pipeline, PipelineBuilder,
};
pub use router::{RouteGroup, RouteOrigin, Router};

use builtin::{
    AuthenticationMiddleware, CorsMiddleware, DispatchMiddleware, RequestIdMiddleware,
    RouteGroupMiddleware, TimezoneMiddleware,
};
use handlers::{
    AssetKind, HealthHandler, MetricsHandler, NotFoundHandler, PluginsHandler, StaticAssets,
    VerifyHandler,
};

/// Mount the built-in routes. They are registered before any plugin route
/// and always win a conflict.
fn mount_builtin_routes(kernel: &Kernel, router: &mut Router) {
    let mut mount = |group: RouteGroup, path: &str, handler: Arc<dyn Handler>| {
        if let Err(e) = router.add(group, Method::GET, path, RouteOrigin::Builtin, handler) {
            tracing::error!(group = %group, path, error = %e, "Failed to mount built-in route");
        }
    };

    mount(RouteGroup::Public, "/healthy", Arc::new(HealthHandler));
    mount(RouteGroup::Authenticated, "/verify", Arc::new(VerifyHandler));
    mount(
        RouteGroup::Admin,
        "/plugins",
        Arc::new(PluginsHandler::new(kernel.supervisor.clone())),
    );
    mount(
        RouteGroup::Root,
        "/metrics",
        Arc::new(MetricsHandler::new(kernel.metrics.clone())),
    );
    mount(
        RouteGroup::Root,
        "/content/plugins/:pluginId/public/*path",
        Arc::new(StaticAssets::new(AssetKind::Public, &kernel.plugins)),
    );
    mount(
        RouteGroup::Root,
        "/content/plugins/:pluginId/docs/*path",
        Arc::new(StaticAssets::new(AssetKind::Docs, &kernel.plugins)),
    );
}

/// Assemble the route table and the ranked middleware chain.
///
/// Registration problems in plugin manifests are returned, not fatal: the
/// offending route or middleware is left out and everything else mounts.
pub fn build_pipeline(
    kernel: &Kernel,
    endpoints: &[PluginEndpoint],
) -> (Pipeline, Vec<RegistrationError>) {
    let mut router = Router::new(&kernel.config.server.api_prefix);
    mount_builtin_routes(kernel, &mut router);

    let mut errors = register_plugin_routes(&kernel.plugins, endpoints, &mut router, &kernel.upstream);
    let router = Arc::new(router);

    let mut builder = Pipeline::builder();
    builder
        .stage(MiddlewareRank::First, Arc::new(RequestIdMiddleware))
        .stage(
            MiddlewareRank::First,
            Arc::new(CorsMiddleware::new(kernel.settings.clone())),
        )
        .stage(MiddlewareRank::First, Arc::new(TimezoneMiddleware))
        .stage(
            MiddlewareRank::First,
            Arc::new(AuthenticationMiddleware::new(kernel.gate.clone())),
        )
        .stage(
            MiddlewareRank::AfterAuthentication,
            Arc::new(
                RouteGroupMiddleware::new(
                    router.clone(),
                    kernel.gate.clone(),
                    kernel.config.server.admin_permission.clone(),
                )
                .with_metrics(kernel.metrics.clone()),
            ),
        )
        .stage(
            MiddlewareRank::AfterRouteGroups,
            Arc::new(DispatchMiddleware::builtin(router.clone())),
        )
        .stage(
            MiddlewareRank::AfterBuiltinRoutes,
            Arc::new(DispatchMiddleware::plugins(router)),
        )
        .fallback(Arc::new(NotFoundHandler))
        .metrics(kernel.metrics.clone());

    errors.extend(register_plugin_middleware(
        &kernel.plugins,
        endpoints,
        &mut builder,
        &kernel.upstream,
    ));

    let pipeline = builder.build();
    tracing::info!(
        middleware = ?pipeline.names(),
        registration_errors = errors.len(),
        "Pipeline built"
    );
    (pipeline, errors)
}

/// A single catch-all filter feeding every request to the pipeline
pub fn routes(
    pipeline: Arc<Pipeline>,
) -> impl Filter<Extract = (HttpResponse,), Error = warp::Rejection> + Clone {
    let query = warp::query::raw()
        .or(warp::any().map(String::new))
        .unify();

    warp::method()
        .and(warp::path::full())
        .and(query)
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and_then(
            move |method: Method, path: FullPath, query: String, headers: HeaderMap, body: Bytes| {
                let pipeline = pipeline.clone();
                async move {
                    let uri = if query.is_empty() {
                        path.as_str().to_string()
                    } else {
                        format!("{}?{}", path.as_str(), query)
                    };

                    let reply = match Request::builder().method(method).uri(uri).body(body) {
                        Ok(mut req) => {
                            *req.headers_mut() = headers;
                            pipeline.handle(req).await
                        }
                        Err(e) => response::error(StatusCode::BAD_REQUEST, &e.to_string()),
                    };
                    Ok::<_, warp::Rejection>(reply)
                }
            },
        )
}

/// Bind the listener. The returned future serves until shutdown is broadcast.
pub fn bind(
    addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(SocketAddr, impl std::future::Future<Output = ()> + Send)> {
    let (bound, server) = warp::serve(routes(pipeline))
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.recv().await;
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, e.to_string()))?;

    tracing::info!("Listening on {}", bound);
    Ok((bound, server))
}

/// Serve on the configured address until shutdown
pub async fn start_server(kernel: Arc<Kernel>, pipeline: Arc<Pipeline>) -> Result<()> {
    let addr = format!("{}:{}", kernel.config.server.host, kernel.config.server.port);
    let addr: SocketAddr = addr.parse().map_err(|e| {
        crate::error::ConfigError::Parse(format!("Invalid listen address {}: {}", addr, e))
    })?;

    let (_, server) = bind(addr, pipeline, kernel.subscribe_shutdown())?;
    server.await;

    tracing::info!("Web server stopped");
    Ok(())
}
