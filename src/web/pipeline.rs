//! Ranked middleware pipeline
//!
//! Middleware is registered into fixed rank slots (1, 1000, 2000, 3000,
//! 4000). Each slot is followed by the kernel stage that belongs after it.
//! `build` flattens the slots into one immutable chain, so the order a
//! request sees is fixed before the first request is served.

use super::context::RequestContext;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use warp::http::{Request, Response};
use warp::hyper::Body;

use crate::state::Metrics;

pub type HttpRequest = Request<Bytes>;
pub type HttpResponse = Response<Body>;

/// Terminal request handler
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: HttpRequest) -> HttpResponse;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    async fn call(&self, req: HttpRequest) -> HttpResponse {
        (self)(req).await
    }
}

/// A stage in the chain. Call `next.run(req)` to continue, or return a
/// response to short-circuit.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse;
}

/// The rest of the chain after the current middleware
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn run(self, req: HttpRequest) -> BoxFuture<'a, HttpResponse> {
        match self.chain.split_first() {
            Some((head, tail)) => head.handle(
                req,
                Next {
                    chain: tail,
                    endpoint: self.endpoint,
                },
            ),
            None => self.endpoint.call(req),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MiddlewareRank {
    /// Before request-id, CORS, timezone and authentication
    First,
    /// After authentication, before route-group policies
    AfterAuthentication,
    /// After route-group policies, before built-in routes
    AfterRouteGroups,
    /// After built-in routes, before plugin routes
    AfterBuiltinRoutes,
    /// After plugin routes, before the not-found fallback
    AfterPluginRoutes,
}

impl MiddlewareRank {
    pub const ALL: [MiddlewareRank; 5] = [
        MiddlewareRank::First,
        MiddlewareRank::AfterAuthentication,
        MiddlewareRank::AfterRouteGroups,
        MiddlewareRank::AfterBuiltinRoutes,
        MiddlewareRank::AfterPluginRoutes,
    ];

    pub fn value(self) -> u32 {
        match self {
            MiddlewareRank::First => 1,
            MiddlewareRank::AfterAuthentication => 1000,
            MiddlewareRank::AfterRouteGroups => 2000,
            MiddlewareRank::AfterBuiltinRoutes => 3000,
            MiddlewareRank::AfterPluginRoutes => 4000,
        }
    }
}

impl TryFrom<u32> for MiddlewareRank {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        MiddlewareRank::ALL
            .into_iter()
            .find(|rank| rank.value() == value)
            .ok_or(value)
    }
}

/// A manifest rank. Anything other than one of the five rank numbers is
/// rejected with its JSON text.
impl TryFrom<&serde_json::Value> for MiddlewareRank {
    type Error = String;

    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .and_then(|v| MiddlewareRank::try_from(v).ok())
            .ok_or_else(|| value.to_string())
    }
}

type Slots = BTreeMap<MiddlewareRank, Vec<Arc<dyn Middleware>>>;

/// Collects middleware by rank. Registration order is kept within a rank.
pub struct PipelineBuilder {
    ranked: Slots,
    stages: Slots,
    fallback: Option<Arc<dyn Handler>>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            ranked: BTreeMap::new(),
            stages: BTreeMap::new(),
            fallback: None,
            metrics: None,
        }
    }

    /// Register middleware at a rank
    pub fn add(&mut self, rank: MiddlewareRank, middleware: Arc<dyn Middleware>) -> &mut Self {
        tracing::debug!(rank = rank.value(), middleware = middleware.name(), "Registered middleware");
        self.ranked.entry(rank).or_default().push(middleware);
        self
    }

    /// Register a kernel stage that runs after everything ranked at `after`
    pub fn stage(&mut self, after: MiddlewareRank, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.stages.entry(after).or_default().push(middleware);
        self
    }

    /// Handler for requests that pass through every stage
    pub fn fallback(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    pub fn metrics(&mut self, metrics: Arc<Metrics>) -> &mut Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Pipeline {
        let mut ranked = self.ranked;
        let mut stages = self.stages;
        let mut chain = Vec::new();

        for rank in MiddlewareRank::ALL {
            chain.extend(ranked.remove(&rank).unwrap_or_default());
            chain.extend(stages.remove(&rank).unwrap_or_default());
        }

        Pipeline {
            chain,
            fallback: self
                .fallback
                .unwrap_or_else(|| Arc::new(super::handlers::NotFoundHandler)),
            metrics: self.metrics,
        }
    }
}

/// The flattened, immutable chain
pub struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
    fallback: Arc<dyn Handler>,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub async fn handle(&self, mut req: HttpRequest) -> HttpResponse {
        let started = Instant::now();
        if req.extensions().get::<RequestContext>().is_none() {
            req.extensions_mut().insert(RequestContext::default());
        }

        let next = Next {
            chain: &self.chain,
            endpoint: self.fallback.as_ref(),
        };
        let response = next.run(req).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_request(started.elapsed());
        }
        response
    }

    /// Middleware names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.chain.iter().map(|m| m.name()).collect()
    }
}
