//! Composite routes: fan out to several backends and merge the responses.
//!
//! The merge is deterministic: without a custom transformer the response of
//! the first backend *in configured order* that answered successfully is
//! returned, no matter which branch finished first. Branches whose circuit
//! is open are skipped before any outbound call; failed branches are simply
//! absent from the merge set.

use crate::models::error::GatewayError;
use crate::models::settings::{CompositeRouteSettings, CompositeStrategy};
use crate::services::proxy::{ProxyRequest, UpstreamResponse};
use crate::services::registry::BackendCaller;
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::HttpResponse;
use futures::future::join_all;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Response produced by a custom composite transformer.
#[derive(Debug, Clone)]
pub struct CompositeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CompositeResponse {
    pub fn to_http_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status);
        for (name, value) in self.headers.iter() {
            builder.insert_header((name.clone(), value.clone()));
        }
        builder.body(self.body.clone())
    }
}

/// User-supplied merge callback, registered per route pattern.
pub trait ResponseTransformer: Send + Sync {
    fn transform(
        &self,
        responses: &HashMap<String, UpstreamResponse>,
    ) -> Result<CompositeResponse, GatewayError>;
}

/// Fan-out handler for composite routes.
pub struct CompositeHandler {
    caller: Arc<dyn BackendCaller>,
    transformers: RwLock<HashMap<String, Arc<dyn ResponseTransformer>>>,
}

impl CompositeHandler {
    pub fn new(caller: Arc<dyn BackendCaller>) -> Self {
        Self {
            caller,
            transformers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a custom merge callback for a route pattern.
    pub fn register_transformer(&self, pattern: &str, transformer: Arc<dyn ResponseTransformer>) {
        self.transformers
            .write()
            .unwrap()
            .insert(pattern.to_string(), transformer);
    }

    /// Executes the composite route and merges the branch responses.
    pub async fn handle(
        &self,
        pattern: &str,
        route: &CompositeRouteSettings,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<HttpResponse, GatewayError> {
        let responses = match route.strategy {
            CompositeStrategy::Sequential => {
                self.fan_out_sequential(&route.backends, request, deadline).await
            }
            _ => self.fan_out_parallel(&route.backends, request, deadline).await,
        };

        let transformer = self.transformers.read().unwrap().get(pattern).cloned();
        if let Some(transformer) = transformer {
            let composite = transformer.transform(&responses)?;
            return Ok(composite.to_http_response());
        }

        // Deterministic default merge: first configured backend that
        // answered successfully, falling back to the first that answered at
        // all.
        let chosen = route
            .backends
            .iter()
            .filter_map(|id| responses.get(id))
            .find(|r| r.is_success())
            .or_else(|| route.backends.iter().filter_map(|id| responses.get(id)).next());

        match chosen {
            Some(response) => Ok(response.to_http_response()),
            None => Err(GatewayError::Upstream {
                backend: route.backends.join(","),
                message: "no composite backend responded".into(),
            }),
        }
    }

    /// Concurrent fan-out. The request body is already a buffered `Bytes`,
    /// so every branch sees identical bytes.
    async fn fan_out_parallel(
        &self,
        backends: &[String],
        request: &ProxyRequest,
        deadline: Duration,
    ) -> HashMap<String, UpstreamResponse> {
        let futures = backends.iter().map(|backend_id| {
            let caller = Arc::clone(&self.caller);
            async move {
                let result = caller.call(backend_id, request, deadline).await;
                (backend_id.clone(), result)
            }
        });

        collect_branches(join_all(futures).await)
    }

    /// One-at-a-time fan-out in configured order. A failed branch does not
    /// abort the loop.
    async fn fan_out_sequential(
        &self,
        backends: &[String],
        request: &ProxyRequest,
        deadline: Duration,
    ) -> HashMap<String, UpstreamResponse> {
        let mut outcomes = Vec::with_capacity(backends.len());
        for backend_id in backends {
            let result = self.caller.call(backend_id, request, deadline).await;
            outcomes.push((backend_id.clone(), result));
        }
        collect_branches(outcomes)
    }
}

fn collect_branches(
    outcomes: Vec<(String, Result<UpstreamResponse, GatewayError>)>,
) -> HashMap<String, UpstreamResponse> {
    let mut responses = HashMap::new();
    for (backend_id, outcome) in outcomes {
        match outcome {
            Ok(response) => {
                responses.insert(backend_id, response);
            }
            Err(GatewayError::CircuitOpen { .. }) => {
                debug!("composite branch {} skipped (circuit open)", backend_id);
            }
            Err(e) => {
                warn!("composite branch {} failed: {}", backend_id, e);
            }
        }
    }
    responses
}
