//! JSON map/reduce aggregation across backends.
//!
//! Two shapes:
//!
//! - **sequential**: call a source backend, extract values from its JSON
//!   response, issue one dependent request to a target backend carrying
//!   those values, then merge the two documents.
//! - **parallel**: query all listed backends concurrently and combine the
//!   responses, including a row-level `join` keyed by a shared field.
//!
//! The first entry of the backend list is the join base; results always
//! come back in the base backend's row order regardless of which ancillary
//! branch finished first.

use crate::models::error::GatewayError;
use crate::models::settings::{MapReduceSettings, MergeStrategy};
use crate::services::proxy::ProxyRequest;
use crate::services::registry::BackendCaller;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::Method;
use actix_web::web::Bytes;
use actix_web::HttpResponse;
use futures::future::join_all;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_ENRICH_FIELD: &str = "enriched_data";

/// Map/reduce execution engine.
pub struct MapReduceEngine {
    caller: Arc<dyn BackendCaller>,
}

impl MapReduceEngine {
    pub fn new(caller: Arc<dyn BackendCaller>) -> Self {
        Self { caller }
    }

    pub async fn handle(
        &self,
        config: &MapReduceSettings,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<HttpResponse, GatewayError> {
        match config {
            MapReduceSettings::Sequential { .. } => {
                self.handle_sequential(config, request, deadline).await
            }
            MapReduceSettings::Parallel { .. } => {
                self.handle_parallel(config, request, deadline).await
            }
        }
    }

    async fn handle_sequential(
        &self,
        config: &MapReduceSettings,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<HttpResponse, GatewayError> {
        let MapReduceSettings::Sequential {
            source_backend,
            target_backend,
            extract_path,
            extract_field,
            target_request_path,
            target_request_method,
            target_request_field,
            merge_strategy,
            allow_empty_responses,
            merge_into_field,
        } = config
        else {
            return Err(GatewayError::Internal {
                message: "sequential handler called with parallel config".into(),
            });
        };

        // Step 1: source call inherits the incoming request.
        let source = self
            .caller
            .call(source_backend, request, deadline)
            .await
            .map_err(|e| upstream_of(source_backend, e))?;
        if !source.is_success() {
            return Err(GatewayError::Upstream {
                backend: source_backend.clone(),
                message: format!("source backend answered {}", source.status),
            });
        }

        // Step 2: navigate and extract.
        let source_json = source.json()?;
        let extracted = extract_values(&source_json, extract_path, extract_field);
        debug!(
            "map-reduce extracted {} values from {}.{}",
            extracted.len(),
            extract_path,
            extract_field
        );

        // Step 3: nothing extracted.
        if extracted.is_empty() {
            if *allow_empty_responses {
                return Ok(source.to_http_response());
            }
            return Ok(HttpResponse::NoContent().finish());
        }

        // Step 4: dependent call with a fresh JSON body.
        let method = Method::from_str(target_request_method).unwrap_or(Method::POST);
        let mut payload = Map::new();
        payload.insert(target_request_field.clone(), Value::Array(extracted));
        let body = Value::Object(payload);
        let mut dependent = request.derived(
            method,
            target_request_path,
            Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        );
        dependent.headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );

        let target = match self.caller.call(target_backend, &dependent, deadline).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                warn!(
                    "map-reduce target {} answered {}",
                    target_backend, response.status
                );
                if *allow_empty_responses {
                    return Ok(source.to_http_response());
                }
                return Err(GatewayError::Upstream {
                    backend: target_backend.clone(),
                    message: format!("target backend answered {}", response.status),
                });
            }
            Err(e) => {
                warn!("map-reduce target {} failed: {}", target_backend, e);
                if *allow_empty_responses {
                    return Ok(source.to_http_response());
                }
                return Err(upstream_of(target_backend, e));
            }
        };
        let target_json = target.json()?;

        // Step 5: merge.
        let merged = merge_documents(
            merge_strategy,
            source_backend,
            &source_json,
            target_backend,
            &target_json,
            merge_into_field.as_deref(),
        )?;

        Ok(json_response(&merged))
    }

    async fn handle_parallel(
        &self,
        config: &MapReduceSettings,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<HttpResponse, GatewayError> {
        let MapReduceSettings::Parallel {
            backends,
            join_field,
            merge_strategy,
            filter_on_empty,
            allow_empty_responses,
            merge_into_field,
        } = config
        else {
            return Err(GatewayError::Internal {
                message: "parallel handler called with sequential config".into(),
            });
        };

        let outcomes = join_all(backends.iter().map(|backend_id| {
            let caller = Arc::clone(&self.caller);
            async move {
                let result = caller.call(backend_id, request, deadline).await;
                (backend_id.clone(), result)
            }
        }))
        .await;

        // Successful branches in configured order.
        let mut documents: Vec<(String, Value)> = Vec::new();
        for (backend_id, outcome) in outcomes {
            match outcome {
                Ok(response) if response.is_success() => match response.json() {
                    Ok(value) => documents.push((backend_id, value)),
                    Err(e) => warn!("map-reduce branch {} invalid JSON: {}", backend_id, e),
                },
                Ok(response) => {
                    warn!("map-reduce branch {} answered {}", backend_id, response.status)
                }
                Err(e) => warn!("map-reduce branch {} failed: {}", backend_id, e),
            }
        }

        if documents.is_empty() {
            if *allow_empty_responses {
                return Ok(json_response(&json!({})));
            }
            return Err(GatewayError::Upstream {
                backend: backends.join(","),
                message: "no map-reduce backend responded".into(),
            });
        }

        let merged = match merge_strategy {
            MergeStrategy::Join => {
                let join_field = join_field.as_deref().filter(|f| !f.is_empty()).ok_or(
                    GatewayError::Merge {
                        message: "join strategy requires join_field".into(),
                    },
                )?;
                join_documents(
                    &documents,
                    join_field,
                    *filter_on_empty,
                    merge_into_field.as_deref(),
                )?
            }
            MergeStrategy::Nested => {
                let mut keyed = Map::new();
                for (backend_id, value) in &documents {
                    keyed.insert(backend_id.clone(), value.clone());
                }
                match merge_into_field.as_deref().filter(|f| !f.is_empty()) {
                    Some(field) => json!({ field: Value::Object(keyed) }),
                    None => Value::Object(keyed),
                }
            }
            MergeStrategy::Flat => {
                let mut flat = Map::new();
                for (_, value) in &documents {
                    if let Value::Object(map) = value {
                        for (k, v) in map {
                            flat.insert(k.clone(), v.clone());
                        }
                    }
                }
                Value::Object(flat)
            }
            MergeStrategy::Enrich => {
                let field = merge_into_field
                    .as_deref()
                    .filter(|f| !f.is_empty())
                    .unwrap_or(DEFAULT_ENRICH_FIELD);
                let (_, base) = &documents[0];
                let mut enriched = base
                    .as_object()
                    .cloned()
                    .ok_or_else(|| GatewayError::Merge {
                        message: "enrich requires an object base response".into(),
                    })?;
                let mut extras = Map::new();
                for (backend_id, value) in documents.iter().skip(1) {
                    extras.insert(backend_id.clone(), value.clone());
                }
                enriched.insert(field.to_string(), Value::Object(extras));
                Value::Object(enriched)
            }
        };

        Ok(json_response(&merged))
    }
}

fn upstream_of(backend: &str, error: GatewayError) -> GatewayError {
    match error {
        e @ GatewayError::Timeout { .. } => e,
        e @ GatewayError::CircuitOpen { .. } => e,
        e @ GatewayError::Upstream { .. } => e,
        other => GatewayError::Upstream {
            backend: backend.to_string(),
            message: other.to_string(),
        },
    }
}

fn json_response(value: &Value) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/json")
        .json(value)
}

/// Navigates a dot-separated path and reads `field` from every element at
/// the destination. A single object at the destination contributes one
/// value.
pub fn extract_values(document: &Value, path: &str, field: &str) -> Vec<Value> {
    let mut current = document;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Vec::new(),
        }
    }

    match current {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get(field))
            .filter(|v| !v.is_null())
            .cloned()
            .collect(),
        Value::Object(_) => current
            .get(field)
            .filter(|v| !v.is_null())
            .cloned()
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

/// Merges a source and target document per strategy (sequential mode).
pub fn merge_documents(
    strategy: &MergeStrategy,
    source_id: &str,
    source: &Value,
    target_id: &str,
    target: &Value,
    merge_into_field: Option<&str>,
) -> Result<Value, GatewayError> {
    match strategy {
        MergeStrategy::Nested => Ok(json!({
            source_id: source,
            target_id: target,
        })),
        MergeStrategy::Flat => {
            let mut flat = source.as_object().cloned().unwrap_or_default();
            if let Value::Object(map) = target {
                for (k, v) in map {
                    flat.insert(k.clone(), v.clone());
                }
            }
            Ok(Value::Object(flat))
        }
        MergeStrategy::Enrich => {
            let field = merge_into_field
                .filter(|f| !f.is_empty())
                .unwrap_or(DEFAULT_ENRICH_FIELD);
            let mut enriched = source
                .as_object()
                .cloned()
                .ok_or_else(|| GatewayError::Merge {
                    message: "enrich requires an object source response".into(),
                })?;
            enriched.insert(field.to_string(), target.clone());
            Ok(Value::Object(enriched))
        }
        MergeStrategy::Join => Err(GatewayError::Merge {
            message: "join is not valid in sequential mode".into(),
        }),
    }
}

/// Finds the row collection in a backend document: a top-level array, or an
/// array under `items` / `data`.
fn rows_of(document: &Value) -> Vec<Value> {
    match document {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            for key in ["items", "data"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    return items.clone();
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

// JSON-literal representation: string keys keep their quotes, so "1" and 1
// never collide.
fn join_key_of(value: &Value) -> String {
    value.to_string()
}

/// Row-level join: the first document is the base; every base row is
/// widened with the matching row of each ancillary backend. Base order is
/// preserved.
pub fn join_documents(
    documents: &[(String, Value)],
    join_field: &str,
    filter_on_empty: bool,
    merge_into_field: Option<&str>,
) -> Result<Value, GatewayError> {
    let (_, base_document) = documents.first().ok_or_else(|| GatewayError::Merge {
        message: "join requires at least one response".into(),
    })?;
    let base_rows = rows_of(base_document);

    // Index every ancillary backend's rows by join key.
    let ancillaries: Vec<(String, HashMap<String, Value>)> = documents
        .iter()
        .skip(1)
        .map(|(backend_id, document)| {
            let mut index = HashMap::new();
            for row in rows_of(document) {
                if let Some(key) = row.get(join_field) {
                    index.insert(join_key_of(key), row);
                }
            }
            (backend_id.clone(), index)
        })
        .collect();

    let mut joined = Vec::with_capacity(base_rows.len());
    'rows: for base_row in base_rows {
        let Some(key_value) = base_row.get(join_field) else {
            if filter_on_empty {
                continue;
            }
            joined.push(base_row);
            continue;
        };
        let key = join_key_of(key_value);

        let mut merged = base_row.as_object().cloned().unwrap_or_default();
        let mut nested = Map::new();

        for (backend_id, index) in &ancillaries {
            match index.get(&key) {
                Some(row) => match merge_into_field.filter(|f| !f.is_empty()) {
                    Some(_) => {
                        nested.insert(backend_id.clone(), row.clone());
                    }
                    None => {
                        if let Value::Object(map) = row {
                            for (k, v) in map {
                                if k != join_field {
                                    merged.insert(k.clone(), v.clone());
                                }
                            }
                        }
                    }
                },
                None if filter_on_empty => continue 'rows,
                None => {}
            }
        }

        if let Some(field) = merge_into_field.filter(|f| !f.is_empty()) {
            merged.insert(field.to_string(), Value::Object(nested));
        }
        joined.push(Value::Object(merged));
    }

    Ok(Value::Array(joined))
}
