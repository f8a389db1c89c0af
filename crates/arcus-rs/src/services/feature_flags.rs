//! Feature flag evaluation.
//!
//! Evaluators are consulted in weight order (lower weight first). An
//! evaluator may abstain with [`FlagError::NoDecision`], which hands the
//! question to the next evaluator; the built-in config evaluator sits at
//! weight 1000 as the fallback. External evaluators are always registered
//! *into* the aggregator - calling one directly would skip the fallback
//! chain and break abstention semantics.

use crate::models::events::{EventEmitter, GatewayEvent};
use crate::services::config_store::ConfigStore;
use futures::future::BoxFuture;
use log::{error, warn};
use std::sync::{Arc, RwLock};

/// Weight of the built-in config evaluator. External evaluators register
/// below this to take priority.
pub const CONFIG_EVALUATOR_WEIGHT: i32 = 1000;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FlagError {
    /// The evaluator has no opinion on this flag; ask the next one.
    #[error("evaluator abstained")]
    NoDecision,
    /// Stop the chain and surface the failure.
    #[error("evaluator fatal error: {0}")]
    Fatal(String),
    /// Recoverable evaluator failure; logged, then the next evaluator runs.
    #[error("evaluator error: {0}")]
    Evaluation(String),
    /// Every evaluator abstained.
    #[error("no evaluator made a decision")]
    NoEvaluatorDecision,
}

/// Minimal request context evaluators may inspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagContext<'a> {
    pub method: &'a str,
    pub path: &'a str,
}

/// One entry in the evaluation chain.
pub trait FeatureFlagEvaluator: Send + Sync {
    fn evaluate_flag<'a>(
        &'a self,
        flag_id: &'a str,
        tenant_id: Option<&'a str>,
        ctx: &'a FlagContext<'a>,
    ) -> BoxFuture<'a, Result<bool, FlagError>>;
}

struct RegisteredEvaluator {
    weight: i32,
    name: String,
    evaluator: Arc<dyn FeatureFlagEvaluator>,
}

/// Priority-ordered evaluator chain with abstention semantics.
pub struct FeatureFlagAggregator {
    evaluators: RwLock<Vec<RegisteredEvaluator>>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl FeatureFlagAggregator {
    /// Builds an aggregator with the config evaluator pre-registered at
    /// weight 1000.
    pub fn new(store: Arc<ConfigStore>, emitter: Option<Arc<dyn EventEmitter>>) -> Self {
        let aggregator = Self {
            evaluators: RwLock::new(Vec::new()),
            emitter,
        };
        aggregator.register_evaluator(
            "config",
            CONFIG_EVALUATOR_WEIGHT,
            Arc::new(ConfigEvaluator::new(store)),
        );
        aggregator
    }

    /// Registers an evaluator under the given identifier and weight. Lower
    /// weight means higher priority.
    pub fn register_evaluator(
        &self,
        name: &str,
        weight: i32,
        evaluator: Arc<dyn FeatureFlagEvaluator>,
    ) {
        let mut evaluators = self.evaluators.write().unwrap();
        evaluators.push(RegisteredEvaluator {
            weight,
            name: name.to_string(),
            evaluator,
        });
        evaluators.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.name.cmp(&b.name)));
    }

    pub fn evaluator_names(&self) -> Vec<(String, i32)> {
        self.evaluators
            .read()
            .unwrap()
            .iter()
            .map(|e| (e.name.clone(), e.weight))
            .collect()
    }

    /// Walks the chain until an evaluator decides.
    ///
    /// Abstentions fall through; recoverable errors are logged and fall
    /// through; a fatal error stops the chain. When every evaluator
    /// abstains the result is [`FlagError::NoEvaluatorDecision`].
    pub async fn evaluate_flag(
        &self,
        flag_id: &str,
        tenant_id: Option<&str>,
        ctx: &FlagContext<'_>,
    ) -> Result<bool, FlagError> {
        let chain: Vec<(String, Arc<dyn FeatureFlagEvaluator>)> = {
            let evaluators = self.evaluators.read().unwrap();
            evaluators
                .iter()
                .map(|e| (e.name.clone(), Arc::clone(&e.evaluator)))
                .collect()
        };

        for (name, evaluator) in chain {
            match evaluator.evaluate_flag(flag_id, tenant_id, ctx).await {
                Ok(value) => {
                    self.emit_evaluated(flag_id, tenant_id, value, &name);
                    return Ok(value);
                }
                Err(FlagError::NoDecision) => continue,
                Err(FlagError::Fatal(msg)) => {
                    error!("evaluator '{}' fatal error for flag '{}': {}", name, flag_id, msg);
                    return Err(FlagError::Fatal(msg));
                }
                Err(err) => {
                    warn!(
                        "evaluator '{}' failed for flag '{}': {} - continuing",
                        name, flag_id, err
                    );
                    continue;
                }
            }
        }

        Err(FlagError::NoEvaluatorDecision)
    }

    /// Like [`evaluate_flag`], falling back to `default` when no evaluator
    /// decides (or the chain fails fatally).
    ///
    /// [`evaluate_flag`]: FeatureFlagAggregator::evaluate_flag
    pub async fn evaluate_flag_with_default(
        &self,
        flag_id: &str,
        tenant_id: Option<&str>,
        ctx: &FlagContext<'_>,
        default: bool,
    ) -> bool {
        match self.evaluate_flag(flag_id, tenant_id, ctx).await {
            Ok(value) => value,
            Err(FlagError::Fatal(msg)) => {
                error!(
                    "flag '{}' evaluation failed fatally ({}), using default {}",
                    flag_id, msg, default
                );
                default
            }
            Err(_) => {
                self.emit_evaluated(flag_id, tenant_id, default, "default");
                default
            }
        }
    }

    fn emit_evaluated(&self, flag_id: &str, tenant_id: Option<&str>, value: bool, source: &str) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(GatewayEvent::FeatureFlagEvaluated {
                flag_id: flag_id.to_string(),
                tenant_id: tenant_id.map(String::from),
                value,
                source: source.to_string(),
            });
        }
    }
}

/// Built-in evaluator backed by the configuration's flag map.
///
/// Looks up the tenant's merged flag map first (the overlay merge already
/// layered tenant flags over global ones) and abstains when the flag is not
/// configured at all.
pub struct ConfigEvaluator {
    store: Arc<ConfigStore>,
}

impl ConfigEvaluator {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }
}

impl FeatureFlagEvaluator for ConfigEvaluator {
    fn evaluate_flag<'a>(
        &'a self,
        flag_id: &'a str,
        tenant_id: Option<&'a str>,
        _ctx: &'a FlagContext<'a>,
    ) -> BoxFuture<'a, Result<bool, FlagError>> {
        Box::pin(async move {
            let settings = self.store.effective(tenant_id);
            match settings.feature_flags.flags.get(flag_id) {
                Some(value) => Ok(*value),
                None => Err(FlagError::NoDecision),
            }
        })
    }
}
