//! TransformStage - evaluates a configured transformation for every message.

use crate::config::{HeaderPolicy, TransformConfig, VariableBinding};
use crate::stats::{StageStats, StageStatsSnapshot};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tp_error::{ConfigError, EvalError, StageCause, StageError};
use tp_script::{
    ensure_payload_type, CompiledTransform, EvaluationCache, EvaluationContext, Evaluator,
    RESERVED_BINDINGS,
};
use tp_traits::{Stage, VariableGenerator};
use tp_types::{Headers, Message, PayloadType, TransformSpec};
use tracing::{debug, error, trace, warn};

/// A configured variable, ready for evaluation.
#[derive(Debug)]
enum Binding {
    Literal(Value),
    Expression(Arc<CompiledTransform>),
}

/// Stage that replaces each message's payload with the result of a transformation.
///
/// `process` takes `&self` and may be called from many threads at once. The
/// stage holds no per-message state besides its counters.
pub struct TransformStage {
    name: String,
    spec: TransformSpec,
    cache: Arc<EvaluationCache>,
    bindings: Vec<(String, Binding)>,
    generator: Option<Arc<dyn VariableGenerator>>,
    header_policy: HeaderPolicy,
    set_headers: Headers,
    remove_headers: Vec<String>,
    output_type: PayloadType,
    timeout: Option<Duration>,
    no_value_reported: AtomicBool,
    stats: StageStats,
}

impl std::fmt::Debug for TransformStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStage")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("header_policy", &self.header_policy)
            .field("output_type", &self.output_type)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TransformStage {
    /// Creates a stage that compiles through a shared cache.
    ///
    /// The cache's evaluator limits apply; `config.limits` and `config.cache`
    /// are only used by [`from_config`](Self::from_config).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Neither or both of expression and script are set
    /// - A variable binding or header setting is invalid
    /// - A binding expression fails to compile
    ///
    /// A main transformation that fails to compile is only logged here; the
    /// failure is reported again for every message.
    pub fn new(
        config: &TransformConfig,
        cache: Arc<EvaluationCache>,
        generator: Option<Arc<dyn VariableGenerator>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let spec = config.spec()?;

        let mut bindings = Vec::with_capacity(config.variables.len());
        for (name, binding) in &config.variables {
            let binding = match binding {
                VariableBinding::Value(value) => Binding::Literal(value.clone()),
                VariableBinding::Expression { expression } => {
                    let compiled = cache
                        .get_or_compile(&TransformSpec::expression(expression.clone()))
                        .map_err(|e| ConfigError::InvalidBinding {
                            name: name.clone(),
                            reason: e.to_string(),
                        })?;
                    Binding::Expression(compiled)
                }
            };
            bindings.push((name.clone(), binding));
        }

        if let Err(e) = cache.get_or_compile(&spec) {
            warn!(
                stage = %config.name,
                spec = %spec.describe(),
                error = %e,
                "Transformation does not compile yet; messages will fail until it does"
            );
        }

        debug!(
            stage = %config.name,
            spec = %spec.describe(),
            variables = bindings.len(),
            header_policy = ?config.header_policy,
            "Created TransformStage"
        );

        Ok(Self {
            name: config.name.clone(),
            spec,
            cache,
            bindings,
            generator,
            header_policy: config.header_policy,
            set_headers: config.set_headers.clone(),
            remove_headers: config.remove_headers.clone(),
            output_type: config.output_type,
            timeout: config.timeout,
            no_value_reported: AtomicBool::new(false),
            stats: StageStats::new(),
        })
    }

    /// Creates a stage with its own evaluator and cache built from `config`.
    pub fn from_config(
        config: &TransformConfig,
        generator: Option<Arc<dyn VariableGenerator>>,
    ) -> Result<Self, ConfigError> {
        let evaluator = Arc::new(Evaluator::new(config.limits.clone()));
        let cache = Arc::new(EvaluationCache::with_config(evaluator, config.cache.clone()));
        Self::new(config, cache, generator)
    }

    pub fn spec(&self) -> &TransformSpec {
        &self.spec
    }

    pub fn cache(&self) -> &Arc<EvaluationCache> {
        &self.cache
    }

    pub fn stats(&self) -> StageStatsSnapshot {
        self.stats.snapshot()
    }

    /// Transforms one message into a new one.
    ///
    /// The inbound message is never modified. A failure leaves the stage
    /// ready for the next message.
    pub fn process(&self, message: &Message) -> Result<Message, StageError> {
        self.process_within(message, None)
    }

    /// Like [`process`](Self::process), with the evaluation deadline set to
    /// the tighter of the configured timeout and `budget`.
    pub fn process_within(
        &self,
        message: &Message,
        budget: Option<Duration>,
    ) -> Result<Message, StageError> {
        let budget = match (self.timeout, budget) {
            (Some(own), Some(caller)) => Some(own.min(caller)),
            (own, caller) => own.or(caller),
        };

        let started = Instant::now();
        let result = self.transform(message, budget);

        match &result {
            Ok(_) => self.stats.record_success(started.elapsed()),
            Err(e) => {
                trace!(
                    stage = %self.name,
                    message_id = %message.id(),
                    error = %e,
                    "Transform failed"
                );
                self.stats.record_failure(e.kind(), started.elapsed());
            }
        }
        result
    }

    fn transform(
        &self,
        message: &Message,
        budget: Option<Duration>,
    ) -> Result<Message, StageError> {
        let mut context = EvaluationContext::from_message(message)
            .map_err(|e| self.fail(message, e))?
            .with_budget(budget);

        let compiled = self
            .cache
            .get_or_compile(&self.spec)
            .map_err(|e| self.fail(message, e))?;

        self.bind_variables(message, &mut context)
            .map_err(|e| self.fail(message, e))?;

        let evaluator = self.cache.evaluator();
        let payload = evaluator
            .evaluate_in(&compiled, &mut context)
            .map_err(|e| self.fail(message, e))?;

        if payload.is_null() {
            if !self.no_value_reported.swap(true, Ordering::Relaxed) {
                error!(
                    stage = %self.name,
                    spec = %self.spec.describe(),
                    "Transformation produced no value; check that it returns a result"
                );
            }
            return Err(self.fail(message, StageCause::NoValue));
        }

        ensure_payload_type(&payload, self.output_type).map_err(|e| self.fail(message, e))?;

        let headers = self
            .outbound_headers(message, &context)
            .map_err(|e| self.fail(message, e))?;

        trace!(stage = %self.name, message_id = %message.id(), "Transformed message");
        Ok(message.derive(payload, headers))
    }

    fn bind_variables(
        &self,
        message: &Message,
        context: &mut EvaluationContext,
    ) -> Result<(), EvalError> {
        let evaluator = self.cache.evaluator();

        for (name, binding) in &self.bindings {
            let value = match binding {
                Binding::Literal(value) => value.clone(),
                Binding::Expression(compiled) => evaluator.evaluate_in(compiled, context)?,
            };
            context.bind(name, &value);
        }

        if let Some(generator) = &self.generator {
            for (name, value) in generator.generate(message) {
                if RESERVED_BINDINGS.contains(&name.as_str()) {
                    debug!(
                        stage = %self.name,
                        variable = %name,
                        "Ignoring generated variable shadowing a message binding"
                    );
                    continue;
                }
                context.bind(&name, &value);
            }
        }

        Ok(())
    }

    fn outbound_headers(
        &self,
        message: &Message,
        context: &EvaluationContext,
    ) -> Result<Headers, EvalError> {
        let mut headers = match self.header_policy {
            HeaderPolicy::Preserve => message.headers().clone(),
            HeaderPolicy::Discard => Headers::new(),
            HeaderPolicy::Script => context.headers()?,
        };

        headers.extend(
            self.set_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        for name in &self.remove_headers {
            headers.remove(name);
        }

        Ok(headers)
    }

    fn fail(&self, message: &Message, cause: impl Into<StageCause>) -> StageError {
        StageError::new(&self.name, message.id().to_string(), cause)
    }
}

impl Stage for TransformStage {
    fn process(&self, message: &Message) -> Result<Message, StageError> {
        TransformStage::process(self, message)
    }

    fn process_within(
        &self,
        message: &Message,
        budget: Option<Duration>,
    ) -> Result<Message, StageError> {
        TransformStage::process_within(self, message, budget)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn budget(&self) -> Option<Duration> {
        self.timeout
    }
}
