//! Expression/script evaluator.

use crate::builtin::register_builtin_functions;
use crate::conversion::{dynamic_to_value, value_to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Map, OptimizationLevel, Scope, AST};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};
use tp_error::EvalError;
use tp_types::{json_type_name, Headers, Message, PayloadType, TransformSpec};
use tracing::{debug, trace};

/// Names bound from the message into every evaluation context.
pub const RESERVED_BINDINGS: [&str; 4] = ["payload", "headers", "id", "timestamp"];

/// Operations between wall-clock checks in the progress callback.
const DEADLINE_CHECK_INTERVAL: u64 = 256;

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Safety limits applied to the Rhai engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Maximum expression nesting depth at global level
    pub max_expr_depth: usize,

    /// Maximum expression nesting depth inside functions
    pub max_function_expr_depth: usize,

    /// Maximum number of operations per evaluation (0 = unlimited)
    pub max_operations: u64,

    /// Maximum string length in bytes
    pub max_string_size: usize,

    /// Maximum array length
    pub max_array_size: usize,

    /// Maximum map size
    pub max_map_size: usize,

    /// Maximum function call depth
    pub max_call_levels: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_expr_depth: 64,
            max_function_expr_depth: 64,
            max_operations: 100_000,
            max_string_size: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_levels: 16,
        }
    }
}

/// Modification marker of a script file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptFingerprint {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl ScriptFingerprint {
    /// Reads the current marker of the file at `path`.
    pub fn read(path: &Path) -> Result<Self, EvalError> {
        let metadata = fs::metadata(path).map_err(|e| {
            EvalError::ScriptUnavailable(format!("{}: {e}", path.display()))
        })?;
        Ok(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

/// Executable form of a [`TransformSpec`].
///
/// Immutable once built; safe to evaluate from many threads at once.
#[derive(Debug)]
pub struct CompiledTransform {
    spec: TransformSpec,
    ast: AST,
    fingerprint: Option<ScriptFingerprint>,
    compiled_at: Instant,
}

impl CompiledTransform {
    pub fn spec(&self) -> &TransformSpec {
        &self.spec
    }

    /// Script file marker observed before the source was read.
    ///
    /// `None` for expressions.
    pub fn fingerprint(&self) -> Option<ScriptFingerprint> {
        self.fingerprint
    }

    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }
}

/// Variables visible to one evaluation.
///
/// Built fresh for every invocation and never shared between evaluations.
pub struct EvaluationContext {
    scope: Scope<'static>,
    budget: Option<Duration>,
}

impl std::fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("variables", &self.scope.len())
            .field("budget", &self.budget)
            .finish()
    }
}

impl EvaluationContext {
    /// Builds a context binding `payload`, `headers`, `id` and `timestamp`.
    ///
    /// # Errors
    ///
    /// A `null` payload is rejected as a runtime error.
    pub fn from_message(message: &Message) -> Result<Self, EvalError> {
        if message.has_null_payload() {
            return Err(EvalError::Runtime(format!(
                "message {} has a null payload",
                message.id()
            )));
        }

        let mut scope = Scope::new();
        scope.push_dynamic("payload", value_to_dynamic(message.payload()));
        scope.push_dynamic("headers", headers_to_dynamic(message.headers()));
        scope.push("id", message.id().to_string());
        scope.push("timestamp", message.timestamp().to_rfc3339());

        Ok(Self {
            scope,
            budget: None,
        })
    }

    /// Limits every evaluation in this context to `budget` of wall-clock time.
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Binds a JSON value under `name`, replacing any earlier binding.
    pub fn bind(&mut self, name: &str, value: &Value) {
        self.scope.set_or_push(name, value_to_dynamic(value));
    }

    /// Reads the `headers` binding as the transformation left it.
    pub fn headers(&self) -> Result<Headers, EvalError> {
        let headers = self
            .scope
            .get_value::<Dynamic>("headers")
            .unwrap_or(Dynamic::UNIT);
        let type_name = headers.type_name();

        match dynamic_to_value(headers) {
            Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
            Ok(other) => Err(EvalError::TypeMismatch {
                expected: "object for headers".to_string(),
                actual: json_type_name(&other).to_string(),
            }),
            Err(_) => Err(EvalError::TypeMismatch {
                expected: "object for headers".to_string(),
                actual: type_name.to_string(),
            }),
        }
    }
}

fn headers_to_dynamic(headers: &Headers) -> Dynamic {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(name.as_str().into(), value_to_dynamic(value));
    }
    map.into()
}

/// Restores the previous deadline when dropped.
struct DeadlineGuard {
    previous: Option<Instant>,
}

impl DeadlineGuard {
    fn set(budget: Option<Duration>) -> Self {
        // A budget too large to represent means no deadline
        let deadline = budget.and_then(|b| Instant::now().checked_add(b));
        let previous = DEADLINE.with(|d| d.replace(deadline));
        Self { previous }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        DEADLINE.with(|d| d.set(self.previous));
    }
}

/// Compiles and evaluates expressions and scripts with a shared Rhai engine.
pub struct Evaluator {
    engine: Engine,
    limits: EngineLimits,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(EngineLimits::default())
    }
}

impl Evaluator {
    /// Creates an evaluator whose engine enforces `limits`.
    pub fn new(limits: EngineLimits) -> Self {
        let mut engine = Engine::new();

        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth);
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_max_call_levels(limits.max_call_levels);

        // Full optimization may fold registered functions such as uuid() into constants
        engine.set_optimization_level(OptimizationLevel::Simple);

        engine.on_progress(|operations| {
            if operations % DEADLINE_CHECK_INTERVAL != 0 {
                return None;
            }
            DEADLINE.with(|d| match d.get() {
                Some(deadline) if Instant::now() >= deadline => {
                    Some(Dynamic::from("deadline exceeded".to_string()))
                }
                _ => None,
            })
        });

        register_builtin_functions(&mut engine);

        Self { engine, limits }
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    /// Compiles a spec.
    ///
    /// Expressions are compiled in expression-only mode, so statements and
    /// assignments are rejected. Scripts are read from disk; the file marker
    /// is taken before reading so a concurrent edit is never missed.
    pub fn compile(&self, spec: &TransformSpec) -> Result<CompiledTransform, EvalError> {
        let (ast, fingerprint) = match spec {
            TransformSpec::Expression(text) => {
                let ast = self
                    .engine
                    .compile_expression(text)
                    .map_err(|e| EvalError::Compile(format!("{text}: {e}")))?;
                (ast, None)
            }
            TransformSpec::Script(script) => {
                let path = script.path();
                let fingerprint = ScriptFingerprint::read(path)?;
                let source = fs::read_to_string(path).map_err(|e| {
                    EvalError::ScriptUnavailable(format!("{}: {e}", path.display()))
                })?;
                let ast = self
                    .engine
                    .compile(&source)
                    .map_err(|e| EvalError::Compile(format!("{}: {e}", path.display())))?;
                (ast, Some(fingerprint))
            }
        };

        debug!(spec = %spec.describe(), "Compiled transform");

        Ok(CompiledTransform {
            spec: spec.clone(),
            ast,
            fingerprint,
            compiled_at: Instant::now(),
        })
    }

    /// Evaluates `compiled` against a message.
    ///
    /// A `()` result is returned as `Value::Null`.
    pub fn evaluate(
        &self,
        compiled: &CompiledTransform,
        message: &Message,
    ) -> Result<Value, EvalError> {
        let mut context = EvaluationContext::from_message(message)?;
        self.evaluate_in(compiled, &mut context)
    }

    /// Evaluates `compiled` in an existing context.
    ///
    /// Scripts may change variables in the context; callers read them back
    /// afterwards (see [`EvaluationContext::headers`]).
    pub fn evaluate_in(
        &self,
        compiled: &CompiledTransform,
        context: &mut EvaluationContext,
    ) -> Result<Value, EvalError> {
        let result = {
            let _deadline = DeadlineGuard::set(context.budget);
            self.engine
                .eval_ast_with_scope::<Dynamic>(&mut context.scope, &compiled.ast)
        };

        let result = result.map_err(|e| map_eval_error(*e, context.budget))?;
        trace!(result_type = result.type_name(), "Evaluated transform");

        dynamic_to_value(result).map_err(|actual| EvalError::TypeMismatch {
            expected: "a JSON-representable value".to_string(),
            actual,
        })
    }
}

fn map_eval_error(error: EvalAltResult, budget: Option<Duration>) -> EvalError {
    if is_terminated(&error) {
        return EvalError::Timeout(budget.unwrap_or_default());
    }
    match error {
        EvalAltResult::ErrorMismatchOutputType(expected, actual, _) => {
            EvalError::TypeMismatch { expected, actual }
        }
        other => EvalError::Runtime(other.to_string()),
    }
}

// Termination inside a script function arrives wrapped in the call error
fn is_terminated(error: &EvalAltResult) -> bool {
    match error {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_terminated(inner),
        _ => false,
    }
}

/// Checks that `value` has the required payload shape.
pub fn ensure_payload_type(value: &Value, expected: PayloadType) -> Result<(), EvalError> {
    if expected.accepts(value) {
        Ok(())
    } else {
        Err(EvalError::TypeMismatch {
            expected: expected.to_string(),
            actual: json_type_name(value).to_string(),
        })
    }
}
