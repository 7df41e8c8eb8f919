//! Error types and classification for the transform processor.
//!
//! This crate provides:
//! - [`TpError`] - Top-level error enum for all processor errors
//! - Domain-specific errors ([`ConfigError`], [`EvalError`], [`StageError`], [`ChannelError`])
//! - [`ErrorKind`] - The per-message failure taxonomy
//! - [`ErrorCategory`] for retry/dead-letter decision making

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the transform processor.
#[derive(Error, Debug)]
pub enum TpError {
    /// Configuration errors (fatal to the stage)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Evaluation errors outside of a stage (direct evaluator use)
    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    /// A message failed inside a stage
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Channel adapter errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Generic errors (wrapped anyhow)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration errors, raised once when a stage is built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Neither an expression nor a script was configured
    #[error("one of 'expression' or 'script' must be set")]
    MissingTransform,

    /// Both an expression and a script were configured
    #[error("'expression' and 'script' are mutually exclusive")]
    ConflictingTransform,

    /// A variable binding is malformed or failed to compile
    #[error("invalid variable binding '{name}': {reason}")]
    InvalidBinding { name: String, reason: String },

    /// A header override is malformed
    #[error("invalid header setting '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    /// Any other invalid setting
    #[error("invalid setting '{setting}': {reason}")]
    InvalidSetting { setting: String, reason: String },
}

/// Errors produced while compiling or evaluating a transformation.
///
/// Every failure of the underlying script engine is converted into one of
/// these variants; nothing from the engine escapes unwrapped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Expression or script text is malformed
    #[error("compilation failed: {0}")]
    Compile(String),

    /// The referenced script could not be read
    #[error("script unavailable: {0}")]
    ScriptUnavailable(String),

    /// The transformation raised during execution
    #[error("execution failed: {0}")]
    Runtime(String),

    /// The result does not have the required payload type
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// The evaluation exceeded its wall-clock budget
    #[error("evaluation exceeded {0:?}")]
    Timeout(Duration),
}

impl EvalError {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Compile(_) | Self::ScriptUnavailable(_) => ErrorKind::Compile,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Why a message failed inside a stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageCause {
    /// Compilation or evaluation failed
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// The transformation returned `()`
    #[error("transformation produced no value")]
    NoValue,
}

/// A per-message failure reported by a stage.
///
/// The stage stays usable after returning one of these; what happens to the
/// failed message is up to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stage '{stage}' failed on message {message_id}: {cause}")]
pub struct StageError {
    /// Name of the failing stage
    pub stage: String,

    /// Id of the inbound message
    pub message_id: String,

    /// Underlying cause
    pub cause: StageCause,
}

impl StageError {
    /// Creates a new stage error.
    pub fn new(
        stage: impl Into<String>,
        message_id: impl Into<String>,
        cause: impl Into<StageCause>,
    ) -> Self {
        Self {
            stage: stage.into(),
            message_id: message_id.into(),
            cause: cause.into(),
        }
    }

    /// Returns the taxonomy kind of this failure.
    pub fn kind(&self) -> ErrorKind {
        match &self.cause {
            StageCause::Eval(e) => e.kind(),
            StageCause::NoValue => ErrorKind::Config,
        }
    }
}

/// Channel adapter errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The other side of the channel is gone
    #[error("channel closed")]
    Closed,

    /// Delivering a message failed
    #[error("send failed: {0}")]
    Send(String),

    /// Receiving a message failed
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Failure taxonomy shared by evaluation and stage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid configuration detected at runtime
    Config,

    /// Malformed or unavailable expression/script
    Compile,

    /// The transformation raised
    Runtime,

    /// Result incompatible with the outbound payload type
    TypeMismatch,

    /// Wall-clock budget exceeded
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config => write!(f, "ConfigError"),
            Self::Compile => write!(f, "CompileError"),
            Self::Runtime => write!(f, "RuntimeError"),
            Self::TypeMismatch => write!(f, "TypeMismatch"),
            Self::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Error classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retrying the same message later may succeed
    ///
    /// Examples: evaluation timeout, script file temporarily unreadable
    Transient,

    /// Retrying the same message will fail again; dead-letter it
    ///
    /// Examples: syntax error, division by zero, type mismatch
    Permanent,
}

/// Classifies a stage failure to determine retry behavior.
pub fn classify_error(error: &StageError) -> ErrorCategory {
    match &error.cause {
        StageCause::Eval(e) => classify_eval_error(e),
        StageCause::NoValue => ErrorCategory::Permanent,
    }
}

fn classify_eval_error(error: &EvalError) -> ErrorCategory {
    match error {
        EvalError::ScriptUnavailable(_) => ErrorCategory::Transient,
        EvalError::Timeout(_) => ErrorCategory::Transient,
        EvalError::Compile(_) => ErrorCategory::Permanent,
        EvalError::Runtime(_) => ErrorCategory::Permanent,
        EvalError::TypeMismatch { .. } => ErrorCategory::Permanent,
    }
}

/// Result type alias using TpError.
pub type Result<T> = std::result::Result<T, TpError>;
