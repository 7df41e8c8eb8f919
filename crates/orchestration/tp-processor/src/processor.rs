//! Async driver moving messages from a source through a stage to a sink.

use crate::config::ProcessorConfig;
use crate::stats::ProcessorStats;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tp_error::{classify_error, EvalError, Result, StageCause, StageError, TpError};
use tp_traits::{FailureSink, MessageSink, MessageSource, Stage};
use tp_types::Message;
use tracing::{debug, info, warn};

/// Result of one message: the inbound message and what the stage made of it.
type Outcome = (Message, std::result::Result<Message, StageError>);

/// Runs a [`Stage`] over every message of a source.
///
/// Up to `concurrency` messages are evaluated at once on tokio's blocking
/// pool; results are delivered in completion order. The sink is awaited for
/// every result, so a bounded sink slows the intake down.
pub struct Processor {
    stage: Arc<dyn Stage>,
    config: ProcessorConfig,
}

impl Processor {
    /// Create a new processor.
    pub fn new(stage: Arc<dyn Stage>, config: ProcessorConfig) -> Self {
        Self { stage, config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Per-message limit: the configured timeout, else the stage's own budget.
    pub fn message_timeout(&self) -> Option<Duration> {
        self.config.message_timeout.or_else(|| self.stage.budget())
    }

    /// Processes messages until the source is exhausted.
    ///
    /// Failed messages go to `failures`; they do not stop the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if the source,
    /// sink or failure sink fails.
    pub async fn run<S, K, F>(&self, source: &S, sink: &K, failures: &F) -> Result<ProcessorStats>
    where
        S: MessageSource + ?Sized,
        K: MessageSink + ?Sized,
        F: FailureSink + ?Sized,
    {
        self.config.validate()?;

        let concurrency = self.config.concurrency;
        let timeout = self.message_timeout();
        let mut stats = ProcessorStats::new();

        info!(
            stage = self.stage.name(),
            concurrency,
            timeout = ?timeout,
            "Starting processor"
        );

        let inbound = stream::unfold(source, |source| async move {
            match source.receive().await {
                Ok(Some(message)) => Some((Ok(message), source)),
                Ok(None) => None,
                Err(e) => Some((Err(e), source)),
            }
        });

        let outcomes = inbound
            .map(|received: Result<Message>| {
                let stage = Arc::clone(&self.stage);
                async move {
                    let message = received?;
                    Ok::<_, TpError>(process_one(stage, message, timeout).await)
                }
            })
            .buffer_unordered(concurrency);
        let mut outcomes = std::pin::pin!(outcomes);

        while let Some(outcome) = outcomes.next().await {
            let (inbound, result) = outcome?;
            stats.received += 1;

            match result {
                Ok(outbound) => {
                    sink.send(outbound).await?;
                    stats.emitted += 1;
                }
                Err(error) => {
                    let category = classify_error(&error);
                    if matches!(error.cause, StageCause::Eval(EvalError::Timeout(_))) {
                        stats.timed_out += 1;
                    }
                    warn!(
                        stage = %error.stage,
                        message_id = %error.message_id,
                        kind = %error.kind(),
                        category = ?category,
                        error = %error.cause,
                        "Message failed"
                    );
                    stats.record_failure(category);
                    failures.reject(inbound, error).await?;
                }
            }
        }

        stats.complete();

        info!(
            stage = self.stage.name(),
            received = stats.received,
            emitted = stats.emitted,
            failed = stats.failed,
            "Processor finished"
        );

        Ok(stats)
    }
}

/// Runs the stage for one message on the blocking pool.
///
/// The timeout is also handed to the stage as its evaluation budget, so an
/// abandoned evaluation ends shortly afterwards.
async fn process_one(
    stage: Arc<dyn Stage>,
    message: Message,
    timeout: Option<Duration>,
) -> Outcome {
    let stage_name = stage.name().to_string();
    let message_id = message.id().to_string();
    let inbound = message.clone();

    let task = tokio::task::spawn_blocking(move || stage.process_within(&message, timeout));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!(stage = %stage_name, message_id = %message_id, "Message timed out");
                let error = StageError::new(stage_name, message_id, EvalError::Timeout(limit));
                return (inbound, Err(error));
            }
        },
        None => task.await,
    };

    let result = joined.unwrap_or_else(|e| {
        Err(StageError::new(
            stage_name,
            message_id,
            EvalError::Runtime(format!("stage task failed: {e}")),
        ))
    });

    (inbound, result)
}
