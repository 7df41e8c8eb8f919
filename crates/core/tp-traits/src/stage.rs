//! Stage trait for per-message processing.

use std::time::Duration;
use tp_error::StageError;
use tp_types::Message;

/// A synchronous per-message processing step.
///
/// # Thread Safety
///
/// Stages must be `Send + Sync`: a dispatcher may call [`process`](Stage::process)
/// for different messages from several threads at once.
pub trait Stage: Send + Sync {
    /// Processes one message, returning a new message.
    ///
    /// The input message is never modified.
    fn process(&self, message: &Message) -> Result<Message, StageError>;

    /// Processes one message within a wall-clock budget set by the caller.
    ///
    /// Stages that can stop an evaluation early should honor `budget` so a
    /// dispatcher giving up on the message also ends the work. The default
    /// ignores it.
    fn process_within(
        &self,
        message: &Message,
        budget: Option<Duration>,
    ) -> Result<Message, StageError> {
        let _ = budget;
        self.process(message)
    }

    /// Returns the name of this stage for logging.
    fn name(&self) -> &str {
        "stage"
    }

    /// Wall-clock budget this stage enforces on each evaluation, if any.
    ///
    /// Dispatchers use it as the default for their own per-message timeout.
    fn budget(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tp_error::EvalError;

    struct Increment;

    impl Stage for Increment {
        fn process(&self, message: &Message) -> Result<Message, StageError> {
            let n = message.payload().as_i64().unwrap_or(0);
            Ok(message.derive(json!(n + 1), message.headers().clone()))
        }
    }

    struct Fail;

    impl Stage for Fail {
        fn process(&self, message: &Message) -> Result<Message, StageError> {
            Err(StageError::new(
                "fail",
                message.id().to_string(),
                EvalError::Runtime("nope".into()),
            ))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Increment.name(), "stage");
        assert!(Increment.budget().is_none());
    }

    #[test]
    fn test_process_within_defaults_to_process() {
        let message = Message::new(1);
        let result = Increment
            .process_within(&message, Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(result.payload(), &json!(2));
    }

    #[test]
    fn test_process_leaves_input_untouched() {
        let message = Message::new(1).with_header("k", "v");
        let result = Increment.process(&message).unwrap();

        assert_eq!(result.payload(), &json!(2));
        assert_eq!(result.header("k"), Some(&json!("v")));
        assert_eq!(message.payload(), &json!(1));
    }

    #[test]
    fn test_usable_as_trait_object() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Increment), Arc::new(Fail)];
        let message = Message::new(1);

        assert!(stages[0].process(&message).is_ok());
        let error = stages[1].process(&message).unwrap_err();
        assert_eq!(error.stage, stages[1].name());
    }
}
