//! Sequential attempts of the same step.

use super::{BoxStep, RunState, Step};
use crate::cancellation::CancellationToken;
use crate::errors::Result;
use async_trait::async_trait;
use tracing::debug;

/// Runs each attempt in order until one succeeds.
///
/// The result is the last attempt's. Cancellation stops the sequence.
#[derive(Debug)]
pub struct RetryStep {
    attempts: Vec<BoxStep>,
}

impl RetryStep {
    /// Creates the step from its attempts.
    #[must_use]
    pub fn new(attempts: Vec<BoxStep>) -> Self {
        Self { attempts }
    }
}

#[async_trait]
impl Step for RetryStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        let mut last = Ok(false);

        for (index, attempt) in self.attempts.iter().enumerate() {
            last = attempt.run(ctx, state).await;

            match &last {
                Ok(true) => break,
                Err(err) if err.is_cancelled() => break,
                _ if ctx.is_cancelled() => break,
                _ => debug!(attempt = index + 1, "retry attempt did not succeed"),
            }
        }

        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{run_state, FakeStep};

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let a = FakeStep::failing();
        let b = FakeStep::succeeding();
        let c = FakeStep::succeeding();
        let step = RetryStep::new(vec![Box::new(a.clone()), Box::new(b.clone()), Box::new(c.clone())]);

        assert!(step.run(&CancellationToken::new(), &run_state()).await.unwrap());
        assert_eq!((a.runs(), b.runs(), c.runs()), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_result_is_last_attempt() {
        let step = RetryStep::new(vec![
            Box::new(FakeStep::succeeding()),
            Box::new(FakeStep::failing()),
        ]);
        assert!(step.run(&CancellationToken::new(), &run_state()).await.unwrap());

        let step = RetryStep::new(vec![
            Box::new(FakeStep::erroring("first")),
            Box::new(FakeStep::failing()),
        ]);
        assert!(!step.run(&CancellationToken::new(), &run_state()).await.unwrap());

        let step = RetryStep::new(vec![
            Box::new(FakeStep::failing()),
            Box::new(FakeStep::erroring("last")),
        ]);
        let err = step.run(&CancellationToken::new(), &run_state()).await.unwrap_err();
        assert_eq!(err.to_string(), "last");
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let next = FakeStep::succeeding();
        let step = RetryStep::new(vec![Box::new(FakeStep::cancelled()), Box::new(next.clone())]);
        let err = step.run(&CancellationToken::new(), &run_state()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(next.runs(), 0);
    }
}
