use std::time::Duration;

use crate::core::{
    domain::{RunRequest, RunResult},
    traits::runner::Runner,
};

/// Answers every run with the same result after a fixed delay.
#[derive(Debug, Clone)]
pub struct RunnerStub {
    result: RunResult,
    delay: Duration,
}

impl RunnerStub {
    pub fn new(result: RunResult, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl Runner for RunnerStub {
    #[tracing::instrument(skip(request), fields(run_id = %request.id))]
    async fn run(&self, request: RunRequest) -> RunResult {
        tracing::debug!(
            "Start execution: command={}, input_len={}, limits={:?}",
            request.command,
            request.input.len(),
            request.limits
        );
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Execution result: {:?}", self.result.cause);

        self.result.clone()
    }
}
