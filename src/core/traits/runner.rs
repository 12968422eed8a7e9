use crate::core::domain::{RunRequest, RunResult};

/// Executes one program under resource limits.
///
/// Implementations never fail: launch problems, limit breaches and crashes
/// are all reported through [`RunResult::cause`](crate::core::domain::RunResult).
/// A child process must not outlive the returned future, whether it resolves
/// or is dropped.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Runner: std::fmt::Debug + Send + Sync {
    async fn run(&self, request: RunRequest) -> RunResult;
}
