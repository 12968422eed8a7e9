#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("generation aborted by host")]
pub struct HostAborted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// The party answering a generator's interactive requests.
///
/// `confirm`, `ask` and `config` are each called exactly once per request and
/// their answer is written back to the generator before it is read again.
#[mockall::automock]
#[async_trait::async_trait]
pub trait GeneratorHost: std::fmt::Debug + Send + Sync {
    async fn confirm(&self, message: &str) -> Result<bool, HostAborted>;

    async fn ask(&self, message: &str) -> Result<String, HostAborted>;

    /// Configured value for `key`, `None` when unknown.
    async fn config(&self, key: &str) -> Option<String>;

    fn notify(&self, level: NoticeLevel, message: &str);
}
