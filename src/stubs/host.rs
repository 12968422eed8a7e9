use std::collections::HashMap;

use crate::core::traits::generator::{GeneratorHost, HostAborted, NoticeLevel};

/// Non-interactive host: confirms everything, answers every question with a
/// fixed reply and serves `/config` from a map.
#[derive(Debug, Clone, Default)]
pub struct StaticHost {
    answer: String,
    config: HashMap<String, String>,
}

impl StaticHost {
    pub fn new(config: HashMap<String, String>) -> Self {
        Self {
            answer: String::new(),
            config,
        }
    }

    pub fn with_answer(self, answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..self
        }
    }
}

#[async_trait::async_trait]
impl GeneratorHost for StaticHost {
    async fn confirm(&self, message: &str) -> Result<bool, HostAborted> {
        tracing::debug!(prompt = message, "auto-confirming");
        Ok(true)
    }

    async fn ask(&self, message: &str) -> Result<String, HostAborted> {
        tracing::debug!(prompt = message, answer = %self.answer, "auto-answering");
        Ok(self.answer.clone())
    }

    async fn config(&self, key: &str) -> Option<String> {
        self.config.get(key).cloned()
    }

    fn notify(&self, _level: NoticeLevel, _message: &str) {}
}
