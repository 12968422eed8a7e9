use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::process::Command;
use tracing::Instrument;

use crate::core::domain::{CommandSpec, ExecutionLimits};
use crate::core::traits::generator::{GeneratorHost, NoticeLevel};
use crate::generator::interpreter::{ProtocolEvent, ProtocolInterpreter, State};
use crate::generator::suite::{GeneratedSuite, GenerationError, ResultCollector};
use crate::generator::transport::LineTransport;
use crate::native::ProcessGroup;

/// Runs a generator program to completion and collects the test cases it
/// emits. The generator's process group is killed once generation ends,
/// fails, or the future is dropped.
#[derive(Debug, Clone)]
pub struct GeneratorSession {
    command: CommandSpec,
    defaults: ExecutionLimits,
}

impl GeneratorSession {
    pub fn new(command: CommandSpec, defaults: ExecutionLimits) -> Self {
        Self { command, defaults }
    }

    pub async fn generate(&self, host: &dyn GeneratorHost) -> Result<GeneratedSuite, GenerationError> {
        let span = tracing::info_span!("generate", command = %self.command);
        self.execute(host).instrument(span).await
    }

    async fn execute(&self, host: &dyn GeneratorHost) -> Result<GeneratedSuite, GenerationError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "UTF8")
            .kill_on_drop(true);
        if let Some(dir) = &self.command.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| GenerationError::Launch {
            command: self.command.to_string(),
            source,
        })?;
        let _group = ProcessGroup::new(child.id());
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(GenerationError::Launch {
                command: self.command.to_string(),
                source: std::io::Error::other("generator pipes unavailable"),
            });
        };

        let stderr = tokio::spawn(async move {
            let mut collected = Vec::new();
            let mut stderr = stderr;
            if let Err(e) = stderr.read_to_end(&mut collected).await {
                tracing::debug!(error = %e, "failed to read generator stderr");
            }
            String::from_utf8_lossy(&collected).into_owned()
        });

        let mut interpreter =
            ProtocolInterpreter::new(LineTransport::new(BufReader::new(stdout), stdin));
        let mut collector = ResultCollector::new();
        drive(&mut interpreter, host, &mut collector).await?;
        if let Err(e) = interpreter.close_input().await {
            tracing::debug!(error = %e, "generator input already closed");
        }

        let status = child.wait().await.map_err(|e| GenerationError::GeneratorFailed {
            status: "unknown status".to_string(),
            stderr: e.to_string(),
        })?;
        if !status.success() {
            let stderr = stderr.await.unwrap_or_default();
            tracing::warn!(%status, "generator failed");
            return Err(GenerationError::GeneratorFailed {
                status: status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }

        let suite = collector.finish(&self.defaults)?;
        tracing::info!(cases = suite.cases.len(), "generation finished");
        Ok(suite)
    }
}

/// Feeds interpreter events to `host` and `collector` until the generator's
/// output ends. Replies are written before the next line is read.
pub async fn drive<R, W>(
    interpreter: &mut ProtocolInterpreter<R, W>,
    host: &dyn GeneratorHost,
    collector: &mut ResultCollector,
) -> Result<(), GenerationError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(event) = interpreter.next_event().await? {
        match event {
            ProtocolEvent::Confirm(message) => {
                let accepted = host.confirm(&message).await?;
                interpreter.reply_confirm(accepted).await?;
            }
            ProtocolEvent::Ask(message) => {
                let answer = host.ask(&message).await?;
                interpreter.reply(&answer).await?;
            }
            ProtocolEvent::ConfigQuery(key) => {
                let value = host.config(&key).await;
                if value.is_none() {
                    tracing::debug!(key = %key, "unknown config key requested");
                }
                interpreter.reply(&value.unwrap_or_default()).await?;
            }
            ProtocolEvent::Info(message) => {
                tracing::info!(text = %message, "generator");
                host.notify(NoticeLevel::Info, &message);
            }
            ProtocolEvent::Warn(message) => {
                tracing::warn!(text = %message, "generator");
                host.notify(NoticeLevel::Warn, &message);
            }
            ProtocolEvent::Error(message) => {
                tracing::error!(text = %message, "generator");
                host.notify(NoticeLevel::Error, &message);
            }
            ProtocolEvent::EnterResultMode => tracing::debug!("generator entered result mode"),
            ProtocolEvent::ResultBlock(key, content) => {
                tracing::debug!(%key, lines = content.len(), "result block");
                collector.push(key, content);
            }
        }
    }
    if interpreter.state() == State::Normal {
        tracing::warn!("generator output ended before `/result`");
    }
    Ok(())
}
