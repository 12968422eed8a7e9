use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitsError {
    #[error("time limit must be positive")]
    ZeroTime,
    #[error("memory limit must be positive")]
    ZeroMemory,
    #[error("output limit must be positive")]
    ZeroOutput,
}

/// Resource ceilings for a single run.
///
/// Both `time_ms` and `memory_bytes` are strictly positive; the fields are
/// private so the only way to get a value is through [`ExecutionLimits::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    time_ms: u64,
    memory_bytes: u64,
    output_bytes: Option<u64>,
}

impl ExecutionLimits {
    pub fn new(time_ms: u64, memory_bytes: u64) -> Result<Self, LimitsError> {
        if time_ms == 0 {
            return Err(LimitsError::ZeroTime);
        }
        if memory_bytes == 0 {
            return Err(LimitsError::ZeroMemory);
        }
        Ok(Self {
            time_ms,
            memory_bytes,
            output_bytes: None,
        })
    }

    pub fn with_output_bytes(self, output_bytes: Option<u64>) -> Result<Self, LimitsError> {
        if output_bytes == Some(0) {
            return Err(LimitsError::ZeroOutput);
        }
        Ok(Self {
            output_bytes,
            ..self
        })
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn time(&self) -> Duration {
        Duration::from_millis(self.time_ms)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn output_bytes(&self) -> Option<u64> {
        self.output_bytes
    }
}

/// Partial limits layered over a base, e.g. command line flags or a fixture's
/// `limit` section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    pub time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self.time_ms.is_none() && self.memory_bytes.is_none()
    }

    pub fn apply(&self, base: ExecutionLimits) -> Result<ExecutionLimits, LimitsError> {
        ExecutionLimits::new(
            self.time_ms.unwrap_or(base.time_ms()),
            self.memory_bytes.unwrap_or(base.memory_bytes()),
        )?
        .with_output_bytes(base.output_bytes())
    }
}

/// A fully resolved program invocation. Language resolution happens before
/// a value of this type exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Convenience for `sh -c <script>`.
    pub fn shell<S: Into<String>>(script: S) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub id: Uuid,
    pub command: CommandSpec,
    pub input: Vec<u8>,
    pub limits: ExecutionLimits,
}

impl RunRequest {
    pub fn new(command: CommandSpec, input: impl Into<Vec<u8>>, limits: ExecutionLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            input: input.into(),
            limits,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminationCause {
    Completed,
    TimeExceeded,
    MemoryExceeded,
    OutputExceeded,
    LaunchFailed { msg: String },
    Crashed { signal: Option<i32> },
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Present only when `cause` is [`TerminationCause::Completed`].
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub peak_memory_usage_bytes: Option<u64>,
    pub cause: TerminationCause,
}

impl RunResult {
    pub fn launch_failed(msg: impl Into<String>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            execution_time_ms: 0,
            peak_memory_usage_bytes: None,
            cause: TerminationCause::LaunchFailed { msg: msg.into() },
        }
    }

    #[cfg(test)]
    pub fn completed(stdout: impl Into<Vec<u8>>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            exit_code: Some(exit_code),
            execution_time_ms: 0,
            peak_memory_usage_bytes: None,
            cause: TerminationCause::Completed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestCaseId(String);

impl TestCaseId {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn indexed(prefix: &str, index: usize) -> Self {
        Self(format!("{prefix}#{}", index + 1))
    }
}

impl fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCaseSpec {
    pub limits: Option<ExecutionLimits>,
    pub input: String,
    pub answer: String,
}

impl TestCaseSpec {
    pub fn new(input: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            limits: None,
            input: input.into(),
            answer: answer.into(),
        }
    }

    /// Builds a case from protocol block lines. Non-empty content gets a
    /// trailing newline so line-oriented candidates see a terminated last line.
    pub fn from_lines(input: &[String], answer: &[String]) -> Self {
        Self::new(join_lines(input), join_lines(answer))
    }

    pub fn with_limits(self, limits: Option<ExecutionLimits>) -> Self {
        Self { limits, ..self }
    }
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    InternalError,
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub(crate) fn severity(&self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::MemoryLimitExceeded => 1,
            Self::TimeLimitExceeded => 2,
            Self::OutputLimitExceeded => 3,
            Self::WrongAnswer => 4,
            Self::RuntimeError => 5,
            Self::InternalError => 6,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Verdict {
    pub id: TestCaseId,
    pub outcome: Outcome,
    pub execution_time_ms: u64,
    pub peak_memory_usage_bytes: Option<u64>,
    pub diff: Option<String>,
    pub message: Option<String>,
    pub judged_at: chrono::DateTime<chrono::Utc>,
}

impl Verdict {
    pub fn internal_error(id: TestCaseId, msg: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::InternalError,
            execution_time_ms: 0,
            peak_memory_usage_bytes: None,
            diff: None,
            message: Some(msg.into()),
            judged_at: chrono::Utc::now(),
        }
    }
}

/// Aggregate over a judged suite.
#[derive(Clone, Debug, Default)]
pub struct Summary {
    pub accepted: usize,
    pub total: usize,
    pub total_time_ms: u64,
    pub total_memory_bytes: u64,
    measured_memory: usize,
    worst: Option<Outcome>,
}

impl Summary {
    pub fn update(&mut self, verdict: &Verdict) {
        self.total += 1;
        self.total_time_ms += verdict.execution_time_ms;
        if let Some(memory) = verdict.peak_memory_usage_bytes {
            self.total_memory_bytes += memory;
            self.measured_memory += 1;
        }
        if verdict.outcome.is_accepted() {
            self.accepted += 1;
        }
        let worse = self
            .worst
            .is_none_or(|worst| verdict.outcome.severity() > worst.severity());
        if worse {
            self.worst = Some(verdict.outcome);
        }
    }

    pub fn worst(&self) -> Option<Outcome> {
        self.worst
    }

    pub fn all_accepted(&self) -> bool {
        self.total > 0 && self.accepted == self.total
    }

    pub fn score(&self) -> usize {
        if self.total == 0 {
            return 0;
        }
        self.accepted * 100 / self.total
    }

    pub fn average_time_ms(&self) -> u64 {
        if self.total == 0 {
            return 0;
        }
        self.total_time_ms / self.total as u64
    }

    pub fn average_memory_bytes(&self) -> Option<u64> {
        if self.measured_memory == 0 {
            return None;
        }
        Some(self.total_memory_bytes / self.measured_memory as u64)
    }
}

impl<'a> FromIterator<&'a Verdict> for Summary {
    fn from_iter<I: IntoIterator<Item = &'a Verdict>>(iter: I) -> Self {
        let mut summary = Summary::default();
        for verdict in iter {
            summary.update(verdict);
        }
        summary
    }
}
