use crate::core::domain::{ExecutionLimits, LimitsError, TestCaseSpec};
use crate::core::traits::generator::HostAborted;
use crate::generator::interpreter::{BlockKey, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("failed to launch generator `{command}`")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Aborted(#[from] HostAborted),
    #[error("generator exited with {status}: {stderr}")]
    GeneratorFailed { status: String, stderr: String },
    #[error("generator produced no `{0}` block")]
    MissingBlock(BlockKey),
    #[error("invalid limit block `{content}`: {reason}")]
    InvalidLimit { content: String, reason: String },
}

/// What a generator run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSuite {
    /// Built from the most recent `limit`, `input` and `answer` blocks.
    pub latest: TestCaseSpec,
    /// Every `input`/`answer` pair in emission order, all sharing the latest limits.
    pub cases: Vec<TestCaseSpec>,
}

/// Folds `ResultBlock` events into test cases. Later blocks of the same key
/// replace earlier ones for [`GeneratedSuite::latest`].
#[derive(Debug, Default)]
pub struct ResultCollector {
    limit: Option<Vec<String>>,
    inputs: Vec<Vec<String>>,
    answers: Vec<Vec<String>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: BlockKey, content: Vec<String>) {
        match key {
            BlockKey::Limit => self.limit = Some(content),
            BlockKey::Input => self.inputs.push(content),
            BlockKey::Answer => self.answers.push(content),
        }
    }

    /// `defaults` fill in whatever a `limit` block leaves unspecified.
    pub fn finish(self, defaults: &ExecutionLimits) -> Result<GeneratedSuite, GenerationError> {
        let input = self
            .inputs
            .last()
            .ok_or(GenerationError::MissingBlock(BlockKey::Input))?;
        let answer = self
            .answers
            .last()
            .ok_or(GenerationError::MissingBlock(BlockKey::Answer))?;
        let limits = self
            .limit
            .map(|content| parse_limit(&content, defaults))
            .transpose()?;

        Ok(GeneratedSuite {
            latest: TestCaseSpec::from_lines(input, answer).with_limits(limits),
            cases: self
                .inputs
                .iter()
                .zip(&self.answers)
                .map(|(input, answer)| TestCaseSpec::from_lines(input, answer).with_limits(limits))
                .collect(),
        })
    }
}

/// Parses a `limit` block.
///
/// Two shapes are accepted: named pairs `time <ms>` / `memory <KiB>` in any
/// order, or exactly two bare integers `<memory bytes> <time ms>`.
pub fn parse_limit(
    content: &[String],
    defaults: &ExecutionLimits,
) -> Result<ExecutionLimits, GenerationError> {
    let joined = content.join(" ");
    let invalid = |reason: String| GenerationError::InvalidLimit {
        content: joined.clone(),
        reason,
    };
    let tokens: Vec<&str> = joined.split_whitespace().collect();

    let (time_ms, memory_bytes) = match tokens.as_slice() {
        [memory, time] if is_number(memory) && is_number(time) => {
            (number(time, &invalid)?, number(memory, &invalid)?)
        }
        _ => {
            if tokens.len() % 2 != 0 {
                return Err(invalid("expected `name value` pairs".to_string()));
            }
            let mut time_ms = defaults.time_ms();
            let mut memory_bytes = defaults.memory_bytes();
            for pair in tokens.chunks(2) {
                match pair {
                    ["time", value] => time_ms = number(value, &invalid)?,
                    ["memory", value] => {
                        memory_bytes = number(value, &invalid)?
                            .checked_mul(1024)
                            .ok_or_else(|| invalid(format!("memory `{value}` overflows")))?;
                    }
                    [name, _] => return Err(invalid(format!("unknown limit `{name}`"))),
                    _ => unreachable!("chunks of an even-length slice"),
                }
            }
            (time_ms, memory_bytes)
        }
    };

    ExecutionLimits::new(time_ms, memory_bytes)
        .and_then(|limits| limits.with_output_bytes(defaults.output_bytes()))
        .map_err(|e: LimitsError| invalid(e.to_string()))
}

fn is_number(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn number<F>(token: &str, invalid: &F) -> Result<u64, GenerationError>
where
    F: Fn(String) -> GenerationError,
{
    token
        .parse()
        .map_err(|_| invalid(format!("`{token}` is not a non-negative integer")))
}
