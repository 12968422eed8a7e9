use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::core::domain::{ExecutionLimits, LimitOverrides, TestCaseSpec};
use crate::generator::suite::GeneratedSuite;

/// Static test cases stored as YAML next to a candidate.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<FixtureLimit>,
    pub cases: Vec<FixtureCase>,
}

/// `time` is in milliseconds, `memory` in KiB.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureLimit {
    pub time: Option<u64>,
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureCase {
    pub input: String,
    pub answer: String,
}

impl Fixture {
    /// Every generated case, with the generator's limits if it sent any.
    pub fn from_suite(suite: &GeneratedSuite) -> Self {
        Self {
            limit: suite.latest.limits.map(|limits| FixtureLimit {
                time: Some(limits.time_ms()),
                memory: Some(limits.memory_bytes().div_ceil(1024)),
            }),
            cases: suite
                .cases
                .iter()
                .map(|case| FixtureCase {
                    input: case.input.clone(),
                    answer: case.answer.clone(),
                })
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let fixture: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), cases = fixture.cases.len(), "fixture loaded");
        Ok(fixture)
    }

    pub fn overrides(&self) -> Result<LimitOverrides, ConfigError> {
        let limit = self.limit.unwrap_or_default();
        let memory_bytes = limit
            .memory
            .map(|kib| kib.checked_mul(1024).ok_or(ConfigError::MemoryOverflow(kib)))
            .transpose()?;
        Ok(LimitOverrides {
            time_ms: limit.time,
            memory_bytes,
        })
    }

    /// The fixture's limits applied over `base`.
    pub fn limits(&self, base: ExecutionLimits) -> Result<ExecutionLimits, ConfigError> {
        Ok(self.overrides()?.apply(base)?)
    }

    pub fn test_cases(&self) -> Vec<TestCaseSpec> {
        self.cases
            .iter()
            .map(|case| TestCaseSpec::new(case.input.as_str(), case.answer.as_str()))
            .collect()
    }
}

/// Finds `<stem>.yaml` or `<stem>.yml` next to `candidate`. Having both is an
/// error.
pub fn resolve(candidate: &Path) -> Result<PathBuf, ConfigError> {
    let yml = candidate.with_extension("yml");
    let yaml = candidate.with_extension("yaml");

    match (yml.exists(), yaml.exists()) {
        (true, false) => Ok(yml),
        (false, true) => Ok(yaml),
        (true, true) => Err(ConfigError::AmbiguousFixture { yml, yaml }),
        (false, false) => Err(ConfigError::MissingFixture(candidate.to_path_buf())),
    }
}
