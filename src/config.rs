use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_MEMORY_BYTES, DEFAULT_OUTPUT_BYTES, DEFAULT_TIME_MS,
};
use crate::core::comparison::ComparatorKind;
use crate::core::domain::{CommandSpec, ExecutionLimits, LimitsError};
use crate::core::pipeline::judging::ExitPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read `{}`", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid YAML in `{}`", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid limits: {0}")]
    Limits(#[from] LimitsError),
    #[error("memory limit of {0} KiB is too large")]
    MemoryOverflow(u64),
    #[error("no language configured for extension `{0}`")]
    UnknownLanguage(String),
    #[error("no plugin named `{0}`")]
    UnknownPlugin(String),
    #[error("`{0}` has an empty command")]
    EmptyCommand(String),
    #[error("both `{}` and `{}` exist", yml.display(), yaml.display())]
    AmbiguousFixture { yml: PathBuf, yaml: PathBuf },
    #[error("no fixture found next to `{}`", .0.display())]
    MissingFixture(PathBuf),
}

/// `limits` section. Values are in milliseconds and bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub time_ms: u64,
    pub memory_bytes: u64,
    pub output_bytes: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            time_ms: DEFAULT_TIME_MS,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            output_bytes: Some(DEFAULT_OUTPUT_BYTES),
        }
    }
}

impl LimitsConfig {
    pub fn to_limits(&self) -> Result<ExecutionLimits, LimitsError> {
        ExecutionLimits::new(self.time_ms, self.memory_bytes)?.with_output_bytes(self.output_bytes)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LanguageProfile {
    /// File extension without the leading dot.
    pub extension: String,
    /// Argument template; `{file}` and `{stem}` are substituted.
    pub run: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

impl LanguageProfile {
    pub fn command_for(&self, file: &Path) -> Result<CommandSpec, ConfigError> {
        let path = file.to_string_lossy();
        let stem = file
            .file_stem()
            .map(|stem| stem.to_string_lossy())
            .unwrap_or_default();
        let mut parts = self
            .run
            .iter()
            .map(|part| part.replace("{file}", &path).replace("{stem}", &stem));

        let program = parts
            .next()
            .ok_or_else(|| ConfigError::EmptyCommand(format!("language `{}`", self.extension)))?;
        let command = CommandSpec::new(program).args(parts);
        Ok(match &self.workdir {
            Some(dir) => command.workdir(dir),
            None => command,
        })
    }
}

/// A generator program and the values it may query with `/config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginProfile {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub config: HashMap<String, serde_yaml::Value>,
}

impl PluginProfile {
    pub fn command(&self) -> Result<CommandSpec, ConfigError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ConfigError::EmptyCommand(format!("plugin `{}`", self.name)))?;
        let command = CommandSpec::new(program.as_str()).args(args.iter().cloned());
        Ok(match &self.workdir {
            Some(dir) => command.workdir(dir),
            None => command,
        })
    }

    /// `config` flattened to strings, as a generator receives them.
    pub fn config_values(&self) -> HashMap<String, String> {
        self.config
            .iter()
            .filter_map(|(key, value)| Some((key.clone(), scalar_to_string(value)?)))
            .collect()
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        other => {
            tracing::warn!(value = ?other, "ignoring non-scalar plugin config value");
            None
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JudgeConfig {
    pub limits: LimitsConfig,
    pub comparator: ComparatorKind,
    pub languages: Vec<LanguageProfile>,
    pub plugins: Vec<PluginProfile>,
}

impl JudgeConfig {
    /// Loads `path`, or `judge.yaml` in the current directory when `path` is
    /// `None`. A missing default file yields the built-in configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    tracing::debug!("no {} found, using built-in defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_yaml(&text, &path)?;
        tracing::debug!(path = %path.display(), languages = config.languages.len(), plugins = config.plugins.len(), "configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        config.limits.to_limits()?;
        Ok(config)
    }

    /// Command and exit policy for running `file`. Files without an extension
    /// are executed directly, never looked up on `PATH`.
    pub fn candidate(&self, file: &Path) -> Result<(CommandSpec, ExitPolicy), ConfigError> {
        let Some(extension) = file.extension().map(|ext| ext.to_string_lossy()) else {
            let program = match file.parent() {
                Some(parent) if parent.as_os_str().is_empty() => Path::new(".").join(file),
                _ => file.to_path_buf(),
            };
            return Ok((
                CommandSpec::new(program.to_string_lossy()),
                ExitPolicy::default(),
            ));
        };
        let language = self
            .languages
            .iter()
            .find(|language| language.extension.trim_start_matches('.') == extension)
            .ok_or_else(|| ConfigError::UnknownLanguage(extension.to_string()))?;
        Ok((language.command_for(file)?, language.exit_policy))
    }

    pub fn plugin(&self, name: &str) -> Result<&PluginProfile, ConfigError> {
        self.plugins
            .iter()
            .find(|plugin| plugin.name == name)
            .ok_or_else(|| ConfigError::UnknownPlugin(name.to_string()))
    }
}
