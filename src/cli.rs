use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::config::{JudgeConfig, PluginProfile};
use crate::core::domain::{
    CommandSpec, ExecutionLimits, LimitOverrides, Summary, TestCaseId, Verdict,
};
use crate::core::pipeline::judging::Judge;
use crate::core::traits::generator::{GeneratorHost, HostAborted, NoticeLevel};
use crate::fixture::{self, Fixture};
use crate::generator::session::GeneratorSession;
use crate::native::runner::NativeRunner;
use crate::report;
use crate::stubs::host::StaticHost;

#[derive(Parser, Debug)]
#[command(name = "judge-runner")]
#[command(about = "Judge a program against fixture or generated test cases", long_about = None)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to judge.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a candidate on its test cases and report verdicts
    Judge {
        /// Candidate source or executable
        file: PathBuf,

        /// Fixture file (defaults to <stem>.yaml or <stem>.yml next to the candidate)
        #[arg(short, long, conflicts_with = "plugin")]
        fixture: Option<PathBuf>,

        /// Generate the test case with this plugin instead of reading a fixture
        #[arg(short, long)]
        plugin: Option<String>,

        /// Time limit in milliseconds
        #[arg(short, long)]
        time: Option<u64>,

        /// Memory limit in KiB
        #[arg(short, long)]
        memory: Option<u64>,

        /// Number of test cases judged at once
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,

        /// Confirm every generator prompt and answer questions with empty text
        #[arg(long)]
        non_interactive: bool,
    },

    /// Run a generator plugin and print the cases it produces as YAML
    Generate {
        /// Plugin name from the configuration
        plugin: String,

        /// Judge this candidate on the generated cases instead of printing them
        #[arg(long)]
        candidate: Option<PathBuf>,

        /// Number of test cases judged at once
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,

        /// Confirm every generator prompt and answer questions with empty text
        #[arg(long)]
        non_interactive: bool,
    },
}

/// Runs the parsed command. `Ok(true)` means every verdict was accepted.
pub async fn run(cli: Cli) -> Result<bool> {
    let config = JudgeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Judge {
            file,
            fixture,
            plugin,
            time,
            memory,
            jobs,
            non_interactive,
        } => {
            let overrides = LimitOverrides {
                time_ms: time,
                memory_bytes: memory
                    .map(|kib| kib.checked_mul(1024).context("memory limit is too large"))
                    .transpose()?,
            };
            let base = config.limits.to_limits()?;

            let verdicts = match plugin {
                Some(name) => {
                    let plugin = config.plugin(&name)?;
                    let session = GeneratorSession::new(plugin.command()?, base);
                    let host = host_for(plugin, non_interactive);
                    let candidate = candidate_judge(&config, &file, base, overrides)?;
                    let verdict = candidate
                        .judge
                        .judge_generated(
                            TestCaseId::new(name),
                            &candidate.command,
                            &session,
                            host.as_ref(),
                        )
                        .await;
                    vec![verdict]
                }
                None => {
                    let path = match fixture {
                        Some(path) => path,
                        None => fixture::resolve(&file)?,
                    };
                    let fixture = Fixture::load(&path)?;
                    let base = fixture.limits(base)?;
                    let candidate = candidate_judge(&config, &file, base, overrides)?;
                    candidate
                        .judge
                        .judge_suite(&case_prefix(&file), &candidate.command, fixture.test_cases(), jobs)
                        .await
                }
            };
            Ok(print_report(&verdicts))
        }
        Commands::Generate {
            plugin,
            candidate,
            jobs,
            non_interactive,
        } => {
            let profile = config.plugin(&plugin)?;
            let base = config.limits.to_limits()?;
            let session = GeneratorSession::new(profile.command()?, base);
            let host = host_for(profile, non_interactive);
            let suite = session
                .generate(host.as_ref())
                .await
                .with_context(|| format!("plugin `{plugin}` failed"))?;

            match candidate {
                Some(file) => {
                    let candidate = candidate_judge(&config, &file, base, LimitOverrides::default())?;
                    let verdicts = candidate
                        .judge
                        .judge_suite(&plugin, &candidate.command, suite.cases, jobs)
                        .await;
                    Ok(print_report(&verdicts))
                }
                None => {
                    print!("{}", serde_yaml::to_string(&Fixture::from_suite(&suite))?);
                    Ok(true)
                }
            }
        }
    }
}

struct CandidateJudge {
    judge: Arc<Judge>,
    command: CommandSpec,
}

fn candidate_judge(
    config: &JudgeConfig,
    file: &Path,
    base: ExecutionLimits,
    overrides: LimitOverrides,
) -> Result<CandidateJudge> {
    let (command, exit_policy) = config.candidate(file)?;
    tracing::debug!(%command, ?exit_policy, "resolved candidate");
    let judge = Judge::new(Arc::new(NativeRunner::new()), config.comparator.build(), base)
        .with_overrides(overrides)
        .with_exit_policy(exit_policy);
    Ok(CandidateJudge {
        judge: Arc::new(judge),
        command,
    })
}

fn case_prefix(file: &Path) -> String {
    file.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "case".to_string())
}

fn host_for(plugin: &PluginProfile, non_interactive: bool) -> Box<dyn GeneratorHost> {
    let values = plugin.config_values();
    if non_interactive {
        Box::new(StaticHost::new(values))
    } else {
        Box::new(TerminalHost::new(values))
    }
}

fn print_report(verdicts: &[Verdict]) -> bool {
    println!("{}", report::render(verdicts));
    verdicts.iter().collect::<Summary>().all_accepted()
}

/// Answers generator prompts from the terminal. Prompts go to stderr so that
/// stdout stays clean for results.
#[derive(Debug)]
pub struct TerminalHost {
    input: Mutex<Lines<BufReader<Stdin>>>,
    config: HashMap<String, String>,
}

impl TerminalHost {
    pub fn new(config: HashMap<String, String>) -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            config,
        }
    }

    async fn read_line(&self) -> Result<String, HostAborted> {
        match self.input.lock().await.next_line().await {
            Ok(Some(line)) => Ok(line.trim_end().to_string()),
            Ok(None) => Err(HostAborted),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read from terminal");
                Err(HostAborted)
            }
        }
    }
}

/// An empty answer accepts.
fn confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "" | "y" | "yes")
}

#[async_trait::async_trait]
impl GeneratorHost for TerminalHost {
    async fn confirm(&self, message: &str) -> Result<bool, HostAborted> {
        eprint!("{message} [Y/n] ");
        let answer = self.read_line().await?;
        Ok(confirmed(&answer))
    }

    async fn ask(&self, message: &str) -> Result<String, HostAborted> {
        eprint!("{message} ");
        self.read_line().await
    }

    async fn config(&self, key: &str) -> Option<String> {
        self.config.get(key).cloned()
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        let label = match level {
            NoticeLevel::Info => "info",
            NoticeLevel::Warn => "warn",
            NoticeLevel::Error => "error",
        };
        eprintln!("[{label}] {message}");
    }
}
