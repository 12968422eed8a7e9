use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde::Deserialize;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::{
    constants::VERDICT_TX_ERR,
    core::{
        comparison::diff_excerpt,
        domain::{
            CommandSpec, ExecutionLimits, LimitOverrides, Outcome, RunRequest, RunResult,
            TerminationCause, TestCaseId, TestCaseSpec, Verdict,
        },
        traits::{comparator::Comparator, generator::GeneratorHost, runner::Runner},
    },
    generator::session::GeneratorSession,
};

const STDERR_EXCERPT_CHARS: usize = 512;

/// How a candidate's non-zero exit status is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitPolicy {
    #[default]
    NonZeroIsRuntimeError,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct JudgeJob {
    pub id: TestCaseId,
    pub command: CommandSpec,
    pub test_case: TestCaseSpec,
}

/// Runs candidates and turns their results into verdicts.
#[derive(Debug)]
pub struct Judge {
    runner: Arc<dyn Runner>,
    comparator: Arc<dyn Comparator>,
    default_limits: ExecutionLimits,
    overrides: LimitOverrides,
    exit_policy: ExitPolicy,
}

impl Judge {
    pub fn new(
        runner: Arc<dyn Runner>,
        comparator: Arc<dyn Comparator>,
        default_limits: ExecutionLimits,
    ) -> Self {
        Self {
            runner,
            comparator,
            default_limits,
            overrides: LimitOverrides::default(),
            exit_policy: ExitPolicy::default(),
        }
    }

    /// Limits that win over both the defaults and a case's own limits.
    pub fn with_overrides(self, overrides: LimitOverrides) -> Self {
        Self { overrides, ..self }
    }

    pub fn with_exit_policy(self, exit_policy: ExitPolicy) -> Self {
        Self {
            exit_policy,
            ..self
        }
    }

    pub async fn judge(&self, id: TestCaseId, command: &CommandSpec, test_case: &TestCaseSpec) -> Verdict {
        let limits = test_case.limits.unwrap_or(self.default_limits);
        let limits = if self.overrides.is_empty() {
            limits
        } else {
            match self.overrides.apply(limits) {
                Ok(limits) => limits,
                Err(e) => return Verdict::internal_error(id, e.to_string()),
            }
        };
        let request = RunRequest::new(command.clone(), test_case.input.as_bytes(), limits);
        tracing::debug!(%id, run_id = %request.id, "judging test case");

        let result = self.runner.run(request).await;
        let verdict = self.verdict_for(id, test_case, result);
        tracing::info!(
            id = %verdict.id,
            outcome = ?verdict.outcome,
            time_ms = verdict.execution_time_ms,
            "verdict"
        );
        verdict
    }

    /// Drives `generator` to completion, then judges `candidate` on the case
    /// it produced. Generation failures become an `InternalError` verdict.
    pub async fn judge_generated(
        &self,
        id: TestCaseId,
        candidate: &CommandSpec,
        generator: &GeneratorSession,
        host: &dyn GeneratorHost,
    ) -> Verdict {
        match generator.generate(host).await {
            Ok(suite) => self.judge(id, candidate, &suite.latest).await,
            Err(e) => {
                tracing::error!(%id, error = %e, "generation failed");
                Verdict::internal_error(id, e.to_string())
            }
        }
    }

    /// Judges every case with at most `parallelism` candidates running at
    /// once. Verdicts come back in case order, ids are `<prefix>#<n>`.
    pub async fn judge_suite(
        self: &Arc<Self>,
        prefix: &str,
        command: &CommandSpec,
        cases: Vec<TestCaseSpec>,
        parallelism: usize,
    ) -> Vec<Verdict> {
        let capacity = parallelism.max(1);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (res_tx, mut res_rx) = mpsc::channel(capacity);
        let _worker = handle_judging(res_tx, job_rx, self.clone(), parallelism);

        let feed = async move {
            for (index, test_case) in cases.into_iter().enumerate() {
                let job = JudgeJob {
                    id: TestCaseId::indexed(prefix, index),
                    command: command.clone(),
                    test_case,
                };
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
        };
        let collect = async {
            let mut verdicts = Vec::new();
            while let Some(verdict) = res_rx.recv().await {
                verdicts.push(verdict);
            }
            verdicts
        };

        let ((), verdicts) = tokio::join!(feed, collect);
        verdicts
    }

    fn verdict_for(&self, id: TestCaseId, test_case: &TestCaseSpec, result: RunResult) -> Verdict {
        let mut diff = None;
        let mut message = None;
        let outcome = match &result.cause {
            TerminationCause::LaunchFailed { msg } => {
                message = Some(msg.clone());
                Outcome::InternalError
            }
            TerminationCause::MemoryExceeded => Outcome::MemoryLimitExceeded,
            TerminationCause::OutputExceeded => Outcome::OutputLimitExceeded,
            TerminationCause::TimeExceeded => Outcome::TimeLimitExceeded,
            TerminationCause::Crashed { signal } => {
                let reason = match signal {
                    Some(signal) => format!("killed by signal {signal}"),
                    None => "terminated abnormally".to_string(),
                };
                message = Some(with_stderr(reason, &result.stderr));
                Outcome::RuntimeError
            }
            TerminationCause::Completed => match result.exit_code {
                Some(code) if code != 0 && self.exit_policy == ExitPolicy::NonZeroIsRuntimeError => {
                    message = Some(with_stderr(format!("exited with code {code}"), &result.stderr));
                    Outcome::RuntimeError
                }
                _ => {
                    let actual = String::from_utf8_lossy(&result.stdout);
                    if self.comparator.matches(&test_case.answer, &actual) {
                        Outcome::Accepted
                    } else {
                        diff = Some(diff_excerpt(
                            self.comparator.as_ref(),
                            &test_case.answer,
                            &actual,
                        ));
                        Outcome::WrongAnswer
                    }
                }
            },
        };

        Verdict {
            id,
            outcome,
            execution_time_ms: result.execution_time_ms,
            peak_memory_usage_bytes: result.peak_memory_usage_bytes,
            diff,
            message,
            judged_at: chrono::Utc::now(),
        }
    }
}

fn with_stderr(reason: String, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return reason;
    }
    let excerpt: String = stderr.chars().take(STDERR_EXCERPT_CHARS).collect();
    format!("{reason}: {excerpt}")
}

/// Spawns a worker judging jobs from `job_rx` with at most `parallelism` in
/// flight. Verdicts are sent to `res_tx` in the order jobs were received.
#[tracing::instrument(skip_all, fields(parallelism = parallelism))]
pub fn handle_judging(
    res_tx: Sender<Verdict>,
    mut job_rx: Receiver<JudgeJob>,
    judge: Arc<Judge>,
    parallelism: usize,
) -> JoinHandle<()> {
    let parallelism = parallelism.max(1);
    tokio::spawn(async move {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, (usize, Verdict)>> =
            FuturesUnordered::new();
        let mut finished = BTreeMap::new();
        let mut received = 0usize;
        let mut emitted = 0usize;
        let mut accepting = true;

        loop {
            tokio::select! {
                job = job_rx.recv(), if accepting && in_flight.len() < parallelism => match job {
                    Some(job) => {
                        let judge = judge.clone();
                        let index = received;
                        received += 1;
                        in_flight.push(Box::pin(async move {
                            let JudgeJob { id, command, test_case } = job;
                            (index, judge.judge(id, &command, &test_case).await)
                        }));
                    }
                    None => accepting = false,
                },
                Some((index, verdict)) = in_flight.next(), if !in_flight.is_empty() => {
                    finished.insert(index, verdict);
                    while let Some(verdict) = finished.remove(&emitted) {
                        if res_tx.send(verdict).await.is_err() {
                            tracing::warn!("{}", VERDICT_TX_ERR);
                            return;
                        }
                        emitted += 1;
                    }
                }
                else => break,
            }
        }
        tracing::debug!(judged = emitted, "judging worker finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparison::{Exact, TrailingWhitespace};
    use crate::core::traits::runner::MockRunner;
    use crate::stubs::runner::RunnerStub;
    use std::time::{Duration, Instant};

    fn limits() -> ExecutionLimits {
        ExecutionLimits::new(2000, 64 * 1024 * 1024).unwrap()
    }

    fn judge_with(runner: impl Runner + 'static) -> Judge {
        Judge::new(Arc::new(runner), Arc::new(TrailingWhitespace), limits())
    }

    fn runner_returning(result: RunResult) -> MockRunner {
        let mut runner = MockRunner::new();
        runner.expect_run().return_const(result);
        runner
    }

    fn with_cause(cause: TerminationCause) -> RunResult {
        RunResult {
            exit_code: None,
            cause,
            ..RunResult::completed("", 0)
        }
    }

    fn case(input: &str, answer: &str) -> TestCaseSpec {
        TestCaseSpec::new(input, answer)
    }

    /// Echoes the input back after sleeping for as many milliseconds as the
    /// input's first number.
    #[derive(Debug)]
    struct SleepyEcho;

    #[async_trait::async_trait]
    impl Runner for SleepyEcho {
        async fn run(&self, request: RunRequest) -> RunResult {
            let text = String::from_utf8_lossy(&request.input).into_owned();
            let delay = text.trim().parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            RunResult::completed(text, 0)
        }
    }

    #[tokio::test]
    async fn test_accepted_ignores_trailing_whitespace() {
        let judge = judge_with(runner_returning(RunResult::completed("7  \n\n", 0)));

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("sum"), &case("3 4\n", "7\n"))
            .await;

        assert_eq!(verdict.outcome, Outcome::Accepted);
        assert_eq!(verdict.diff, None);
    }

    #[tokio::test]
    async fn test_wrong_answer_carries_diff() {
        let judge = judge_with(runner_returning(RunResult::completed("7\n", 0)));

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("sum"), &case("3 4\n", "8\n"))
            .await;

        assert_eq!(verdict.outcome, Outcome::WrongAnswer);
        assert_eq!(verdict.diff.as_deref(), Some("-8\n+7"));
    }

    #[tokio::test]
    async fn test_exact_comparator_rejects_trailing_space() {
        let judge = Judge::new(
            Arc::new(runner_returning(RunResult::completed("7 \n", 0))),
            Arc::new(Exact),
            limits(),
        );

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("sum"), &case("", "7\n"))
            .await;

        assert_eq!(verdict.outcome, Outcome::WrongAnswer);
    }

    #[tokio::test]
    async fn test_termination_causes_map_to_outcomes() {
        let cases = [
            (TerminationCause::TimeExceeded, Outcome::TimeLimitExceeded),
            (TerminationCause::MemoryExceeded, Outcome::MemoryLimitExceeded),
            (TerminationCause::OutputExceeded, Outcome::OutputLimitExceeded),
            (TerminationCause::Crashed { signal: Some(11) }, Outcome::RuntimeError),
            (
                TerminationCause::LaunchFailed { msg: "not found".to_string() },
                Outcome::InternalError,
            ),
        ];
        for (cause, expected) in cases {
            let judge = judge_with(runner_returning(with_cause(cause.clone())));

            let verdict = judge
                .judge(TestCaseId::new("t"), &CommandSpec::new("x"), &case("", ""))
                .await;

            assert_eq!(verdict.outcome, expected, "{cause:?}");
            assert_eq!(verdict.diff, None);
        }
    }

    #[tokio::test]
    async fn test_crash_message_names_signal() {
        let judge = judge_with(runner_returning(with_cause(TerminationCause::Crashed {
            signal: Some(11),
        })));

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("x"), &case("", ""))
            .await;

        assert_eq!(verdict.message.as_deref(), Some("killed by signal 11"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_runtime_error_with_stderr() {
        let result = RunResult {
            stderr: b"panicked at main.rs\n".to_vec(),
            ..RunResult::completed("7\n", 101)
        };
        let judge = judge_with(runner_returning(result));

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("x"), &case("", "7\n"))
            .await;

        assert_eq!(verdict.outcome, Outcome::RuntimeError);
        assert_eq!(
            verdict.message.as_deref(),
            Some("exited with code 101: panicked at main.rs")
        );
    }

    #[tokio::test]
    async fn test_ignored_exit_code_still_compares() {
        let judge = judge_with(runner_returning(RunResult::completed("7\n", 3)))
            .with_exit_policy(ExitPolicy::Ignore);

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("x"), &case("", "7\n"))
            .await;

        assert_eq!(verdict.outcome, Outcome::Accepted);
    }

    #[tokio::test]
    async fn test_limits_fall_back_to_defaults() {
        let mut runner = MockRunner::new();
        runner
            .expect_run()
            .withf(|request| request.limits.time_ms() == 2000 && request.input == b"1 2\n")
            .times(1)
            .return_const(RunResult::completed("3\n", 0));
        let own = ExecutionLimits::new(500, 1024).unwrap();
        let mut overriding = MockRunner::new();
        overriding
            .expect_run()
            .withf(move |request| request.limits == own)
            .times(1)
            .return_const(RunResult::completed("3\n", 0));

        let command = CommandSpec::new("sum");
        judge_with(runner)
            .judge(TestCaseId::new("default"), &command, &case("1 2\n", "3\n"))
            .await;
        judge_with(overriding)
            .judge(
                TestCaseId::new("override"),
                &command,
                &case("1 2\n", "3\n").with_limits(Some(own)),
            )
            .await;
    }

    #[tokio::test]
    async fn test_overrides_beat_case_limits() {
        let mut runner = MockRunner::new();
        runner
            .expect_run()
            .withf(|request| request.limits.time_ms() == 50 && request.limits.memory_bytes() == 1024)
            .times(1)
            .return_const(RunResult::completed("", 0));
        let judge = judge_with(runner).with_overrides(LimitOverrides {
            time_ms: Some(50),
            memory_bytes: None,
        });
        let own = ExecutionLimits::new(500, 1024).unwrap();

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("x"), &case("", "").with_limits(Some(own)))
            .await;

        assert_eq!(verdict.outcome, Outcome::Accepted);
    }

    #[tokio::test]
    async fn test_resources_are_copied_to_verdict() {
        let result = RunResult {
            execution_time_ms: 42,
            peak_memory_usage_bytes: Some(4096),
            ..RunResult::completed("ok\n", 0)
        };
        let judge = judge_with(runner_returning(result));

        let verdict = judge
            .judge(TestCaseId::new("t"), &CommandSpec::new("x"), &case("", "ok\n"))
            .await;

        assert_eq!(verdict.execution_time_ms, 42);
        assert_eq!(verdict.peak_memory_usage_bytes, Some(4096));
    }

    #[tokio::test]
    async fn test_handle_judging_keeps_job_order() {
        let judge = Arc::new(judge_with(SleepyEcho));
        let (res_tx, mut res_rx) = mpsc::channel(10);
        let (job_tx, job_rx) = mpsc::channel(10);

        let worker = handle_judging(res_tx, job_rx, judge, 3);

        for (label, delay) in [("slow", "150"), ("fast", "10"), ("medium", "60")] {
            let job = JudgeJob {
                id: TestCaseId::new(label),
                command: CommandSpec::new("echo"),
                test_case: case(delay, delay),
            };
            job_tx.send(job).await.unwrap();
        }
        drop(job_tx);

        let mut ids = Vec::new();
        while let Some(verdict) = res_rx.recv().await {
            assert_eq!(verdict.outcome, Outcome::Accepted);
            ids.push(verdict.id.to_string());
        }
        assert_eq!(ids, ["slow", "fast", "medium"]);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_judging_stops_when_receiver_dropped() {
        let judge = Arc::new(judge_with(runner_returning(RunResult::completed("", 0))));
        let (res_tx, res_rx) = mpsc::channel(1);
        let (job_tx, job_rx) = mpsc::channel(10);
        drop(res_rx);

        let worker = handle_judging(res_tx, job_rx, judge, 1);
        job_tx
            .send(JudgeJob {
                id: TestCaseId::new("orphan"),
                command: CommandSpec::new("x"),
                test_case: case("", ""),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_judge_suite_runs_cases_in_parallel() {
        let stub = RunnerStub::new(RunResult::completed("1\n", 0), Duration::from_millis(200));
        let judge = Arc::new(judge_with(stub));
        let cases = vec![case("", "1\n"), case("", "2\n"), case("", "1\n"), case("", "1\n")];
        let started = Instant::now();

        let verdicts = judge
            .judge_suite("sample", &CommandSpec::new("one"), cases, 4)
            .await;

        assert!(started.elapsed() < Duration::from_millis(600));
        let outcomes: Vec<_> = verdicts.iter().map(|v| (v.id.to_string(), v.outcome)).collect();
        assert_eq!(
            outcomes,
            [
                ("sample#1".to_string(), Outcome::Accepted),
                ("sample#2".to_string(), Outcome::WrongAnswer),
                ("sample#3".to_string(), Outcome::Accepted),
                ("sample#4".to_string(), Outcome::Accepted),
            ]
        );
    }

    #[tokio::test]
    async fn test_judge_suite_with_single_job_is_sequential() {
        let stub = RunnerStub::new(RunResult::completed("1\n", 0), Duration::from_millis(100));
        let judge = Arc::new(judge_with(stub));
        let started = Instant::now();

        let verdicts = judge
            .judge_suite("seq", &CommandSpec::new("one"), vec![case("", "1\n"); 3], 1)
            .await;

        assert_eq!(verdicts.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_empty_suite() {
        let judge = Arc::new(judge_with(MockRunner::new()));

        let verdicts = judge
            .judge_suite("none", &CommandSpec::new("x"), Vec::new(), 2)
            .await;

        assert!(verdicts.is_empty());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::core::traits::generator::MockGeneratorHost;
        use crate::native::runner::NativeRunner;

        fn native_judge() -> Judge {
            judge_with(NativeRunner::new())
        }

        #[tokio::test]
        async fn test_sum_candidate() {
            let judge = native_judge();
            let candidate = CommandSpec::shell("read a b; echo $((a + b))");

            let accepted = judge
                .judge(TestCaseId::new("sum"), &candidate, &case("3 4\n", "7\n"))
                .await;
            let wrong = judge
                .judge(TestCaseId::new("sum"), &candidate, &case("3 4\n", "8\n"))
                .await;

            assert_eq!(accepted.outcome, Outcome::Accepted);
            assert_eq!(wrong.outcome, Outcome::WrongAnswer);
        }

        #[tokio::test]
        async fn test_echo_candidate_with_matching_answer() {
            let verdict = native_judge()
                .judge(TestCaseId::new("echo"), &CommandSpec::new("cat"), &case("3 4\n", "3 4"))
                .await;

            assert_eq!(verdict.outcome, Outcome::Accepted);
        }

        #[tokio::test]
        async fn test_infinite_loop_is_time_limit_exceeded() {
            let limits = ExecutionLimits::new(200, 64 * 1024 * 1024).unwrap();
            let started = Instant::now();

            let verdict = native_judge()
                .judge(
                    TestCaseId::new("loop"),
                    &CommandSpec::shell("while :; do :; done"),
                    &case("", "").with_limits(Some(limits)),
                )
                .await;

            assert_eq!(verdict.outcome, Outcome::TimeLimitExceeded);
            assert!(started.elapsed() < Duration::from_secs(2));
        }

        #[tokio::test]
        async fn test_generated_case_is_judged() {
            let generator = GeneratorSession::new(
                CommandSpec::shell(
                    "echo /result; echo 'limit 1'; echo 'time 1000'; \
                     echo 'input 1'; echo '20 22'; echo 'answer 1'; echo 42",
                ),
                limits(),
            );
            let mut host = MockGeneratorHost::new();
            host.expect_notify().return_const(());

            let verdict = native_judge()
                .judge_generated(
                    TestCaseId::new("generated"),
                    &CommandSpec::shell("read a b; echo $((a + b))"),
                    &generator,
                    &host,
                )
                .await;

            assert_eq!(verdict.outcome, Outcome::Accepted);
        }

        #[tokio::test]
        async fn test_broken_generator_is_internal_error() {
            let generator =
                GeneratorSession::new(CommandSpec::shell("echo /result; echo 'input -1'"), limits());
            let mut host = MockGeneratorHost::new();
            host.expect_notify().return_const(());

            let verdict = native_judge()
                .judge_generated(
                    TestCaseId::new("generated"),
                    &CommandSpec::new("cat"),
                    &generator,
                    &host,
                )
                .await;

            assert_eq!(verdict.outcome, Outcome::InternalError);
            assert!(verdict.message.is_some());
        }
    }
}
