// SPDX-License-Identifier: MIT OR Apache-2.0
//! Step DAG scheduler.
//!
//! Steps launch in dependency order, in batches bounded by
//! `runtime.max_parallel_steps`. A batch always settles completely: when
//! one member fails, its concurrent siblings still finish and record their
//! StepResults before rollback is considered. Retries and backoff sleeps
//! respect the whole-execution deadline.

use crate::cancel::CancelToken;
use crate::executor::{Attempt, StepContext, run_http, run_shell};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{Map, Value};
use spell_core::outputs::{OutputRefError, resolve_output_reference};
use spell_core::receipt::{StepResult, truncate_head};
use spell_core::template::TemplateContext;
use spell_core::values::get_path;
use spell_core::{ErrorCode, SpellManifest, Step, StepKind};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Deadline and timeout knobs for one scheduled run.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Per-attempt cap (`SPELL_RUNTIME_STEP_TIMEOUT_MS`).
    pub step_timeout_ms: u64,
    /// Whole-execution cap; `None` disables the deadline.
    pub execution_timeout_ms: Option<u64>,
}

/// Why a scheduled run stopped early.
#[derive(Debug, Clone)]
pub enum ScheduleFailure {
    /// The cast's cancellation token fired.
    Canceled {
        /// Which step observed the cancellation.
        message: String,
    },
    /// A step failed, timed out, or the graph deadlocked.
    Failed {
        /// Stable error code for the receipt and API record.
        code: ErrorCode,
        /// Single-line cause.
        message: String,
    },
}

impl ScheduleFailure {
    /// The single-line cause.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Canceled { message } | Self::Failed { message, .. } => message,
        }
    }

    /// The error code, absent for cancellations.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Canceled { .. } => None,
            Self::Failed { code, .. } => Some(*code),
        }
    }
}

/// Everything a scheduled run produced.
#[derive(Debug, Default)]
pub struct SchedulerRun {
    /// Step results in completion order.
    pub steps: Vec<StepResult>,
    /// Published outputs.
    pub outputs: Map<String, Value>,
    /// Names of steps that ran to success, in completion order. This is
    /// the list rollback walks in reverse.
    pub executed: Vec<String>,
    /// Set when the run stopped early.
    pub failure: Option<ScheduleFailure>,
    /// The execution deadline, shared with the rollback pass.
    pub deadline: Option<Instant>,
}

/// Ambient pieces threaded through every step launch.
pub struct RunEnv<'a> {
    /// Bundle root directory.
    pub bundle_root: &'a Path,
    /// Environment visible to steps and templates.
    pub env: &'a BTreeMap<String, String>,
    /// Shared http client.
    pub http: &'a reqwest::Client,
    /// Cast-wide cancellation token.
    pub cancel: &'a CancelToken,
}

/// Run the manifest's steps against `input`.
pub async fn run_steps(
    manifest: &SpellManifest,
    input: &Value,
    run_env: &RunEnv<'_>,
    config: SchedulerConfig,
) -> SchedulerRun {
    let mut run = SchedulerRun::default();

    let input_json = match serde_json::to_string(input) {
        Ok(s) => s,
        Err(e) => {
            run.failure = Some(ScheduleFailure::Failed {
                code: ErrorCode::Internal,
                message: format!("input serialization failed: {e}"),
            });
            return run;
        }
    };
    let template = TemplateContext {
        input: input.clone(),
        env: run_env.env.clone(),
    };

    let started = Instant::now();
    let deadline = config
        .execution_timeout_ms
        .map(|ms| started + Duration::from_millis(ms));
    run.deadline = deadline;
    let max_parallel = manifest.runtime.max_parallel_steps.unwrap_or(1).max(1);

    let mut pending: Vec<usize> = (0..manifest.steps.len()).collect();
    let mut completed: BTreeSet<String> = BTreeSet::new();

    'outer: while !pending.is_empty() {
        let ready: Vec<usize> = pending
            .iter()
            .copied()
            .filter(|&i| {
                manifest.steps[i]
                    .depends_on
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .collect();

        if ready.is_empty() {
            let names: Vec<&str> = pending
                .iter()
                .map(|&i| manifest.steps[i].name.as_str())
                .collect();
            run.failure = Some(ScheduleFailure::Failed {
                code: ErrorCode::StepDeadlock,
                message: format!("step dependency deadlock: {}", names.join(", ")),
            });
            break;
        }
        pending.retain(|i| !ready.contains(i));

        // Ready steps stay in manifest order; conditions are evaluated
        // immediately before launch so earlier batches' outputs are
        // visible.
        let mut queue: VecDeque<usize> = ready.into();
        while !queue.is_empty() {
            let mut batch: Vec<usize> = Vec::new();
            while batch.len() < max_parallel {
                let Some(idx) = queue.pop_front() else { break };
                let step = &manifest.steps[idx];
                match should_run(step, input, &run.outputs) {
                    Ok(true) => batch.push(idx),
                    Ok(false) => {
                        debug!(step = %step.name, "skipped by condition");
                        run.steps.push(skipped_result(step));
                        completed.insert(step.name.clone());
                    }
                    Err(failure) => {
                        run.failure = Some(failure);
                        break 'outer;
                    }
                }
            }
            if batch.is_empty() {
                continue;
            }

            let launches = batch.iter().map(|&idx| {
                run_one(
                    &manifest.steps[idx],
                    &input_json,
                    &template,
                    run_env,
                    config,
                    deadline,
                )
            });
            // All members settle; no first-failure cancellation.
            let outcomes = join_all(launches).await;

            let mut batch_failure: Option<ScheduleFailure> = None;
            for (idx, outcome) in batch.into_iter().zip(outcomes) {
                let step = &manifest.steps[idx];
                if let Some(output) = outcome.output {
                    run.outputs.insert(output_key(step), output);
                }
                let success = outcome.result.success;
                run.steps.push(outcome.result);
                if success {
                    run.executed.push(step.name.clone());
                    completed.insert(step.name.clone());
                } else if batch_failure.is_none() {
                    batch_failure = outcome.failure;
                }
            }
            if let Some(failure) = batch_failure {
                run.failure = Some(failure);
                break 'outer;
            }
        }
    }

    run
}

fn output_key(step: &Step) -> String {
    match step.uses {
        StepKind::Shell => format!("step.{}.stdout", step.name),
        StepKind::Http => format!("step.{}.json", step.name),
    }
}

fn skipped_result(step: &Step) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_name: step.name.clone(),
        uses: step.uses.as_str().to_string(),
        started_at: now,
        finished_at: now,
        success: true,
        exit_code: None,
        stdout_head: None,
        stderr_head: None,
        message: "skipped by condition".to_string(),
    }
}

/// Evaluate a step's `when` clause. Missing output references skip the
/// step; structurally bad references fail the run.
fn should_run(
    step: &Step,
    input: &Value,
    outputs: &Map<String, Value>,
) -> Result<bool, ScheduleFailure> {
    let Some(when) = &step.when else {
        return Ok(true);
    };

    let value: Value = if let Some(path) = &when.input_path {
        get_path(input, path).cloned().unwrap_or(Value::Null)
    } else if let Some(reference) = &when.output_path {
        match resolve_output_reference(outputs, reference) {
            Ok(v) => v,
            Err(OutputRefError::NotFound { .. }) => {
                // A reference into outputs that never materialized means
                // the condition cannot hold.
                return Ok(false);
            }
            Err(e) => {
                return Err(ScheduleFailure::Failed {
                    code: ErrorCode::InvalidOutputPath,
                    message: format!("step '{}': {e}", step.name),
                });
            }
        }
    } else {
        // Manifest validation rejects this shape.
        return Ok(true);
    };

    if let Some(expected) = &when.equals {
        return Ok(&value == expected);
    }
    if let Some(unexpected) = &when.not_equals {
        return Ok(&value != unexpected);
    }
    Ok(true)
}

struct OneOutcome {
    result: StepResult,
    output: Option<Value>,
    failure: Option<ScheduleFailure>,
}

fn execution_timeout_failure(step: &Step, timeout_ms: u64) -> (StepResult, ScheduleFailure) {
    let message = format!(
        "cast execution timed out after {timeout_ms}ms while running step '{}'",
        step.name
    );
    let now = Utc::now();
    let result = StepResult {
        step_name: step.name.clone(),
        uses: step.uses.as_str().to_string(),
        started_at: now,
        finished_at: now,
        success: false,
        exit_code: None,
        stdout_head: None,
        stderr_head: None,
        message: message.clone(),
    };
    (
        result,
        ScheduleFailure::Failed {
            code: ErrorCode::ExecutionTimeout,
            message,
        },
    )
}

async fn run_one(
    step: &Step,
    input_json: &str,
    template: &TemplateContext,
    run_env: &RunEnv<'_>,
    config: SchedulerConfig,
    deadline: Option<Instant>,
) -> OneOutcome {
    let max_attempts = step.retry.map_or(1, |r| r.max_attempts.max(1));
    let backoff_ms = step.retry.map_or(0, |r| r.backoff_ms);
    let execution_timeout_ms = config.execution_timeout_ms.unwrap_or(0);

    let started_at = Utc::now();
    let ctx = StepContext {
        bundle_root: run_env.bundle_root,
        input_json,
        env: run_env.env,
        template,
        http: run_env.http,
        cancel: run_env.cancel,
    };

    let mut last_attempt: Option<Attempt> = None;
    for attempt_no in 1..=max_attempts {
        // The execution deadline wins over launch and retry alike.
        let remaining_ms = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    let (result, failure) = execution_timeout_failure(step, execution_timeout_ms);
                    return OneOutcome {
                        result: StepResult {
                            started_at,
                            ..result
                        },
                        output: None,
                        failure: Some(failure),
                    };
                }
                Some(remaining.as_millis() as u64)
            }
            None => None,
        };

        let deadline_bound =
            remaining_ms.is_some_and(|remaining| remaining <= config.step_timeout_ms);
        let cap_ms = remaining_ms.map_or(config.step_timeout_ms, |remaining| {
            remaining.min(config.step_timeout_ms)
        });
        let cap = Duration::from_millis(cap_ms);

        let attempt = match step.uses {
            StepKind::Shell => run_shell(&step.name, &step.run, &ctx, cap).await,
            StepKind::Http => run_http(&step.name, &step.run, &ctx, cap).await,
        };

        if attempt.success {
            return OneOutcome {
                output: attempt.output.clone(),
                result: attempt_result(step, started_at, &attempt),
                failure: None,
            };
        }
        if attempt.canceled {
            let message = attempt.message.clone();
            return OneOutcome {
                result: attempt_result(step, started_at, &attempt),
                output: None,
                failure: Some(ScheduleFailure::Canceled { message }),
            };
        }
        if attempt.timed_out && deadline_bound {
            // The attempt was cut short by the execution deadline, not its
            // own step timeout.
            let (result, failure) = execution_timeout_failure(step, execution_timeout_ms);
            return OneOutcome {
                result: StepResult {
                    started_at,
                    stdout_head: head(&attempt.stdout),
                    stderr_head: head(&attempt.stderr),
                    ..result
                },
                output: None,
                failure: Some(failure),
            };
        }

        if attempt_no < max_attempts {
            debug!(
                step = %step.name,
                "retrying after failed attempt {attempt_no}/{max_attempts}"
            );
            if let Some(d) = deadline {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining < Duration::from_millis(backoff_ms) {
                    // Sleeping would overrun the deadline; fail now.
                    let (result, failure) = execution_timeout_failure(step, execution_timeout_ms);
                    return OneOutcome {
                        result: StepResult {
                            started_at,
                            ..result
                        },
                        output: None,
                        failure: Some(failure),
                    };
                }
            }
            let sleep = tokio::time::sleep(Duration::from_millis(backoff_ms));
            tokio::select! {
                () = sleep => {}
                () = run_env.cancel.cancelled() => {
                    let message = format!("step '{}' canceled during backoff", step.name);
                    let now = Utc::now();
                    return OneOutcome {
                        result: StepResult {
                            step_name: step.name.clone(),
                            uses: step.uses.as_str().to_string(),
                            started_at,
                            finished_at: now,
                            success: false,
                            exit_code: None,
                            stdout_head: None,
                            stderr_head: None,
                            message: message.clone(),
                        },
                        output: None,
                        failure: Some(ScheduleFailure::Canceled { message }),
                    };
                }
            }
        }
        last_attempt = Some(attempt);
    }

    // All attempts exhausted; surface the last attempt verbatim so the
    // failure message stays deterministic.
    let attempt = last_attempt.expect("at least one attempt ran");
    warn!(step = %step.name, message = %attempt.message, "step failed");
    let code = if attempt.timed_out {
        ErrorCode::StepTimeout
    } else {
        ErrorCode::StepFailed
    };
    OneOutcome {
        failure: Some(ScheduleFailure::Failed {
            code,
            message: attempt.message.clone(),
        }),
        result: attempt_result(step, started_at, &attempt),
        output: None,
    }
}

fn attempt_result(
    step: &Step,
    started_at: chrono::DateTime<Utc>,
    attempt: &Attempt,
) -> StepResult {
    StepResult {
        step_name: step.name.clone(),
        uses: step.uses.as_str().to_string(),
        started_at,
        finished_at: Utc::now(),
        success: attempt.success,
        exit_code: attempt.exit_code,
        stdout_head: head(&attempt.stdout),
        stderr_head: head(&attempt.stderr),
        message: attempt.message.clone(),
    }
}

fn head(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(truncate_head(text))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn manifest(yaml: &str) -> SpellManifest {
        SpellManifest::from_yaml(yaml).unwrap()
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            step_timeout_ms: 5_000,
            execution_timeout_ms: None,
        }
    }

    async fn run(
        manifest: &SpellManifest,
        dir: &Path,
        input: Value,
        config: SchedulerConfig,
    ) -> SchedulerRun {
        let env = BTreeMap::new();
        let http = reqwest::Client::new();
        let cancel = CancelToken::new();
        let run_env = RunEnv {
            bundle_root: dir,
            env: &env,
            http: &http,
            cancel: &cancel,
        };
        run_steps(manifest, &input, &run_env, config).await
    }

    #[tokio::test]
    async fn dag_order_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/a.sh", "#!/bin/sh\necho a >> order.txt\n");
        write_script(dir.path(), "steps/b.sh", "#!/bin/sh\necho b >> order.txt\n");
        write_script(dir.path(), "steps/c.sh", "#!/bin/sh\necho c >> order.txt\n");
        let m = manifest(
            r#"
id: acme/dag
version: 1.0.0
name: Dag
risk: low
steps:
  - uses: shell
    name: a
    run: steps/a.sh
  - uses: shell
    name: b
    run: steps/b.sh
    depends_on: [a]
  - uses: shell
    name: c
    run: steps/c.sh
    depends_on: [b]
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        assert!(result.failure.is_none());
        assert_eq!(result.executed, vec!["a", "b", "c"]);
        let order = std::fs::read_to_string(dir.path().join("order.txt")).unwrap();
        assert_eq!(order, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn outputs_are_published_per_step() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/hello.sh", "#!/bin/sh\necho hello world\n");
        let m = manifest(
            r#"
id: acme/hello
version: 1.0.0
name: Hello
risk: low
steps:
  - uses: shell
    name: hello
    run: steps/hello.sh
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        assert_eq!(
            result.outputs.get("step.hello.stdout"),
            Some(&json!("hello world\n"))
        );
    }

    #[tokio::test]
    async fn unsatisfiable_dependencies_deadlock() {
        // A two-node cycle cannot be declared (depends_on must point to
        // earlier steps), so deadlock is reached via a failed gate: build
        // the manifest by hand.
        let mut m = manifest(
            r#"
id: acme/dag
version: 1.0.0
name: Dag
risk: low
steps:
  - uses: shell
    name: a
    run: steps/a.sh
  - uses: shell
    name: b
    run: steps/b.sh
    depends_on: [a]
"#,
        );
        // Introduce an unresolvable edge after validation.
        m.steps[0].depends_on = vec!["b".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let result = run(&m, dir.path(), json!({}), config()).await;
        let failure = result.failure.unwrap();
        assert_eq!(failure.code(), Some(ErrorCode::StepDeadlock));
        assert_eq!(failure.message(), "step dependency deadlock: a, b");
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn failing_batch_settles_all_members() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/ok.sh", "#!/bin/sh\nsleep 0.2\necho ok\n");
        write_script(dir.path(), "steps/bad.sh", "#!/bin/sh\nexit 9\n");
        let m = manifest(
            r#"
id: acme/batch
version: 1.0.0
name: Batch
risk: low
runtime:
  max_parallel_steps: 2
steps:
  - uses: shell
    name: bad
    run: steps/bad.sh
  - uses: shell
    name: ok
    run: steps/ok.sh
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        // Both members produced a StepResult even though `bad` failed
        // first.
        assert_eq!(result.steps.len(), 2);
        let names: Vec<&str> = result.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert!(names.contains(&"bad"));
        assert!(names.contains(&"ok"));
        assert_eq!(result.executed, vec!["ok"]);
        assert_eq!(
            result.failure.unwrap().message(),
            "step failed: bad (exit code 9)"
        );
    }

    #[tokio::test]
    async fn input_condition_skips_step() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/a.sh", "#!/bin/sh\necho ran\n");
        let m = manifest(
            r#"
id: acme/cond
version: 1.0.0
name: Cond
risk: low
steps:
  - uses: shell
    name: only-fast
    run: steps/a.sh
    when:
      input_path: mode
      equals: fast
"#,
        );
        let result = run(&m, dir.path(), json!({"mode": "slow"}), config()).await;
        assert!(result.failure.is_none());
        assert_eq!(result.steps.len(), 1);
        assert!(result.steps[0].success);
        assert_eq!(result.steps[0].message, "skipped by condition");
        assert!(result.outputs.is_empty());
        assert!(result.executed.is_empty());

        let result = run(&m, dir.path(), json!({"mode": "fast"}), config()).await;
        assert_eq!(result.executed, vec!["only-fast"]);
    }

    #[tokio::test]
    async fn missing_output_reference_skips_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/a.sh", "#!/bin/sh\necho ran\n");
        let m = manifest(
            r#"
id: acme/cond
version: 1.0.0
name: Cond
risk: low
steps:
  - uses: shell
    name: gated
    run: steps/a.sh
    when:
      output_path: step.never.stdout
      equals: go
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        assert!(result.failure.is_none());
        assert_eq!(result.steps[0].message, "skipped by condition");
    }

    #[tokio::test]
    async fn output_condition_sees_prior_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/emit.sh", "#!/bin/sh\nprintf go\n");
        write_script(dir.path(), "steps/gated.sh", "#!/bin/sh\necho gated-ran\n");
        let m = manifest(
            r#"
id: acme/cond
version: 1.0.0
name: Cond
risk: low
steps:
  - uses: shell
    name: emit
    run: steps/emit.sh
  - uses: shell
    name: gated
    run: steps/gated.sh
    depends_on: [emit]
    when:
      output_path: step.emit.stdout
      equals: go
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        assert!(result.failure.is_none());
        assert_eq!(result.executed, vec!["emit", "gated"]);
    }

    #[tokio::test]
    async fn retry_runs_exactly_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        // Count attempts via an on-disk marker, then keep failing.
        write_script(
            dir.path(),
            "steps/flaky.sh",
            "#!/bin/sh\necho x >> attempts.txt\nexit 1\n",
        );
        let m = manifest(
            r#"
id: acme/retry
version: 1.0.0
name: Retry
risk: low
steps:
  - uses: shell
    name: flaky
    run: steps/flaky.sh
    retry:
      max_attempts: 3
      backoff_ms: 10
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        let attempts = std::fs::read_to_string(dir.path().join("attempts.txt")).unwrap();
        assert_eq!(attempts.lines().count(), 3);
        assert_eq!(
            result.failure.unwrap().message(),
            "step failed: flaky (exit code 1)"
        );
        // One StepResult for the step, not one per attempt.
        assert_eq!(result.steps.len(), 1);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "steps/flaky.sh",
            "#!/bin/sh\nif [ -f done ]; then echo ok; exit 0; fi\ntouch done\nexit 1\n",
        );
        let m = manifest(
            r#"
id: acme/retry
version: 1.0.0
name: Retry
risk: low
steps:
  - uses: shell
    name: flaky
    run: steps/flaky.sh
    retry:
      max_attempts: 2
      backoff_ms: 10
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        assert!(result.failure.is_none());
        assert_eq!(result.executed, vec!["flaky"]);
    }

    #[tokio::test]
    async fn execution_deadline_names_the_running_step() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/slow.sh", "#!/bin/sh\nsleep 0.3\n");
        let m = manifest(
            r#"
id: acme/slow
version: 1.0.0
name: Slow
risk: low
steps:
  - uses: shell
    name: slow
    run: steps/slow.sh
"#,
        );
        let cfg = SchedulerConfig {
            step_timeout_ms: 5_000,
            execution_timeout_ms: Some(80),
        };
        let result = run(&m, dir.path(), json!({}), cfg).await;
        let failure = result.failure.unwrap();
        assert_eq!(failure.code(), Some(ErrorCode::ExecutionTimeout));
        assert_eq!(
            failure.message(),
            "cast execution timed out after 80ms while running step 'slow'"
        );
    }

    #[tokio::test]
    async fn backoff_never_sleeps_past_deadline() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/fail.sh", "#!/bin/sh\nexit 1\n");
        let m = manifest(
            r#"
id: acme/retry
version: 1.0.0
name: Retry
risk: low
steps:
  - uses: shell
    name: fail
    run: steps/fail.sh
    retry:
      max_attempts: 10
      backoff_ms: 400
"#,
        );
        let cfg = SchedulerConfig {
            step_timeout_ms: 5_000,
            execution_timeout_ms: Some(150),
        };
        let started = Instant::now();
        let result = run(&m, dir.path(), json!({}), cfg).await;
        let failure = result.failure.unwrap();
        assert_eq!(failure.code(), Some(ErrorCode::ExecutionTimeout));
        // The 400ms backoff was not slept through.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/slow.sh", "#!/bin/sh\nsleep 5\n");
        let m = manifest(
            r#"
id: acme/slow
version: 1.0.0
name: Slow
risk: low
steps:
  - uses: shell
    name: slow
    run: steps/slow.sh
"#,
        );
        let env = BTreeMap::new();
        let http = reqwest::Client::new();
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let run_env = RunEnv {
            bundle_root: dir.path(),
            env: &env,
            http: &http,
            cancel: &cancel,
        };
        let result = run_steps(&m, &json!({}), &run_env, config()).await;
        assert!(matches!(
            result.failure,
            Some(ScheduleFailure::Canceled { .. })
        ));
    }

    #[tokio::test]
    async fn stdout_heads_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "steps/noisy.sh",
            "#!/bin/sh\nhead -c 1000 /dev/zero | tr '\\0' 'x'\n",
        );
        let m = manifest(
            r#"
id: acme/noisy
version: 1.0.0
name: Noisy
risk: low
steps:
  - uses: shell
    name: noisy
    run: steps/noisy.sh
"#,
        );
        let result = run(&m, dir.path(), json!({}), config()).await;
        let head = result.steps[0].stdout_head.as_ref().unwrap();
        assert_eq!(head.len(), 200);
        // The full stdout is still published as an output.
        assert_eq!(
            result.outputs["step.noisy.stdout"].as_str().unwrap().len(),
            1000
        );
    }
}
