// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rollback planning and compensation accounting.
//!
//! After any non-dry-run failure the planner walks the successfully
//! executed steps in reverse and runs each declared rollback handler as a
//! synthetic shell step named `rollback.<original>`. Handler failures are
//! recorded, never rethrown; only the execution deadline stops the pass
//! early, and handlers it never reached are recorded as timed out.

use crate::cancel::CancelToken;
use crate::executor::{StepContext, run_shell};
use crate::scheduler::{RunEnv, SchedulerConfig};
use chrono::Utc;
use spell_core::SpellManifest;
use spell_core::receipt::{RollbackState, RollbackSummary, StepResult, truncate_head};
use spell_core::template::TemplateContext;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Run the rollback pass. Returns the synthetic step results (in the order
/// they ran) and the compensation summary.
pub async fn run_rollback(
    manifest: &SpellManifest,
    executed: &[String],
    input_json: &str,
    run_env: &RunEnv<'_>,
    config: SchedulerConfig,
    deadline: Option<Instant>,
) -> (Vec<StepResult>, RollbackSummary) {
    let mut results = Vec::new();
    let mut summary = RollbackSummary {
        total_executed: executed.len(),
        rollback_planned: 0,
        rollback_attempted: 0,
        rollback_succeeded: 0,
        rollback_failed: 0,
        rollback_skipped_without_handler: 0,
        failed_steps: Vec::new(),
        state: RollbackState::NotNeeded,
        require_full_compensation: None,
        manual_recovery_required: None,
    };

    // Compensation must run even when the cast itself was cancelled, so
    // handlers get a token of their own.
    let rollback_cancel = CancelToken::new();
    let template = TemplateContext::default();
    let ctx = StepContext {
        bundle_root: run_env.bundle_root,
        input_json,
        env: run_env.env,
        template: &template,
        http: run_env.http,
        cancel: &rollback_cancel,
    };

    for name in executed.iter().rev() {
        let Some(step) = manifest.step(name) else {
            continue;
        };
        let Some(handler) = &step.rollback else {
            summary.rollback_skipped_without_handler += 1;
            continue;
        };
        summary.rollback_planned += 1;
        let rollback_name = format!("rollback.{name}");

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if matches!(remaining, Some(r) if r.is_zero()) {
            warn!(step = %rollback_name, "execution deadline expired before rollback");
            summary.rollback_failed += 1;
            summary.failed_steps.push(name.clone());
            let now = Utc::now();
            results.push(StepResult {
                step_name: rollback_name.clone(),
                uses: "shell".to_string(),
                started_at: now,
                finished_at: now,
                success: false,
                exit_code: None,
                stdout_head: None,
                stderr_head: None,
                message: format!(
                    "rollback step '{rollback_name}' timed out: execution deadline exceeded"
                ),
            });
            continue;
        }

        let cap = remaining.map_or(
            Duration::from_millis(config.step_timeout_ms),
            |r| r.min(Duration::from_millis(config.step_timeout_ms)),
        );

        summary.rollback_attempted += 1;
        let started_at = Utc::now();
        let attempt = run_shell(&rollback_name, handler, &ctx, cap).await;
        if attempt.success {
            info!(step = %rollback_name, "rollback succeeded");
            summary.rollback_succeeded += 1;
        } else {
            warn!(step = %rollback_name, message = %attempt.message, "rollback failed");
            summary.rollback_failed += 1;
            summary.failed_steps.push(name.clone());
        }
        results.push(StepResult {
            step_name: rollback_name,
            uses: "shell".to_string(),
            started_at,
            finished_at: Utc::now(),
            success: attempt.success,
            exit_code: attempt.exit_code,
            stdout_head: non_empty_head(&attempt.stdout),
            stderr_head: non_empty_head(&attempt.stderr),
            message: attempt.message,
        });
    }

    summary.state = classify(&summary);
    (results, summary)
}

fn non_empty_head(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(truncate_head(text))
    }
}

fn classify(summary: &RollbackSummary) -> RollbackState {
    if summary.total_executed == 0 {
        RollbackState::NotNeeded
    } else if summary.rollback_skipped_without_handler == 0
        && summary.rollback_planned > 0
        && summary.rollback_succeeded == summary.rollback_planned
    {
        RollbackState::FullyCompensated
    } else if summary.rollback_succeeded > 0 {
        RollbackState::PartiallyCompensated
    } else {
        RollbackState::NotCompensated
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

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

    const TWO_STEP: &str = r#"
id: acme/deploy
version: 1.0.0
name: Deploy
risk: low
steps:
  - uses: shell
    name: prepare
    run: steps/prepare.sh
    rollback: steps/rollback-prepare.sh
  - uses: shell
    name: deploy
    run: steps/deploy.sh
    depends_on: [prepare]
"#;

    async fn rollback(
        m: &SpellManifest,
        dir: &Path,
        executed: &[&str],
        deadline: Option<Instant>,
    ) -> (Vec<StepResult>, RollbackSummary) {
        let env = BTreeMap::new();
        let http = reqwest::Client::new();
        let cancel = CancelToken::new();
        let run_env = RunEnv {
            bundle_root: dir,
            env: &env,
            http: &http,
            cancel: &cancel,
        };
        let executed: Vec<String> = executed.iter().map(|s| (*s).to_string()).collect();
        run_rollback(
            m,
            &executed,
            &json!({}).to_string(),
            &run_env,
            SchedulerConfig {
                step_timeout_ms: 5_000,
                execution_timeout_ms: None,
            },
            deadline,
        )
        .await
    }

    #[tokio::test]
    async fn successful_handler_fully_compensates() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/rollback-prepare.sh", "#!/bin/sh\nexit 0\n");
        let m = manifest(TWO_STEP);

        let (results, summary) = rollback(&m, dir.path(), &["prepare"], None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].step_name, "rollback.prepare");
        assert!(results[0].success);
        assert_eq!(summary.state, RollbackState::FullyCompensated);
        assert_eq!(summary.total_executed, 1);
        assert_eq!(summary.rollback_succeeded, 1);
    }

    #[tokio::test]
    async fn nothing_executed_is_not_needed() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(TWO_STEP);
        let (results, summary) = rollback(&m, dir.path(), &[], None).await;
        assert!(results.is_empty());
        assert_eq!(summary.state, RollbackState::NotNeeded);
    }

    #[tokio::test]
    async fn failing_handler_is_recorded_not_rethrown() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/rollback-prepare.sh", "#!/bin/sh\nexit 1\n");
        let m = manifest(TWO_STEP);

        let (results, summary) = rollback(&m, dir.path(), &["prepare"], None).await;
        assert!(!results[0].success);
        assert_eq!(summary.state, RollbackState::NotCompensated);
        assert_eq!(summary.failed_steps, vec!["prepare"]);
    }

    #[tokio::test]
    async fn handlers_run_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "steps/rb-a.sh",
            "#!/bin/sh\necho a >> rollbacks.txt\n",
        );
        write_script(
            dir.path(),
            "steps/rb-b.sh",
            "#!/bin/sh\necho b >> rollbacks.txt\n",
        );
        let m = manifest(
            r#"
id: acme/multi
version: 1.0.0
name: Multi
risk: low
steps:
  - uses: shell
    name: a
    run: steps/a.sh
    rollback: steps/rb-a.sh
  - uses: shell
    name: b
    run: steps/b.sh
    rollback: steps/rb-b.sh
    depends_on: [a]
"#,
        );
        let (results, summary) = rollback(&m, dir.path(), &["a", "b"], None).await;
        assert_eq!(results[0].step_name, "rollback.b");
        assert_eq!(results[1].step_name, "rollback.a");
        assert_eq!(summary.state, RollbackState::FullyCompensated);
        let order = std::fs::read_to_string(dir.path().join("rollbacks.txt")).unwrap();
        assert_eq!(order, "b\na\n");
    }

    #[tokio::test]
    async fn mixed_outcomes_are_partial() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/rb-a.sh", "#!/bin/sh\nexit 0\n");
        write_script(dir.path(), "steps/rb-b.sh", "#!/bin/sh\nexit 1\n");
        let m = manifest(
            r#"
id: acme/multi
version: 1.0.0
name: Multi
risk: low
steps:
  - uses: shell
    name: a
    run: steps/a.sh
    rollback: steps/rb-a.sh
  - uses: shell
    name: b
    run: steps/b.sh
    rollback: steps/rb-b.sh
    depends_on: [a]
"#,
        );
        let (_, summary) = rollback(&m, dir.path(), &["a", "b"], None).await;
        assert_eq!(summary.state, RollbackState::PartiallyCompensated);
        assert_eq!(summary.rollback_succeeded, 1);
        assert_eq!(summary.rollback_failed, 1);
    }

    #[tokio::test]
    async fn executed_step_without_handler_blocks_full_compensation() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/rollback-prepare.sh", "#!/bin/sh\nexit 0\n");
        let m = manifest(TWO_STEP);

        // `deploy` executed too but has no handler.
        let (results, summary) = rollback(&m, dir.path(), &["prepare", "deploy"], None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(summary.rollback_skipped_without_handler, 1);
        assert_eq!(summary.state, RollbackState::PartiallyCompensated);
    }

    #[tokio::test]
    async fn expired_deadline_records_remaining_as_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "steps/rollback-prepare.sh", "#!/bin/sh\nexit 0\n");
        let m = manifest(TWO_STEP);

        let past = Instant::now() - Duration::from_millis(10);
        let (results, summary) = rollback(&m, dir.path(), &["prepare"], Some(past)).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].message.contains("execution deadline exceeded"));
        assert_eq!(summary.rollback_attempted, 0);
        assert_eq!(summary.rollback_failed, 1);
        assert_eq!(summary.state, RollbackState::NotCompensated);
    }
}
