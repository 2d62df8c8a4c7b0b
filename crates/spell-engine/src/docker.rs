// SPDX-License-Identifier: MIT OR Apache-2.0
//! Docker runner delegation.
//!
//! Docker-execution spells run the same scheduler, just inside the
//! declared image: the host serializes a [`RunnerRequest`] onto the
//! container's stdin, the in-container runtime executes the steps (and the
//! rollback pass, when needed) against the mounted bundle, and answers
//! with one [`RunnerResponse`] JSON document on stdout.

use crate::cancel::CancelToken;
use crate::rollback::run_rollback;
use crate::scheduler::{RunEnv, ScheduleFailure, SchedulerConfig, run_steps};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spell_core::receipt::{RollbackSummary, StepResult};
use spell_core::{ErrorCode, SpellManifest};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// Bundle mount point inside the container.
const CONTAINER_BUNDLE_DIR: &str = "/spell/bundle";

/// What the host sends to the in-container runner.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunnerRequest {
    /// The validated manifest.
    pub manifest: SpellManifest,
    /// The resolved input object.
    pub input: Value,
    /// Per-attempt cap.
    pub step_timeout_ms: u64,
    /// Whole-execution cap.
    pub execution_timeout_ms: Option<u64>,
}

/// Scheduler failure in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFailure {
    /// Stable error code; absent for cancellations.
    pub code: Option<ErrorCode>,
    /// Single-line cause.
    pub message: String,
    /// Whether the run was cancelled rather than failed.
    #[serde(default)]
    pub canceled: bool,
}

impl From<&ScheduleFailure> for WireFailure {
    fn from(failure: &ScheduleFailure) -> Self {
        Self {
            code: failure.code(),
            message: failure.message().to_string(),
            canceled: matches!(failure, ScheduleFailure::Canceled { .. }),
        }
    }
}

/// What the in-container runner answers with.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunnerResponse {
    /// Step results, rollback steps included.
    pub steps: Vec<StepResult>,
    /// Published outputs.
    pub outputs: Map<String, Value>,
    /// Steps that ran to success.
    pub executed: Vec<String>,
    /// Set when the run stopped early.
    pub failure: Option<WireFailure>,
    /// Compensation summary, when rollback ran.
    pub rollback: Option<RollbackSummary>,
}

/// Execute a docker spell by delegating to the runner inside the image.
pub async fn run_in_docker(
    manifest: &SpellManifest,
    bundle_dir: &Path,
    input: &Value,
    config: SchedulerConfig,
    cancel: &CancelToken,
) -> Result<RunnerResponse> {
    let Some(image) = &manifest.runtime.image else {
        bail!("docker execution requires runtime.image");
    };

    let mut cmd = Command::new("docker");
    cmd.arg("run")
        .arg("--rm")
        .arg("-i")
        .arg("-v")
        .arg(format!("{}:{CONTAINER_BUNDLE_DIR}:ro", bundle_dir.display()))
        .arg("-e")
        .arg(format!("SPELL_BUNDLE_DIR={CONTAINER_BUNDLE_DIR}"));
    // Connector tokens and runtime knobs cross the container boundary;
    // nothing else from the host environment does.
    for (name, _) in std::env::vars() {
        if (name.starts_with("CONNECTOR_") && name.ends_with("_TOKEN"))
            || name.starts_with("SPELL_RUNTIME_")
        {
            cmd.arg("-e").arg(&name);
        }
    }
    cmd.arg(image)
        .arg("spell")
        .arg("step-runner")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(image = %image, bundle = %bundle_dir.display(), "delegating to docker runner");
    let mut child = cmd.spawn().context("spawn docker")?;

    let request = RunnerRequest {
        manifest: manifest.clone(),
        input: input.clone(),
        step_timeout_ms: config.step_timeout_ms,
        execution_timeout_ms: config.execution_timeout_ms,
    };
    let payload = serde_json::to_vec(&request).context("serialize runner request")?;
    {
        let mut stdin = child.stdin.take().context("docker stdin unavailable")?;
        stdin.write_all(&payload).await.context("write runner request")?;
        stdin.shutdown().await.context("close docker stdin")?;
    }

    let wait = async {
        let mut stdout = child.stdout.take().context("docker stdout unavailable")?;
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.context("read runner response")?;
        let status = child.wait().await.context("wait for docker")?;
        Ok::<_, anyhow::Error>((status, out))
    };

    let (status, out) = tokio::select! {
        res = wait => res?,
        () = cancel.cancelled() => bail!("docker runner canceled"),
    };
    if !status.success() {
        bail!("docker runner exited with {status}");
    }
    serde_json::from_slice(&out).context("parse runner response")
}

/// In-container entry point: read one [`RunnerRequest`] from stdin, run
/// the scheduler (and rollback on failure) against the mounted bundle, and
/// answer on stdout.
pub async fn serve_runner() -> Result<()> {
    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .context("read runner request")?;
    let request: RunnerRequest =
        serde_json::from_slice(&raw).context("parse runner request")?;

    let bundle_dir = std::env::var("SPELL_BUNDLE_DIR")
        .unwrap_or_else(|_| CONTAINER_BUNDLE_DIR.to_string());
    let env: std::collections::BTreeMap<String, String> = std::env::vars().collect();
    let http = reqwest::Client::new();
    let cancel = CancelToken::new();
    let run_env = RunEnv {
        bundle_root: Path::new(&bundle_dir),
        env: &env,
        http: &http,
        cancel: &cancel,
    };
    let config = SchedulerConfig {
        step_timeout_ms: request.step_timeout_ms,
        execution_timeout_ms: request.execution_timeout_ms,
    };

    let mut run = run_steps(&request.manifest, &request.input, &run_env, config).await;
    let mut response = RunnerResponse {
        failure: run.failure.as_ref().map(WireFailure::from),
        rollback: None,
        ..RunnerResponse::default()
    };
    if run.failure.is_some() {
        let input_json = serde_json::to_string(&request.input)?;
        let (rollback_steps, summary) = run_rollback(
            &request.manifest,
            &run.executed,
            &input_json,
            &run_env,
            config,
            run.deadline,
        )
        .await;
        run.steps.extend(rollback_steps);
        response.rollback = Some(summary);
    }
    response.steps = run.steps;
    response.outputs = run.outputs;
    response.executed = run.executed;

    let out = serde_json::to_vec(&response)?;
    tokio::io::stdout().write_all(&out).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_failure_round_trips() {
        let wire = WireFailure {
            code: Some(ErrorCode::StepFailed),
            message: "step failed: x (exit code 1)".into(),
            canceled: false,
        };
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, Some(ErrorCode::StepFailed));
        assert!(!back.canceled);
    }

    #[test]
    fn runner_request_round_trips() {
        let manifest = SpellManifest::from_yaml(
            r#"
id: acme/hello
version: 1.0.0
name: Hello
risk: low
runtime:
  execution: docker
  image: ghcr.io/acme/spell:1
steps:
  - uses: shell
    name: hello
    run: steps/hello.sh
"#,
        )
        .unwrap();
        let request = RunnerRequest {
            manifest,
            input: serde_json::json!({"name": "world"}),
            step_timeout_ms: 60_000,
            execution_timeout_ms: Some(120_000),
        };
        let json = serde_json::to_vec(&request).unwrap();
        let back: RunnerRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.manifest.id, "acme/hello");
        assert_eq!(back.execution_timeout_ms, Some(120_000));
    }
}
