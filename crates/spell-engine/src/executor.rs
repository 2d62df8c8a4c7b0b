// SPDX-License-Identifier: MIT OR Apache-2.0
//! Step executors.
//!
//! Shell steps spawn the `run` file directly (no shell interpretation)
//! with `INPUT_JSON` in the environment; http steps expand a JSON request
//! spec against `{INPUT.*, ENV.*}` and perform the call. Both honour a
//! per-attempt duration cap and the cast's cancellation token.

use crate::cancel::CancelToken;
use serde_json::Value;
use spell_core::template::{TemplateContext, apply_template};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Everything an executor needs for one attempt.
pub struct StepContext<'a> {
    /// Bundle root; `run` paths resolve against it and shell steps use it
    /// as their working directory.
    pub bundle_root: &'a Path,
    /// Canonical input JSON, exported as `INPUT_JSON`.
    pub input_json: &'a str,
    /// Extra environment merged over the inherited one.
    pub env: &'a BTreeMap<String, String>,
    /// Template sources for http request specs.
    pub template: &'a TemplateContext,
    /// Shared http client.
    pub http: &'a reqwest::Client,
    /// Cast-wide cancellation token.
    pub cancel: &'a CancelToken,
}

/// Outcome of one executor attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Exit code for shell attempts that ran to completion.
    pub exit_code: Option<i32>,
    /// Full captured stdout (truncated later for the receipt head).
    pub stdout: String,
    /// Full captured stderr.
    pub stderr: String,
    /// Single-line status.
    pub message: String,
    /// Published output: stdout string for shell, parsed body for http.
    pub output: Option<Value>,
    /// The attempt was cut off by its duration cap.
    pub timed_out: bool,
    /// The attempt was cut off by cancellation.
    pub canceled: bool,
}

impl Attempt {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            message,
            output: None,
            timed_out: false,
            canceled: false,
        }
    }
}

/// Run a shell step: spawn `run_path` with `cwd` at the bundle root.
pub async fn run_shell(
    name: &str,
    run_path: &str,
    ctx: &StepContext<'_>,
    max_duration: Duration,
) -> Attempt {
    let program = ctx.bundle_root.join(run_path);
    let mut cmd = Command::new(&program);
    cmd.current_dir(ctx.bundle_root)
        .env("INPUT_JSON", ctx.input_json)
        .envs(ctx.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return Attempt::failure(format!("step failed: {name} ({e})")),
    };

    debug!(step = %name, program = %program.display(), "spawned shell step");

    let wait = tokio::time::timeout(max_duration, child.wait_with_output());
    tokio::select! {
        res = wait => match res {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let code = output.status.code();
                if output.status.success() {
                    Attempt {
                        success: true,
                        exit_code: Some(0),
                        output: Some(Value::String(stdout.clone())),
                        stdout,
                        stderr,
                        message: "ok".to_string(),
                        timed_out: false,
                        canceled: false,
                    }
                } else {
                    let message = match code {
                        Some(n) => format!("step failed: {name} (exit code {n})"),
                        None => format!("step failed: {name} (terminated by signal)"),
                    };
                    Attempt {
                        success: false,
                        exit_code: code,
                        stdout,
                        stderr,
                        message,
                        output: None,
                        timed_out: false,
                        canceled: false,
                    }
                }
            }
            Ok(Err(e)) => Attempt::failure(format!("step failed: {name} ({e})")),
            // Dropping the timed-out future kills the child (kill_on_drop).
            Err(_) => Attempt {
                timed_out: true,
                ..Attempt::failure(format!(
                    "shell step '{name}' timed out after {}ms",
                    max_duration.as_millis()
                ))
            },
        },
        () = ctx.cancel.cancelled() => Attempt {
            canceled: true,
            ..Attempt::failure(format!("shell step '{name}' canceled"))
        },
    }
}

/// Run an http step: the `run` file is a JSON request spec
/// `{method, url, headers?, body?}` expanded with the template engine.
pub async fn run_http(
    name: &str,
    run_path: &str,
    ctx: &StepContext<'_>,
    max_duration: Duration,
) -> Attempt {
    let spec_path = ctx.bundle_root.join(run_path);
    let raw = match std::fs::read(&spec_path) {
        Ok(b) => b,
        Err(e) => return Attempt::failure(format!("step failed: {name} ({e})")),
    };
    let spec: Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(e) => {
            return Attempt::failure(format!("step failed: {name} (request spec: {e})"));
        }
    };
    let spec = match apply_template(&spec, ctx.template) {
        Ok(v) => v,
        Err(e) => return Attempt::failure(format!("step failed: {name} ({e})")),
    };

    let request = match build_request(name, ctx.http, &spec) {
        Ok(r) => r,
        Err(message) => return Attempt::failure(message),
    };
    let request = request.timeout(max_duration);

    let send = request.send();
    tokio::select! {
        res = send => match res {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let body: Value = serde_json::from_str(&text)
                    .unwrap_or_else(|_| Value::String(text.clone()));
                if status.is_success() {
                    Attempt {
                        success: true,
                        exit_code: None,
                        stdout: text,
                        stderr: String::new(),
                        message: "ok".to_string(),
                        output: Some(body),
                        timed_out: false,
                        canceled: false,
                    }
                } else {
                    Attempt {
                        stdout: text,
                        ..Attempt::failure(format!(
                            "step failed: {name} (http status {})",
                            status.as_u16()
                        ))
                    }
                }
            }
            Err(e) if e.is_timeout() => Attempt {
                timed_out: true,
                ..Attempt::failure(format!(
                    "http step '{name}' timed out after {}ms",
                    max_duration.as_millis()
                ))
            },
            Err(e) => Attempt::failure(format!("step failed: {name} ({e})")),
        },
        () = ctx.cancel.cancelled() => Attempt {
            canceled: true,
            ..Attempt::failure(format!("http step '{name}' canceled"))
        },
    }
}

fn build_request(
    name: &str,
    client: &reqwest::Client,
    spec: &Value,
) -> Result<reqwest::RequestBuilder, String> {
    let method_str = spec
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("step failed: {name} (request spec has no method)"))?;
    let method = reqwest::Method::from_bytes(method_str.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("step failed: {name} (bad method '{method_str}')"))?;
    let url = spec
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("step failed: {name} (request spec has no url)"))?;

    let mut request = client.request(method, url);

    // Headers are lowercased; a json content-type is defaulted in when the
    // body is a non-string value.
    let mut has_content_type = false;
    if let Some(headers) = spec.get("headers").and_then(Value::as_object) {
        for (key, value) in headers {
            let key = key.to_ascii_lowercase();
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if key == "content-type" {
                has_content_type = true;
            }
            request = request.header(key, value);
        }
    }

    match spec.get("body") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            request = request.body(s.clone());
        }
        Some(other) => {
            if !has_content_type {
                request = request.header("content-type", "application/json");
            }
            request = request.body(other.to_string());
        }
    }

    Ok(request)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    struct Fixture {
        dir: tempfile::TempDir,
        env: BTreeMap<String, String>,
        template: TemplateContext,
        http: reqwest::Client,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                env: BTreeMap::new(),
                template: TemplateContext::default(),
                http: reqwest::Client::new(),
                cancel: CancelToken::new(),
            }
        }

        fn ctx<'a>(&'a self, input_json: &'a str) -> StepContext<'a> {
            StepContext {
                bundle_root: self.dir.path(),
                input_json,
                env: &self.env,
                template: &self.template,
                http: &self.http,
                cancel: &self.cancel,
            }
        }
    }

    #[tokio::test]
    async fn shell_success_captures_stdout() {
        let fx = Fixture::new();
        write_script(fx.dir.path(), "hello.sh", "#!/bin/sh\necho hello $1\n");
        let attempt = run_shell("hello", "hello.sh", &fx.ctx("{}"), Duration::from_secs(5)).await;
        assert!(attempt.success);
        assert_eq!(attempt.exit_code, Some(0));
        assert_eq!(attempt.stdout, "hello\n");
        assert_eq!(attempt.output, Some(json!("hello\n")));
    }

    #[tokio::test]
    async fn shell_reads_input_json_env() {
        let fx = Fixture::new();
        write_script(fx.dir.path(), "env.sh", "#!/bin/sh\nprintf '%s' \"$INPUT_JSON\"\n");
        let attempt = run_shell(
            "env",
            "env.sh",
            &fx.ctx(r#"{"name":"world"}"#),
            Duration::from_secs(5),
        )
        .await;
        assert!(attempt.success);
        assert_eq!(attempt.stdout, r#"{"name":"world"}"#);
    }

    #[tokio::test]
    async fn shell_nonzero_exit_fails_with_code() {
        let fx = Fixture::new();
        write_script(fx.dir.path(), "fail.sh", "#!/bin/sh\necho oops >&2\nexit 3\n");
        let attempt = run_shell("deploy", "fail.sh", &fx.ctx("{}"), Duration::from_secs(5)).await;
        assert!(!attempt.success);
        assert_eq!(attempt.exit_code, Some(3));
        assert_eq!(attempt.message, "step failed: deploy (exit code 3)");
        assert_eq!(attempt.stderr, "oops\n");
    }

    #[tokio::test]
    async fn shell_timeout_kills_and_reports() {
        let fx = Fixture::new();
        write_script(fx.dir.path(), "slow.sh", "#!/bin/sh\nsleep 5\n");
        let attempt =
            run_shell("slow", "slow.sh", &fx.ctx("{}"), Duration::from_millis(80)).await;
        assert!(!attempt.success);
        assert!(attempt.timed_out);
        assert_eq!(attempt.message, "shell step 'slow' timed out after 80ms");
    }

    #[tokio::test]
    async fn shell_cancellation_kills_child() {
        let fx = Fixture::new();
        write_script(fx.dir.path(), "slow.sh", "#!/bin/sh\nsleep 5\n");
        let cancel = fx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let attempt = run_shell("slow", "slow.sh", &fx.ctx("{}"), Duration::from_secs(10)).await;
        assert!(!attempt.success);
        assert!(attempt.canceled);
    }

    #[tokio::test]
    async fn shell_missing_program_fails() {
        let fx = Fixture::new();
        let attempt =
            run_shell("ghost", "nope.sh", &fx.ctx("{}"), Duration::from_secs(1)).await;
        assert!(!attempt.success);
        assert!(attempt.message.starts_with("step failed: ghost"));
    }

    #[tokio::test]
    async fn http_step_expands_template_and_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/deploy"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"site": "api-demo"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;

        let mut fx = Fixture::new();
        fx.template.input = json!({"site_name": "api-demo"});
        std::fs::write(
            fx.dir.path().join("deploy.json"),
            serde_json::to_vec(&json!({
                "method": "post",
                "url": format!("{}/deploy", server.uri()),
                "body": {"site": "{{INPUT.site_name}}"}
            }))
            .unwrap(),
        )
        .unwrap();

        let attempt =
            run_http("deploy", "deploy.json", &fx.ctx("{}"), Duration::from_secs(5)).await;
        assert!(attempt.success, "{}", attempt.message);
        assert_eq!(attempt.output, Some(json!({"status": "ok"})));
    }

    #[tokio::test]
    async fn http_non_success_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fx = Fixture::new();
        std::fs::write(
            fx.dir.path().join("get.json"),
            serde_json::to_vec(&json!({"method": "GET", "url": format!("{}/x", server.uri())}))
                .unwrap(),
        )
        .unwrap();

        let attempt = run_http("ping", "get.json", &fx.ctx("{}"), Duration::from_secs(5)).await;
        assert!(!attempt.success);
        assert_eq!(attempt.message, "step failed: ping (http status 503)");
    }

    #[tokio::test]
    async fn http_non_json_body_is_kept_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/t"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .mount(&server)
            .await;

        let fx = Fixture::new();
        std::fs::write(
            fx.dir.path().join("get.json"),
            serde_json::to_vec(&json!({"method": "GET", "url": format!("{}/t", server.uri())}))
                .unwrap(),
        )
        .unwrap();

        let attempt = run_http("text", "get.json", &fx.ctx("{}"), Duration::from_secs(5)).await;
        assert!(attempt.success);
        assert_eq!(attempt.output, Some(json!("plain text")));
    }

    #[tokio::test]
    async fn http_unresolved_template_fails() {
        let fx = Fixture::new();
        std::fs::write(
            fx.dir.path().join("bad.json"),
            serde_json::to_vec(&json!({"method": "GET", "url": "{{INPUT.missing}}"})).unwrap(),
        )
        .unwrap();
        let attempt = run_http("bad", "bad.json", &fx.ctx("{}"), Duration::from_secs(1)).await;
        assert!(!attempt.success);
        assert!(attempt.message.contains("unresolved template"));
    }
}
