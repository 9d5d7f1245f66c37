//! Subprocess transport for provider CLIs.
//!
//! A request `ec2.describe-instances {"instance-ids": ["i-1"], "dry-run": false}`
//! renders to `aws ec2 describe-instances --instance-ids i-1 --no-dry-run --output json`.

use super::Transport;
use crate::error_code::StandardErrorCode;
use crate::request::{normalize_key, Request};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

static PROVIDER_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"An error occurred \((?P<code>[^)]+)\)(?: when calling the \S+ operation)?(?: \([^)]*\))?:\s*(?P<message>.*)",
    )
    .unwrap_or_else(|e| panic!("provider error pattern: {e}"))
});

#[derive(Debug, Clone)]
pub struct CliTransport {
    program: String,
    /// Arguments placed before `<service> <operation>`.
    leading_args: Vec<String>,
    /// Arguments appended after the rendered parameters (`--region`, `--profile`).
    trailing_args: Vec<String>,
    env: Vec<(String, String)>,
}

impl Default for CliTransport {
    fn default() -> Self {
        Self::new("aws")
    }
}

impl CliTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            trailing_args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_global_arg(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailing_args.push(flag.into());
        self.trailing_args.push(value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument vector (without the program) for `request`.
    pub fn render_args(&self, request: &Request) -> Vec<String> {
        let target = request.target();
        let mut args = self.leading_args.clone();
        args.push(target.service.clone());
        args.push(target.operation.clone());
        for (key, value) in request.parameters() {
            let name = normalize_key(key);
            match value {
                Value::Null => {}
                Value::Bool(true) => args.push(format!("--{}", name)),
                Value::Bool(false) => args.push(format!("--no-{}", name)),
                Value::Array(items) if items.iter().all(is_scalar) => {
                    args.push(format!("--{}", name));
                    args.extend(items.iter().map(scalar_arg));
                }
                other => {
                    args.push(format!("--{}", name));
                    args.push(scalar_arg(other));
                }
            }
        }
        args.extend(self.trailing_args.iter().cloned());
        args.push("--output".to_string());
        args.push("json".to_string());
        args
    }
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn scalar_arg(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        // Structures go through as JSON, which provider CLIs accept inline.
        other => other.to_string(),
    }
}

/// Turn a failed invocation into a remote error, keeping the provider code.
pub(crate) fn parse_failure(exit_code: Option<i32>, stderr: &str) -> Error {
    if let Some(caps) = PROVIDER_ERROR.captures(stderr) {
        let code = caps.name("code").map(|m| m.as_str()).unwrap_or_default();
        let message = caps
            .name("message")
            .map(|m| m.as_str().trim())
            .unwrap_or_default();
        return Error::remote(code, message);
    }
    let message = stderr.trim();
    let message = if message.is_empty() {
        format!("process exited with {:?}", exit_code)
    } else {
        message.to_string()
    };
    Error::remote_classified(StandardErrorCode::from_exit_code(exit_code), message)
}

#[async_trait]
impl Transport for CliTransport {
    fn name(&self) -> &str {
        "cli"
    }

    async fn call(&self, request: &Request) -> Result<Value> {
        let args = self.render_args(request);
        debug!(program = %self.program, ?args, "invoking provider cli");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            Error::from(e).with_context(ErrorContext::new().with_source("cli_transport"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = parse_failure(output.status.code(), &stderr);
            warn!(target_op = %request.target(), status = ?output.status.code(), "provider cli failed");
            return Err(err.with_context(ErrorContext::new().with_source("cli_transport")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(Error::from)
    }
}
