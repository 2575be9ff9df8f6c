//! Shell Command Steps
//!
//! Step functions that run a bash command, used by workflows loaded from
//! YAML. Handles:
//! - `{input}` placeholder substitution
//! - Working directory selection
//! - Turning stdout into the step output
//! - Killing the child process when the step is stopped

use std::path::PathBuf;
use std::process::Stdio;

use log::{debug, error};
use serde_json::Value;
use tokio::process::Command;

use super::context::StepContext;
use super::step::Step;
use crate::error::RunError;

/// A bash command run as a step function.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    working_dir: Option<PathBuf>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wraps the command in a step.
    pub fn into_step(self, id: impl Into<String>) -> Step {
        Step::new(id, move |input: Value, ctx: StepContext| {
            let command = self.clone();
            async move { command.execute(input, ctx).await }
        })
    }

    /// Runs the command once with `input` substituted.
    ///
    /// # Returns
    ///
    /// * `Ok(Value)` - trimmed stdout, parsed as JSON when it is valid JSON
    ///   and kept as a string otherwise
    /// * `Err` - the command exited non-zero, could not be spawned, or the
    ///   step was stopped (the child is killed in that case)
    pub async fn execute(&self, input: Value, ctx: StepContext) -> Result<Value, RunError> {
        let command_text = substitute_input(&self.command, &input);
        debug!("Step '{}' running: {}", ctx.step_id(), command_text);

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&command_text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let child = cmd.spawn()?;
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.stopped() => {
                // Dropping the child future kills the process
                return Err(format!("command for step '{}' was stopped", ctx.step_id()).into());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            if !stdout.trim().is_empty() {
                debug!("Step '{}' output:\n{}", ctx.step_id(), stdout.trim_end());
            }
            return Ok(parse_output(&stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        error!("Step '{}' failed with exit code: {}", ctx.step_id(), code);
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr.trim_end());
        }

        Err(format!("command exited with code {}: {}", code, stderr.trim()).into())
    }
}

/// Replaces `{input}` with the step input.
///
/// Strings are inserted verbatim; any other value is inserted as compact
/// JSON. `null` becomes the empty string.
pub fn substitute_input(command: &str, input: &Value) -> String {
    if !command.contains("{input}") {
        return command.to_string();
    }
    let text = match input {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    command.replace("{input}", &text)
}

/// Converts captured stdout into a step output.
pub fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::Context;
    use crate::workflow::model::Status;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn ctx(step: &str) -> StepContext {
        StepContext::new(step, Context::new(), CancellationToken::new())
    }

    #[test]
    fn test_substitute_input() {
        assert_eq!(substitute_input("echo {input}", &json!("hello")), "echo hello");
        assert_eq!(substitute_input("echo {input}", &json!(5)), "echo 5");
        assert_eq!(substitute_input("echo '{input}'", &json!({"a": 1})), r#"echo '{"a":1}'"#);
        assert_eq!(substitute_input("echo {input}", &Value::Null), "echo ");
        assert_eq!(substitute_input("echo fixed", &json!("ignored")), "echo fixed");
    }

    #[test]
    fn test_substitute_every_occurrence() {
        assert_eq!(substitute_input("{input}-{input}", &json!("x")), "x-x");
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("42\n"), json!(42));
        assert_eq!(parse_output(r#"{"ok": true}"#), json!({"ok": true}));
        assert_eq!(parse_output("  plain text \n"), json!("plain text"));
        assert_eq!(parse_output("\n"), Value::Null);
    }

    #[tokio::test]
    async fn test_execute_success() {
        let command = ShellCommand::new("echo $(( {input} + 1 ))");
        let output = command.execute(json!(41), ctx("inc")).await.unwrap();
        assert_eq!(output, json!(42));
    }

    #[tokio::test]
    async fn test_execute_failure_reports_exit_code() {
        let command = ShellCommand::new("echo 'bad input' >&2; exit 3");
        let err = command.execute(Value::Null, ctx("fails")).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("code 3"), "unexpected message: {}", message);
        assert!(message.contains("bad input"));
    }

    #[tokio::test]
    async fn test_execute_in_working_dir() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("data.txt"), "from file").unwrap();

        let command = ShellCommand::new("cat data.txt").with_working_dir(temp_dir.path());
        let output = command.execute(Value::Null, ctx("read")).await.unwrap();
        assert_eq!(output, json!("from file"));
    }

    #[tokio::test]
    async fn test_command_steps_chain() {
        let work = crate::execution::work::Work::new("shell");
        work.add(ShellCommand::new("echo $(( {input} + 1 ))").into_step("inc"))
            .add(ShellCommand::new("echo $(( {input} * 2 ))").into_step("double"));

        let snapshot = work.run(json!(5)).await.unwrap();
        assert_eq!(snapshot.output, Some(json!(12)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_kills_command() {
        let token = CancellationToken::new();
        let context = StepContext::new("sleeper", Context::new(), token.clone());
        let command = ShellCommand::new("sleep 5");

        let started = Instant::now();
        let handle = tokio::spawn(async move { command.execute(Value::Null, context).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        assert!(handle.await.unwrap().is_err());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopped_step_settles_stopped() {
        let step = ShellCommand::new("sleep 5").into_step("sleeper");
        let runner = step.clone();
        let handle = tokio::spawn(async move { runner.run(Value::Null).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        step.stop().await;
        assert_eq!(handle.await.unwrap().unwrap().status, Status::Stopped);
    }
}
