//! Host tool invocation
//!
//! All partitioning and filesystem work goes through external tools.
//! Output is always captured; stderr reaches the user only under
//! `--debug`, otherwise a failure surfaces just the command line and
//! its exit code.

use crate::error::{ImagerError, ImagerResult};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured output of a successful invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs host tools with a stable C locale
#[derive(Debug, Clone, Copy)]
pub struct ToolRunner {
    pub debug: bool,
}

impl ToolRunner {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Run a tool, requiring exit code 0
    pub async fn run(&self, program: &str, args: &[&str]) -> ImagerResult<ToolOutput> {
        self.run_accepting(program, args, &[0]).await
    }

    /// Run a tool, accepting any of the listed exit codes
    pub async fn run_accepting(
        &self,
        program: &str,
        args: &[&str],
        accept: &[i32],
    ) -> ImagerResult<ToolOutput> {
        let command_line = render(program, args);
        debug!(command = %command_line, "running tool");

        let output = Command::new(program)
            .args(args)
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ImagerError::ToolSpawn {
                command: command_line.clone(),
                source: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if self.debug && !stderr.is_empty() {
            eprintln!("{stderr}");
        }

        if accept.contains(&code) {
            Ok(ToolOutput { stdout, stderr })
        } else {
            Err(ImagerError::tool_failed(
                command_line,
                code,
                self.debug.then_some(stderr),
            ))
        }
    }

    /// Run a tool, reporting only whether it succeeded
    pub async fn run_failsafe(&self, program: &str, args: &[&str]) -> bool {
        self.run(program, args).await.is_ok()
    }
}

fn render(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let runner = ToolRunner::new(false);
        let output = runner.run("echo", &["hello"]).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_error() {
        let runner = ToolRunner::new(false);
        let err = runner.run("false", &[]).await.unwrap_err();
        match err {
            ImagerError::ToolFailed { command, code, stderr } => {
                assert_eq!(command, "false");
                assert_eq!(code, 1);
                // stderr withheld outside debug
                assert!(stderr.is_none());
            }
            other => panic!("expected ToolFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_codes_pass() {
        let runner = ToolRunner::new(false);
        assert!(runner.run_accepting("false", &[], &[0, 1]).await.is_ok());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let runner = ToolRunner::new(false);
        assert!(matches!(
            runner.run("definitely-not-a-tool-zzz", &[]).await,
            Err(ImagerError::ToolSpawn { .. })
        ));
    }

    #[tokio::test]
    async fn failsafe_swallows_failure() {
        let runner = ToolRunner::new(false);
        assert!(!runner.run_failsafe("false", &[]).await);
        assert!(runner.run_failsafe("true", &[]).await);
    }
}
