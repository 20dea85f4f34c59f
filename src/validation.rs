//! Validation Runner: executes a ticket's validation commands in its
//! working directory.
//!
//! Subprocess timeout handling mirrors the teacher's
//! `hooks::runner::execute_hook_async`: spawn with piped stdout/stderr,
//! race the child's `wait()` against `tokio::time::timeout`, and on
//! timeout send a kill followed by a bounded grace wait before giving up.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::Result;

const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StepResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub steps: Vec<StepResult>,
}

impl ValidationReport {
    /// The first failing step's combined output, used to seed ticket
    /// feedback on a failed validation run.
    pub fn failure_summary(&self) -> Option<String> {
        self.steps.iter().find(|s| s.exit_code != Some(0)).map(|s| {
            if s.timed_out {
                format!("'{}' exceeded its timeout", s.command)
            } else {
                format!(
                    "'{}' exited {:?}:\n{}",
                    s.command,
                    s.exit_code,
                    if s.stderr.trim().is_empty() { &s.stdout } else { &s.stderr }
                )
            }
        })
    }
}

/// Run every command in `working_dir`, continuing after failures so every
/// step's outcome is captured (SPEC_FULL §4.6: "a single failed step keeps
/// running subsequent steps").
pub async fn run_validation(
    commands: &[String],
    working_dir: &Path,
    timeout_secs: u64,
) -> Result<ValidationReport> {
    let mut steps = Vec::with_capacity(commands.len());
    for command in commands {
        steps.push(run_step(command, working_dir, timeout_secs).await?);
    }
    let passed = steps.iter().all(|s| s.exit_code == Some(0));
    Ok(ValidationReport { passed, steps })
}

async fn run_step(command: &str, working_dir: &Path, timeout_secs: u64) -> Result<StepResult> {
    let started = std::time::Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(StepResult {
            command: command.to_string(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            duration: started.elapsed(),
        }),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            // `wait_with_output` consumed `child`; `kill_on_drop` above
            // ensures the orphaned process is killed when that future (and
            // the child within it) is dropped here.
            Ok(StepResult {
                command: command.to_string(),
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                duration: started.elapsed(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_steps_passing_yields_passed_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_validation(
            &["true".to_string(), "echo ok".to_string()],
            dir.path(),
            5,
        )
        .await
        .unwrap();
        assert!(report.passed);
        assert_eq!(report.steps.len(), 2);
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_later_steps() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_validation(
            &["false".to_string(), "echo still-ran".to_string()],
            dir.path(),
            5,
        )
        .await
        .unwrap();
        assert!(!report.passed);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[1].exit_code, Some(0));
    }

    #[tokio::test]
    async fn timeout_is_recorded_without_hanging() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_validation(&["sleep 5".to_string()], dir.path(), 1)
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(report.steps[0].timed_out);
    }
}
