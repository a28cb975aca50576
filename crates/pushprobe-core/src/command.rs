use crate::error::{CoreError, Result};
use async_trait::async_trait;
use tracing::debug;

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Port for invoking external OS commands.
///
/// Every subprocess the fleet touches (cloud CLI, emulator tooling, receipt
/// scripts) goes through this trait so tests can substitute a scripted fake.
#[async_trait]
pub trait Commander: Send + Sync {
    /// Run a command to completion, failing on a non-zero exit code.
    async fn run(&self, program: &str, args: &[&str]) -> Result<()>;

    /// Run a command to completion and capture its stdout, failing on a
    /// non-zero exit code.
    async fn output(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Start a command without waiting for it to finish.
    async fn spawn(&self, program: &str, args: &[&str]) -> Result<()>;
}

/// Commander backed by real host subprocesses
pub struct HostCommander;

impl HostCommander {
    async fn exec(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("Executing: {} {}", program, args.join(" "));

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                CoreError::command_failed(
                    format!("{} {}", program, args.join(" ")),
                    -1,
                    e.to_string(),
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        debug!(
            "Command exited with code {}: {} {}",
            exit_code,
            program,
            args.join(" ")
        );

        if exit_code != 0 {
            return Err(CoreError::command_failed(
                format!("{} {}", program, args.join(" ")),
                exit_code,
                &stderr,
            ));
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

#[async_trait]
impl Commander for HostCommander {
    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        self.exec(program, args).await.map(|_| ())
    }

    async fn output(&self, program: &str, args: &[&str]) -> Result<String> {
        self.exec(program, args).await.map(|out| out.stdout)
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<()> {
        debug!("Spawning: {} {}", program, args.join(" "));

        tokio::process::Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| {
                CoreError::command_failed(
                    format!("{} {}", program, args.join(" ")),
                    -1,
                    e.to_string(),
                )
            })?;
        Ok(())
    }
}
