//! External package-manager invocation.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{FetchError, Result};

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `-1` when killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
            .trim()
            .to_string()
    }
}

/// Runs a program and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<CommandOutput> {
        // npm and friends are .cmd shims on Windows
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(program);
            c
        } else {
            Command::new(program)
        };

        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!("Running {} {}", program, args.join(" "));
        let output = cmd.output().await?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and turn a non-zero exit into [`FetchError::CommandFailed`].
pub(crate) async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
) -> Result<CommandOutput> {
    let output = runner.run(program, args, cwd).await?;

    if !output.success() {
        return Err(FetchError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            code: output.status,
            output: output.combined(),
        });
    }

    Ok(output)
}
