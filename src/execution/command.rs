//! External command handler.
//!
//! [`CommandHandler`] runs a program as a job. Standard output becomes the
//! run's output; a non-zero exit status fails the run with the captured
//! standard error. The child is killed when the run is cancelled.
//!
//! ```rust
//! use tickwork::CommandHandler;
//!
//! let backup = CommandHandler::builder("pg_dump")
//!     .args(["--format=custom", "--file=/backups/app.dump", "app"])
//!     .env("PGHOST", "db.internal")
//!     .working_dir("/backups")
//!     .build();
//! assert_eq!(backup.program(), "pg_dump");
//!
//! // A shell line, run through `sh -c`.
//! let cleanup = CommandHandler::shell("find /tmp/uploads -mtime +7 -delete");
//! assert_eq!(cleanup.program(), "sh");
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::core::job::{HandlerError, JobContext, JobHandler};

/// Bytes of standard error kept from a failed command.
pub(super) const MAX_STDERR_LEN: usize = 4096;

/// A job handler that executes an external command.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandHandler {
    /// Create a new builder for a command handler.
    pub fn builder(program: impl Into<String>) -> CommandHandlerBuilder {
        CommandHandlerBuilder::new(program)
    }

    /// Run a command line through `sh -c`.
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self::builder("sh").arg("-c").arg(command_line).build()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    fn command(&self, ctx: &JobContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("TICKWORK_JOB_ID", ctx.job_id.as_str())
            .env("TICKWORK_RUN_ID", ctx.run_id.to_string())
            .env("TICKWORK_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError> {
        let child = self
            .command(&ctx)
            .spawn()
            .map_err(|e| HandlerError::ExecutionFailed(format!("{}: {}", self.program, e)))?;

        // Dropping the output future kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| HandlerError::ExecutionFailed(e.to_string()))?
            }
            _ = ctx.cancelled() => {
                return Err(HandlerError::ExecutionFailed(format!(
                    "{} killed after cancellation",
                    self.program
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            Ok((!stdout.is_empty()).then_some(stdout))
        } else {
            Err(HandlerError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: tail(String::from_utf8_lossy(&output.stderr).trim_end(), MAX_STDERR_LEN),
            })
        }
    }
}

/// The last `max` bytes of `text`, cut on a character boundary.
pub(super) fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Builder for creating `CommandHandler` instances.
#[derive(Debug, Clone)]
pub struct CommandHandlerBuilder {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandHandlerBuilder {
    /// Create a new builder with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a single environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> CommandHandler {
        CommandHandler {
            program: self.program,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
        }
    }
}
