//! External command execution.
//!
//! Every management tool (`bluetoothctl`, `rfkill`, `nmcli`, `pactl`,
//! `busctl`, `notify-send`) is invoked through a [`CommandRunner`]. A
//! non-zero exit status is a normal [`CommandOutput`], only a missing
//! binary, a spawn failure or an elapsed timeout is an error.

use std::{fmt, io, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::debug;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::{process::Command, time};

/// Default time a single tool invocation may take.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Execution-environment failures.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
   #[error("Command not found: {0}")]
   NotFound(SmolStr),

   #[error("Permission denied running {0}")]
   PermissionDenied(SmolStr),

   #[error("`{command}` timed out after {after:?}")]
   Timeout { command: String, after: Duration },

   #[error("Failed to run `{command}`: {reason}")]
   Io { command: String, reason: String },
}

impl CommandError {
   /// Whether retrying the same invocation may succeed.
   pub const fn is_transient(&self) -> bool {
      matches!(self, Self::Timeout { .. })
   }
}

/// A single tool invocation. Arguments are passed as argv, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
   program: SmolStr,
   args: Vec<String>,
   /// Indices into `args` rendered as `******`.
   secret: Vec<usize>,
   timeout: Option<Duration>,
}

impl Invocation {
   pub fn new(program: &str) -> Self {
      Self {
         program: program.into(),
         args: Vec::new(),
         secret: Vec::new(),
         timeout: None,
      }
   }

   #[must_use]
   pub fn arg(mut self, arg: impl Into<String>) -> Self {
      self.args.push(arg.into());
      self
   }

   #[must_use]
   pub fn args<I, S>(mut self, args: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.args.extend(args.into_iter().map(Into::into));
      self
   }

   /// Appends an argument that is never rendered in logs.
   #[must_use]
   pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
      self.secret.push(self.args.len());
      self.args.push(arg.into());
      self
   }

   /// Overrides the runner's default timeout for this invocation.
   #[must_use]
   pub const fn timeout(mut self, timeout: Duration) -> Self {
      self.timeout = Some(timeout);
      self
   }

   pub fn program(&self) -> &str {
      &self.program
   }

   pub fn argv(&self) -> &[String] {
      &self.args
   }

   pub const fn timeout_override(&self) -> Option<Duration> {
      self.timeout
   }
}

impl fmt::Display for Invocation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.program)?;
      for (i, arg) in self.args.iter().enumerate() {
         if self.secret.contains(&i) {
            f.write_str(" ******")?;
         } else {
            write!(f, " {arg}")?;
         }
      }
      Ok(())
   }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
   pub stdout: String,
   pub stderr: String,
   /// Exit code, `None` when the process was terminated by a signal.
   pub status: Option<i32>,
}

impl CommandOutput {
   pub fn ok(stdout: impl Into<String>) -> Self {
      Self {
         stdout: stdout.into(),
         stderr: String::new(),
         status: Some(0),
      }
   }

   pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
      Self {
         stdout: String::new(),
         stderr: stderr.into(),
         status: Some(code),
      }
   }

   pub const fn success(&self) -> bool {
      matches!(self.status, Some(0))
   }

   /// Stdout followed by stderr; REPL-style tools report results on either.
   pub fn combined(&self) -> String {
      if self.stderr.is_empty() {
         self.stdout.clone()
      } else if self.stdout.is_empty() {
         self.stderr.clone()
      } else {
         format!("{}\n{}", self.stdout, self.stderr)
      }
   }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
   async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;
}

/// Type alias for a shared command runner.
pub type SharedRunner = Arc<dyn CommandRunner>;

/// Runs commands on the host with a fixed timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
   timeout: Duration,
}

impl SystemRunner {
   pub const fn new(timeout: Duration) -> Self {
      Self { timeout }
   }
}

impl Default for SystemRunner {
   fn default() -> Self {
      Self::new(DEFAULT_COMMAND_TIMEOUT)
   }
}

#[async_trait]
impl CommandRunner for SystemRunner {
   async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
      let limit = invocation.timeout_override().unwrap_or(self.timeout);
      debug!("Running command: {invocation}");

      let child = Command::new(invocation.program())
         .args(invocation.argv())
         .stdin(Stdio::null())
         .stdout(Stdio::piped())
         .stderr(Stdio::piped())
         .kill_on_drop(true)
         .spawn()
         .map_err(|e| spawn_error(invocation, &e))?;

      let output = time::timeout(limit, child.wait_with_output())
         .await
         .map_err(|_| CommandError::Timeout {
            command: invocation.to_string(),
            after: limit,
         })?
         .map_err(|e| CommandError::Io {
            command: invocation.to_string(),
            reason: e.to_string(),
         })?;

      Ok(CommandOutput {
         stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
         stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
         status: output.status.code(),
      })
   }
}

fn spawn_error(invocation: &Invocation, err: &io::Error) -> CommandError {
   match err.kind() {
      io::ErrorKind::NotFound => CommandError::NotFound(invocation.program.clone()),
      io::ErrorKind::PermissionDenied => CommandError::PermissionDenied(invocation.program.clone()),
      _ => CommandError::Io {
         command: invocation.to_string(),
         reason: err.to_string(),
      },
   }
}

/// Reports whether `program` can be executed at all.
pub async fn probe(runner: &dyn CommandRunner, program: &str) -> bool {
   match runner.run(&Invocation::new(program).arg("--version")).await {
      Ok(_) => true,
      Err(CommandError::NotFound(_) | CommandError::PermissionDenied(_)) => false,
      // Installed but slow or misbehaving; let the backend report its own failures.
      Err(e) => {
         debug!("Probe of {program} failed: {e}");
         true
      },
   }
}
