use std::process::Command;

use crate::ports::{LockAction, LockError};

/// Default lock command for systemd-logind desktops.
pub const DEFAULT_LOCK_COMMAND: &str = "loginctl lock-session";

/// Locks the session by running an external command.
pub struct CommandLockAction {
    program: String,
    args: Vec<String>,
}

impl CommandLockAction {
    /// Parse a whitespace-separated command line. Returns `None` when empty.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl LockAction for CommandLockAction {
    fn lock(&self) -> Result<(), LockError> {
        let command = self.command_line();
        tracing::info!(command = %command, "locking session");

        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .map_err(|source| LockError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !status.success() {
            return Err(LockError::Failed { command, status });
        }
        Ok(())
    }
}

/// Dry-run lock: records the decision without locking anything.
pub struct LogOnlyLockAction;

impl LockAction for LogOnlyLockAction {
    fn lock(&self) -> Result<(), LockError> {
        tracing::warn!("dry run: session lock suppressed");
        Ok(())
    }
}
