use std::time::Duration;

use tracing::{debug, warn};

use crate::app::config::ExecutionSettings;
use crate::app::error::AppError;
use crate::app::models::BackendAccess;
use crate::app::shell::backend::ShellBackend;
use crate::app::shell::runner::{run_command_with_timeout, CommandOutput};

/// Superuser backend. Every command gets a fresh `su` session; nothing is reused between calls.
#[derive(Debug, Clone)]
pub struct RootShell {
    su_program: String,
    session_timeout: Duration,
    probe_timeout: Duration,
    redirect_stderr: bool,
}

impl RootShell {
    pub fn new(su_program: impl Into<String>, session_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            su_program: su_program.into(),
            session_timeout,
            probe_timeout,
            redirect_stderr: true,
        }
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self::new(
            settings.su_program.clone(),
            Duration::from_secs(settings.session_timeout_secs),
            Duration::from_secs(settings.root_probe_timeout_secs),
        )
    }

    pub fn with_redirect_stderr(mut self, redirect: bool) -> Self {
        self.redirect_stderr = redirect;
        self
    }

    fn run(&self, command: &str, timeout: Duration, trace_id: &str) -> Result<CommandOutput, AppError> {
        let args = vec!["-c".to_string(), command.to_string()];
        run_command_with_timeout(&self.su_program, &args, timeout, trace_id).map_err(|err| {
            if err.error.starts_with("Failed to spawn") {
                AppError::dependency(format!("Root access denied: {}", err.error), trace_id)
            } else {
                err
            }
        })
    }
}

impl ShellBackend for RootShell {
    fn name(&self) -> &'static str {
        "root"
    }

    fn access(&self, trace_id: &str) -> BackendAccess {
        match self.run("id", self.probe_timeout, trace_id) {
            Ok(output) => {
                let granted = output.success() && output.stdout.contains("uid=0");
                debug!(trace_id = %trace_id, granted, "root probe finished");
                BackendAccess {
                    available: granted,
                    granted,
                }
            }
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "root probe failed");
                BackendAccess::default()
            }
        }
    }

    fn exec(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        let output = self.run(command, self.session_timeout, trace_id)?;
        let captured = if self.redirect_stderr {
            output.merged()
        } else {
            output.stdout.trim_end().to_string()
        };
        if output.success() {
            return Ok(captured);
        }
        warn!(
            trace_id = %trace_id,
            exit_code = ?output.exit_code,
            "root command failed"
        );
        let message = if self.redirect_stderr {
            captured
        } else {
            output.stderr.trim().to_string()
        };
        if message.trim().is_empty() {
            Err(AppError::command("Command failed", trace_id))
        } else {
            Err(AppError::command(message.trim().to_string(), trace_id))
        }
    }
}
