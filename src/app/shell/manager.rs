use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::{BackendAccess, ExecutionMode};
use crate::app::shell::backend::ShellBackend;
use crate::app::shell::gate::CommandGate;
use crate::app::shell::helper_client::HelperClient;
use crate::app::shell::root::RootShell;
use crate::app::shell::runner::run_shell_command;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ModeValidation {
    Valid { mode: ExecutionMode },
    Fallback { mode: ExecutionMode, reason: String },
}

impl ModeValidation {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            ModeValidation::Valid { mode } | ModeValidation::Fallback { mode, .. } => *mode,
        }
    }
}

/// Picks the execution backend and routes gated commands to it.
///
/// The mode is probed once (Root, then helper, then none) and cached until `reset` or an
/// explicit `set_mode`. It only ever changes by downgrading to `None` on its own.
pub struct ShellManager {
    gate: CommandGate,
    root: Box<dyn ShellBackend>,
    helper: Box<dyn ShellBackend>,
    mode: RwLock<Option<ExecutionMode>>,
    direct_timeout: Duration,
}

impl ShellManager {
    pub fn new(
        gate: CommandGate,
        root: Box<dyn ShellBackend>,
        helper: Box<dyn ShellBackend>,
        direct_timeout: Duration,
    ) -> Self {
        Self {
            gate,
            root,
            helper,
            mode: RwLock::new(None),
            direct_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            CommandGate::with_policy(
                &config.policy.extra_allowed_prefixes,
                &config.policy.extra_blocked_patterns,
            ),
            Box::new(RootShell::from_settings(&config.execution)),
            Box::new(HelperClient::from_settings(&config.execution)),
            Duration::from_secs(config.execution.session_timeout_secs),
        )
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
            .read()
            .map(|mode| mode.unwrap_or(ExecutionMode::None))
            .unwrap_or(ExecutionMode::None)
    }

    pub fn is_probed(&self) -> bool {
        self.mode.read().map(|mode| mode.is_some()).unwrap_or(false)
    }

    /// Name of the backend commands go to, `None` in view-only mode.
    pub fn active_backend(&self) -> Option<&'static str> {
        match self.mode() {
            ExecutionMode::Root => Some(self.root.name()),
            ExecutionMode::Helper => Some(self.helper.name()),
            ExecutionMode::None => None,
        }
    }

    fn store_mode(&self, mode: ExecutionMode) {
        if let Ok(mut current) = self.mode.write() {
            *current = Some(mode);
        }
    }

    pub fn root_access(&self, trace_id: &str) -> BackendAccess {
        self.root.access(trace_id)
    }

    pub fn helper_access(&self, trace_id: &str) -> BackendAccess {
        self.helper.access(trace_id)
    }

    fn is_ready(&self, mode: ExecutionMode, trace_id: &str) -> bool {
        match mode {
            ExecutionMode::Root => self.root_access(trace_id).ready(),
            ExecutionMode::Helper => self.helper_access(trace_id).ready(),
            ExecutionMode::None => true,
        }
    }

    fn detect(&self, trace_id: &str) -> ExecutionMode {
        if self.root_access(trace_id).ready() {
            ExecutionMode::Root
        } else if self.helper_access(trace_id).ready() {
            ExecutionMode::Helper
        } else {
            ExecutionMode::None
        }
    }

    /// Makes `mode` current, binding the helper when needed. A bind failure leaves the
    /// session in `None`.
    fn activate(&self, mode: ExecutionMode, trace_id: &str) -> ExecutionMode {
        if mode != ExecutionMode::Helper {
            self.helper.unbind();
        }
        let mode = if mode == ExecutionMode::Helper {
            match self.helper.bind(trace_id) {
                Ok(()) => ExecutionMode::Helper,
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "helper bind failed; view-only");
                    ExecutionMode::None
                }
            }
        } else {
            mode
        };
        self.store_mode(mode);
        info!(
            trace_id = %trace_id,
            mode = mode.as_str(),
            label = mode.display_name(),
            backend = self.active_backend().unwrap_or("none"),
            "execution mode selected"
        );
        mode
    }

    pub fn initialize(&self, trace_id: &str) -> ExecutionMode {
        let detected = self.detect(trace_id);
        self.activate(detected, trace_id)
    }

    /// Honors a persisted preference when that backend is usable right now; otherwise probes.
    pub fn initialize_with_preference(
        &self,
        preferred: Option<ExecutionMode>,
        trace_id: &str,
    ) -> ExecutionMode {
        match preferred {
            Some(mode) if self.is_ready(mode, trace_id) => self.activate(mode, trace_id),
            Some(mode) => {
                warn!(
                    trace_id = %trace_id,
                    preferred = mode.as_str(),
                    "preferred execution mode unavailable; probing"
                );
                self.initialize(trace_id)
            }
            None => self.initialize(trace_id),
        }
    }

    pub fn set_mode(&self, name: &str, trace_id: &str) -> Result<ExecutionMode, AppError> {
        let requested = ExecutionMode::from_name(name);
        match requested {
            ExecutionMode::Root if !self.root_access(trace_id).ready() => {
                return Err(AppError::dependency("Root not available", trace_id));
            }
            ExecutionMode::Helper => {
                let access = self.helper_access(trace_id);
                if !access.available {
                    return Err(AppError::dependency(
                        "Shizuku is not installed or running",
                        trace_id,
                    ));
                }
                if !access.granted {
                    return Err(AppError::dependency(
                        "Shizuku permission not granted",
                        trace_id,
                    ));
                }
            }
            _ => {}
        }
        Ok(self.activate(requested, trace_id))
    }

    /// Re-checks the active backend against live availability and downgrades to `None` when
    /// it has gone away.
    pub fn validate_and_fallback(&self, trace_id: &str) -> ModeValidation {
        let mode = self.mode();
        let reason = match mode {
            ExecutionMode::Root if !self.root_access(trace_id).ready() => {
                Some("Root access is no longer available")
            }
            ExecutionMode::Helper if !self.helper_access(trace_id).ready() => {
                Some("Shizuku is no longer available")
            }
            _ => None,
        };
        match reason {
            Some(reason) => {
                warn!(trace_id = %trace_id, from = mode.as_str(), reason, "execution mode downgraded");
                self.activate(ExecutionMode::None, trace_id);
                ModeValidation::Fallback {
                    mode: ExecutionMode::None,
                    reason: reason.to_string(),
                }
            }
            None => ModeValidation::Valid { mode },
        }
    }

    /// Forgets the probed mode; the next read probes again.
    pub fn reset(&self) {
        self.helper.unbind();
        if let Ok(mut current) = self.mode.write() {
            *current = None;
        }
    }

    pub fn execute(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        if let Err(err) = self.gate.check(command, trace_id) {
            warn!(trace_id = %trace_id, command = %command.trim(), "command rejected by gate");
            return Err(err);
        }
        match self.mode() {
            ExecutionMode::Root => self.root.exec(command, trace_id),
            ExecutionMode::Helper => self.helper.exec(command, trace_id),
            ExecutionMode::None => Err(AppError::dependency(
                "No execution mode available",
                trace_id,
            )),
        }
    }

    /// Gated, unprivileged `sh -c` as the host's own user.
    pub fn execute_direct(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        self.gate.check(command, trace_id)?;
        let output = run_shell_command(command, self.direct_timeout, trace_id)?;
        if output.success() {
            Ok(output.stdout.trim_end().to_string())
        } else {
            let message = output.merged();
            Err(AppError::command(
                if message.trim().is_empty() {
                    format!("Exit code: {}", output.exit_code.unwrap_or(-1))
                } else {
                    message.trim().to_string()
                },
                trace_id,
            ))
        }
    }

    /// Privileged when a backend is active, unprivileged otherwise.
    pub fn execute_read(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        if self.mode().can_execute_actions() {
            self.execute(command, trace_id)
        } else {
            self.execute_direct(command, trace_id)
        }
    }

    pub fn cleanup(&self) {
        self.helper.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::shell::testing::RecordingBackend;

    fn manager(root: &RecordingBackend, helper: &RecordingBackend) -> ShellManager {
        ShellManager::new(
            CommandGate::default(),
            Box::new(root.clone()),
            Box::new(helper.clone()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn detection_prefers_root_then_helper() {
        let root = RecordingBackend::ready();
        let helper = RecordingBackend::ready();
        let shell = manager(&root, &helper);
        assert!(!shell.is_probed());
        assert_eq!(shell.mode(), ExecutionMode::None);
        assert_eq!(shell.initialize("t"), ExecutionMode::Root);
        assert!(shell.is_probed());

        let shell = manager(&RecordingBackend::unavailable(), &helper);
        assert_eq!(shell.initialize("t"), ExecutionMode::Helper);
        assert_eq!(helper.bind_count(), 1);

        let not_granted = RecordingBackend::with_access(true, false);
        let shell = manager(&RecordingBackend::unavailable(), &not_granted);
        assert_eq!(shell.initialize("t"), ExecutionMode::None);
    }

    #[test]
    fn active_backend_follows_the_selected_mode() {
        let root = RecordingBackend::ready().named("root");
        let helper = RecordingBackend::ready().named("helper");
        let shell = manager(&root, &helper);
        assert_eq!(shell.active_backend(), None);
        shell.initialize("t");
        assert_eq!(shell.active_backend(), Some("root"));

        root.set_access(false, false);
        shell.reset();
        shell.initialize("t");
        assert_eq!(shell.active_backend(), Some("helper"));
    }

    #[test]
    fn helper_bind_failure_leaves_view_only() {
        let helper = RecordingBackend::ready().failing_bind();
        let shell = manager(&RecordingBackend::unavailable(), &helper);
        assert_eq!(shell.initialize("t"), ExecutionMode::None);
    }

    #[test]
    fn gate_rejection_never_reaches_backend() {
        let root = RecordingBackend::ready();
        let shell = manager(&root, &RecordingBackend::unavailable());
        shell.initialize("t");
        let err = shell.execute("reboot", "trace-gate").expect_err("blocked");
        assert_eq!(err.code, "ERR_AUTHORIZATION");
        let err = shell
            .execute("pm list packages; rm -rf /data", "trace-gate")
            .expect_err("blocked");
        assert_eq!(err.code, "ERR_AUTHORIZATION");
        assert!(root.commands().is_empty());
    }

    #[test]
    fn view_only_mode_fails_every_command() {
        let shell = manager(&RecordingBackend::unavailable(), &RecordingBackend::unavailable());
        assert_eq!(shell.initialize("t"), ExecutionMode::None);
        let err = shell.execute("pm list packages", "t").expect_err("no backend");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert_eq!(err.error, "No execution mode available");
    }

    #[test]
    fn execute_routes_to_the_active_backend() {
        let root = RecordingBackend::ready();
        let helper = RecordingBackend::ready();
        let shell = manager(&root, &helper);
        shell.set_mode("shizuku", "t").expect("helper ready");
        shell.execute("am force-stop com.example.app", "t").expect("exec");
        assert_eq!(helper.commands(), vec!["am force-stop com.example.app".to_string()]);
        assert!(root.commands().is_empty());

        shell.set_mode("ROOT", "t").expect("root ready");
        assert_eq!(helper.unbind_count(), 1);
        shell.execute("pm enable com.example.app", "t").expect("exec");
        assert_eq!(root.commands(), vec!["pm enable com.example.app".to_string()]);
    }

    #[test]
    fn set_mode_requires_live_backend() {
        let shell = manager(
            &RecordingBackend::unavailable(),
            &RecordingBackend::with_access(true, false),
        );
        assert_eq!(
            shell.set_mode("ROOT", "t").expect_err("no root").error,
            "Root not available"
        );
        assert_eq!(
            shell.set_mode("SHIZUKU", "t").expect_err("no grant").error,
            "Shizuku permission not granted"
        );
        assert_eq!(shell.set_mode("whatever", "t").expect("none"), ExecutionMode::None);
    }

    #[test]
    fn preference_is_honored_only_when_ready() {
        let root = RecordingBackend::ready();
        let helper = RecordingBackend::ready();
        let shell = manager(&root, &helper);
        assert_eq!(
            shell.initialize_with_preference(Some(ExecutionMode::Helper), "t"),
            ExecutionMode::Helper
        );

        let shell = manager(&root, &RecordingBackend::unavailable());
        assert_eq!(
            shell.initialize_with_preference(Some(ExecutionMode::Helper), "t"),
            ExecutionMode::Root
        );
    }

    #[test]
    fn validation_downgrades_when_backend_disappears() {
        let root = RecordingBackend::ready();
        let shell = manager(&root, &RecordingBackend::unavailable());
        shell.initialize("t");
        assert_eq!(
            shell.validate_and_fallback("t"),
            ModeValidation::Valid {
                mode: ExecutionMode::Root
            }
        );

        root.set_access(false, false);
        let validation = shell.validate_and_fallback("t");
        assert_eq!(validation.mode(), ExecutionMode::None);
        assert!(matches!(validation, ModeValidation::Fallback { .. }));
        assert_eq!(shell.mode(), ExecutionMode::None);
    }

    #[test]
    fn reset_forgets_the_probe() {
        let shell = manager(&RecordingBackend::ready(), &RecordingBackend::unavailable());
        shell.initialize("t");
        shell.reset();
        assert!(!shell.is_probed());
    }

    #[test]
    fn execute_direct_is_gated_and_unprivileged() {
        let shell = manager(&RecordingBackend::unavailable(), &RecordingBackend::unavailable());
        let err = shell.execute_direct("echo hi", "t").expect_err("not allowed");
        assert_eq!(err.code, "ERR_AUTHORIZATION");
    }
}
