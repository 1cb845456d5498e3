use std::sync::Arc;

use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::inventory::InventoryCache;
use crate::app::models::{ActionResult, AppAction};
use crate::app::safety::SafetyValidator;
use crate::app::shell::manager::ShellManager;

/// Validates, maps and runs package actions. Both the package-name/safety checks and the
/// command gate run before anything is dispatched.
pub struct AppManager {
    shell: Arc<ShellManager>,
    inventory: Arc<InventoryCache>,
    safety: SafetyValidator,
}

pub fn command_for(package_name: &str, action: AppAction) -> String {
    match action {
        AppAction::Freeze => format!("pm disable-user --user 0 {package_name}"),
        AppAction::Unfreeze => format!("pm enable {package_name}"),
        AppAction::ForceStop => format!("am force-stop {package_name}"),
        AppAction::Uninstall => format!("pm uninstall -k --user 0 {package_name}"),
        AppAction::ClearCache => format!("pm clear --cache-only {package_name}"),
        AppAction::ClearData => format!("pm clear {package_name}"),
        AppAction::RestrictBackground => {
            format!("appops set {package_name} RUN_IN_BACKGROUND ignore")
        }
        AppAction::AllowBackground => format!("appops set {package_name} RUN_IN_BACKGROUND allow"),
    }
}

impl AppManager {
    pub fn new(shell: Arc<ShellManager>, inventory: Arc<InventoryCache>) -> Self {
        Self {
            shell,
            inventory,
            safety: SafetyValidator::new(),
        }
    }

    pub fn safety(&self) -> &SafetyValidator {
        &self.safety
    }

    fn run(&self, package_name: &str, action: AppAction, trace_id: &str) -> Result<(), AppError> {
        self.safety.validate_package_name(package_name, trace_id)?;
        self.safety.validate_action(package_name, action, trace_id)?;
        let command = command_for(package_name, action);
        self.shell.execute(&command, trace_id)?;
        Ok(())
    }

    pub fn execute_action(
        &self,
        package_name: &str,
        action: AppAction,
        trace_id: &str,
    ) -> ActionResult {
        match self.run(package_name, action, trace_id) {
            Ok(()) => {
                info!(
                    trace_id = %trace_id,
                    package_name,
                    action = action.as_str(),
                    "action succeeded"
                );
                self.inventory.invalidate();
                ActionResult::ok(package_name, action)
            }
            Err(err) => {
                warn!(
                    trace_id = %trace_id,
                    package_name,
                    action = action.as_str(),
                    code = %err.code,
                    error = %err.error,
                    "action failed"
                );
                ActionResult::failed(package_name, action, err.error)
            }
        }
    }

    /// Runs `action` on each package in order. `on_progress(current, total, package)` fires
    /// before each item; a failed item never stops the batch.
    pub fn execute_batch_action<F>(
        &self,
        package_names: &[String],
        action: AppAction,
        mut on_progress: F,
        trace_id: &str,
    ) -> Vec<ActionResult>
    where
        F: FnMut(usize, usize, &str),
    {
        let total = package_names.len();
        let mut results = Vec::with_capacity(total);
        for (index, package_name) in package_names.iter().enumerate() {
            on_progress(index + 1, total, package_name);
            results.push(self.execute_action(package_name, action, trace_id));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::inventory::tests::{fake_cache, FakeSource};
    use crate::app::shell::gate::CommandGate;
    use crate::app::shell::testing::RecordingBackend;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;

    fn manager(root: &RecordingBackend, source: FakeSource) -> (AppManager, Arc<InventoryCache>) {
        let shell = Arc::new(ShellManager::new(
            CommandGate::default(),
            Box::new(root.clone()),
            Box::new(RecordingBackend::unavailable()),
            Duration::from_secs(5),
        ));
        shell.initialize("t");
        let inventory = Arc::new(fake_cache(source));
        (AppManager::new(shell, Arc::clone(&inventory)), inventory)
    }

    #[test]
    fn critical_package_is_rejected_without_dispatch() {
        let root = RecordingBackend::ready();
        let (apps, _) = manager(&root, FakeSource::default());
        let result = apps.execute_action("com.android.systemui", AppAction::ForceStop, "t");
        assert!(!result.success);
        assert!(result.message.contains("not allowed"));
        assert!(root.commands().is_empty());
    }

    #[test]
    fn freeze_dispatches_disable_user() {
        let root = RecordingBackend::ready();
        let (apps, _) = manager(&root, FakeSource::default());
        let result = apps.execute_action("com.example.app", AppAction::Freeze, "t");
        assert!(result.success);
        assert_eq!(result.message, "Success");
        assert_eq!(
            root.commands(),
            vec!["pm disable-user --user 0 com.example.app".to_string()]
        );
    }

    #[test]
    fn invalid_package_name_is_rejected_without_dispatch() {
        let root = RecordingBackend::ready();
        let (apps, _) = manager(&root, FakeSource::default());
        let result = apps.execute_action("com.example;reboot", AppAction::ForceStop, "t");
        assert!(!result.success);
        assert_eq!(result.message, "Injection attempt detected");
        let result = apps.execute_action("", AppAction::ForceStop, "t");
        assert_eq!(result.message, "Package name is empty");
        assert!(root.commands().is_empty());
    }

    #[test]
    fn force_stop_only_packages_allow_just_force_stop() {
        let root = RecordingBackend::ready();
        let (apps, _) = manager(&root, FakeSource::default());
        let pkg = "com.miui.powerkeeper";
        assert!(!apps.execute_action(pkg, AppAction::Freeze, "t").success);
        assert!(apps.execute_action(pkg, AppAction::ForceStop, "t").success);
        assert_eq!(root.commands(), vec![format!("am force-stop {pkg}")]);
    }

    #[test]
    fn success_invalidates_inventory() {
        let root = RecordingBackend::ready().fail_on("com.broken", "Failure [DELETE_FAILED_INTERNAL_ERROR]");
        let source = FakeSource::default();
        let (apps, inventory) = manager(&root, source.clone());
        inventory.scan(false, "t").expect("scan");

        let failed = apps.execute_action("com.broken.app", AppAction::Uninstall, "t");
        assert!(!failed.success);
        assert!(failed.message.contains("DELETE_FAILED"));
        inventory.scan(false, "t").expect("scan");
        assert_eq!(source.scans.load(Ordering::SeqCst), 1);

        assert!(apps.execute_action("com.example.app", AppAction::ClearCache, "t").success);
        inventory.scan(false, "t").expect("scan");
        assert_eq!(source.scans.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_reports_progress_in_order_even_when_an_item_fails() {
        let root = RecordingBackend::ready().fail_on("com.example.p2", "Failure");
        let (apps, _) = manager(&root, FakeSource::default());
        let packages: Vec<String> = ["com.example.p1", "com.example.p2", "com.example.p3"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        let events = Mutex::new(Vec::new());
        let results = apps.execute_batch_action(
            &packages,
            AppAction::Freeze,
            |current, total, package| {
                events
                    .lock()
                    .unwrap()
                    .push((current, total, package.to_string()));
            },
            "t",
        );
        let events = events.into_inner().unwrap();
        assert_eq!(
            events,
            vec![
                (1, 3, "com.example.p1".to_string()),
                (2, 3, "com.example.p2".to_string()),
                (3, 3, "com.example.p3".to_string()),
            ]
        );
        let outcomes: Vec<bool> = results.iter().map(|result| result.success).collect();
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!(root.commands().len(), 3);
    }

    #[test]
    fn every_action_maps_to_a_gated_command() {
        let gate = CommandGate::default();
        for action in AppAction::ALL {
            assert!(gate.is_allowed(&command_for("com.example.app", action)));
        }
        assert_eq!(
            command_for("com.example.app", AppAction::Uninstall),
            "pm uninstall -k --user 0 com.example.app"
        );
    }
}
