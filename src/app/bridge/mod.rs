//! JSON bridge between the web front end and the native components.
//!
//! Every public method swallows its errors and returns a plain value: a failed call shows up as
//! `false`, an empty list or a failure result, never as an error crossing the bridge. Requests
//! arrive one JSON object per line (`{"id","method","args"}`); responses and pushed events go
//! back the same way.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::error::AppError;
use crate::app::models::{
    ActionLog, ActionResult, AppAction, AppActivities, AppActivityFilter, AppFilter, AppInfo,
    BackendAccess, BatchComplete, BatchProgress, IconPayload, SafetyStatus,
};
use crate::app::monitor::{clamp_interval_ms, DeviceInfo, RealtimeStatus, SystemStats};
use crate::app::shell::manager::ModeValidation;
use crate::app::state::AppState;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    Callback { callback_id: String, payload: Value },
    SystemStats { stats: SystemStats },
    RealtimeStatus { status: RealtimeStatus },
}

pub type Emitter = Arc<dyn Fn(BridgeEvent) + Send + Sync>;

fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn decode_or_default<T: for<'de> Deserialize<'de> + Default>(raw: &str, what: &str) -> T {
    match serde_json::from_str::<T>(raw) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, what, "malformed bridge input; using defaults");
            T::default()
        }
    }
}

fn invalid_action() -> Value {
    json!({ "success": false, "message": "Invalid action" })
}

#[derive(Clone)]
pub struct NativeBridge {
    state: Arc<AppState>,
    emit: Emitter,
}

impl NativeBridge {
    pub fn new(state: Arc<AppState>, emit: Emitter) -> Self {
        Self { state, emit }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Probes on first use, afterwards re-validates the cached mode against live availability.
    pub fn get_execution_mode(&self, trace_id: Option<String>) -> String {
        let trace_id = resolve_trace_id(trace_id);
        let shell = &self.state.shell;
        let mode = if shell.is_probed() {
            shell.validate_and_fallback(&trace_id).mode()
        } else {
            self.state.select_initial_mode(&trace_id)
        };
        mode.as_str().to_string()
    }

    pub fn set_execution_mode(&self, mode_name: &str, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        match self.state.shell.set_mode(mode_name, &trace_id) {
            Ok(mode) => {
                if let Err(err) = self.state.persist_preferred_mode(mode, &trace_id) {
                    warn!(trace_id = %trace_id, error = %err, "failed to persist execution mode");
                }
                true
            }
            Err(err) => {
                warn!(trace_id = %trace_id, mode = mode_name, error = %err, "set execution mode failed");
                false
            }
        }
    }

    pub fn reset_execution_mode(&self, trace_id: Option<String>) -> String {
        let trace_id = resolve_trace_id(trace_id);
        self.state.shell.reset();
        self.state.shell.initialize(&trace_id).as_str().to_string()
    }

    pub fn validate_execution_mode(&self, trace_id: Option<String>) -> ModeValidation {
        let trace_id = resolve_trace_id(trace_id);
        self.state.shell.validate_and_fallback(&trace_id)
    }

    pub fn check_shizuku_access(&self, trace_id: Option<String>) -> BackendAccess {
        let trace_id = resolve_trace_id(trace_id);
        self.state.shell.helper_access(&trace_id)
    }

    pub fn check_root_access(&self, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        self.state.shell.root_access(&trace_id).ready()
    }

    pub fn get_app_list(&self, filter_json: &str, trace_id: Option<String>) -> Vec<AppInfo> {
        let trace_id = resolve_trace_id(trace_id);
        let filter: AppFilter = decode_or_default(filter_json, "app filter");
        self.state
            .inventory
            .list(&filter, &trace_id)
            .unwrap_or_else(|err| {
                warn!(trace_id = %trace_id, error = %err, "app list failed");
                Vec::new()
            })
    }

    pub fn get_app_icon(&self, package_name: &str, trace_id: Option<String>) -> IconPayload {
        let trace_id = resolve_trace_id(trace_id);
        self.state
            .inventory
            .app_icon(package_name, &trace_id)
            .unwrap_or_else(|_| IconPayload {
                package_name: package_name.to_string(),
                icon_base64: None,
            })
    }

    /// `{}` when the package is unknown.
    pub fn get_app_detail(&self, package_name: &str, trace_id: Option<String>) -> Value {
        let trace_id = resolve_trace_id(trace_id);
        match self.state.inventory.app_detail(package_name, &trace_id) {
            Ok(app) => to_json(&app),
            Err(err) => {
                debug!(trace_id = %trace_id, package_name, error = %err, "app detail unavailable");
                json!({})
            }
        }
    }

    pub fn get_safety_status(&self, package_name: &str) -> SafetyStatus {
        self.state.apps.safety().status(package_name)
    }

    fn log_results(&self, action: AppAction, results: &[ActionResult], trace_id: &str) {
        if results.is_empty() {
            return;
        }
        if let Some(history) = &self.state.history {
            if let Err(err) = history.record_results(action, results, trace_id) {
                warn!(trace_id = %trace_id, error = %err, "failed to record action");
            }
        }
    }

    fn run_action(&self, package_name: &str, action: AppAction, trace_id: &str) -> Value {
        self.state.ensure_mode(trace_id);
        let result = self.state.apps.execute_action(package_name, action, trace_id);
        self.log_results(action, std::slice::from_ref(&result), trace_id);
        to_json(&result)
    }

    pub fn execute_action(
        &self,
        package_name: &str,
        action_name: &str,
        trace_id: Option<String>,
    ) -> Value {
        let trace_id = resolve_trace_id(trace_id);
        match AppAction::from_name(action_name) {
            Some(action) => self.run_action(package_name, action, &trace_id),
            None => invalid_action(),
        }
    }

    pub fn clear_cache(&self, package_name: &str, trace_id: Option<String>) -> Value {
        let trace_id = resolve_trace_id(trace_id);
        self.run_action(package_name, AppAction::ClearCache, &trace_id)
    }

    pub fn clear_data(&self, package_name: &str, trace_id: Option<String>) -> Value {
        let trace_id = resolve_trace_id(trace_id);
        self.run_action(package_name, AppAction::ClearData, &trace_id)
    }

    fn callback<T: Serialize>(&self, callback_id: &str, payload: &T) {
        (self.emit)(BridgeEvent::Callback {
            callback_id: callback_id.to_string(),
            payload: to_json(payload),
        });
    }

    /// Runs the batch on a worker thread; progress and completion arrive as callbacks.
    pub fn execute_batch_action(
        &self,
        packages_json: &str,
        action_name: &str,
        callback_id: &str,
        trace_id: Option<String>,
    ) -> bool {
        let bridge = self.clone();
        let packages_json = packages_json.to_string();
        let action_name = action_name.to_string();
        let callback_id = callback_id.to_string();
        let spawned = std::thread::Builder::new()
            .name("batch-action".to_string())
            .spawn(move || bridge.run_batch(&packages_json, &action_name, &callback_id, trace_id));
        match spawned {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "failed to start batch worker");
                false
            }
        }
    }

    /// Synchronous body of `execute_batch_action`.
    pub fn run_batch(
        &self,
        packages_json: &str,
        action_name: &str,
        callback_id: &str,
        trace_id: Option<String>,
    ) -> BatchComplete {
        let trace_id = resolve_trace_id(trace_id);
        let packages = serde_json::from_str::<Vec<String>>(packages_json);
        let action = AppAction::from_name(action_name);
        let (Ok(packages), Some(action)) = (packages, action) else {
            warn!(trace_id = %trace_id, action = action_name, "rejected batch request");
            let complete = BatchComplete::empty();
            self.callback(callback_id, &complete);
            return complete;
        };

        self.state.ensure_mode(&trace_id);
        let results = self.state.apps.execute_batch_action(
            &packages,
            action,
            |current, total, package_name| {
                self.callback(callback_id, &BatchProgress::new(current, total, package_name));
            },
            &trace_id,
        );
        self.state.inventory.invalidate();
        self.log_results(action, &results, &trace_id);

        let success_count = results.iter().filter(|result| result.success).count();
        let complete = BatchComplete::new(packages.len(), success_count, results.len() - success_count);
        info!(
            trace_id = %trace_id,
            action = action.as_str(),
            total = complete.total,
            failed = complete.failure_count,
            "batch finished"
        );
        self.callback(callback_id, &complete);
        complete
    }

    pub fn get_system_stats(&self) -> SystemStats {
        self.state.stats_source.snapshot()
    }

    pub fn start_system_monitor(&self, interval_ms: Option<u64>, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        let interval = clamp_interval_ms(interval_ms, self.state.config().monitor.default_interval_ms);
        let emit = Arc::clone(&self.emit);
        let source = Arc::clone(&self.state.stats_source);
        self.state
            .poller
            .start(
                move || source.snapshot(),
                interval,
                Arc::new(move |stats: SystemStats| emit(BridgeEvent::SystemStats { stats })),
                &trace_id,
            )
            .map_err(|err| warn!(trace_id = %trace_id, error = %err, "monitor start failed"))
            .is_ok()
    }

    pub fn stop_system_monitor(&self) -> bool {
        self.state.poller.stop()
    }

    /// Pushes core frequencies and thermal readings on their own loop, independent of system stats.
    pub fn start_realtime_monitor(&self, interval_ms: Option<u64>, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        let interval = clamp_interval_ms(interval_ms, self.state.config().monitor.realtime_interval_ms);
        let emit = Arc::clone(&self.emit);
        let source = Arc::clone(&self.state.stats_source);
        self.state
            .realtime_poller
            .start(
                move || source.realtime(),
                interval,
                Arc::new(move |status: RealtimeStatus| emit(BridgeEvent::RealtimeStatus { status })),
                &trace_id,
            )
            .map_err(|err| warn!(trace_id = %trace_id, error = %err, "realtime monitor start failed"))
            .is_ok()
    }

    pub fn stop_realtime_monitor(&self) -> bool {
        self.state.realtime_poller.stop()
    }

    pub fn get_device_info(&self) -> DeviceInfo {
        self.state.stats_source.device_info()
    }

    pub fn get_activities(&self, filter_json: &str, trace_id: Option<String>) -> Vec<AppActivities> {
        let trace_id = resolve_trace_id(trace_id);
        let filter: AppActivityFilter = decode_or_default(filter_json, "activity filter");
        self.state
            .inventory
            .activities(&filter, &trace_id)
            .unwrap_or_else(|err| {
                warn!(trace_id = %trace_id, error = %err, "activity listing failed");
                Vec::new()
            })
    }

    /// Privileged when a backend is active (non-exported activities work), otherwise as the
    /// host's own user.
    fn start(&self, command: &str, trace_id: &str) -> Result<(), AppError> {
        self.state.ensure_mode(trace_id);
        let output = self.state.shell.execute_read(command, trace_id)?;
        if output.contains("Error:") || output.contains("No activities found") {
            return Err(AppError::command(output.trim().to_string(), trace_id));
        }
        Ok(())
    }

    fn start_component(
        &self,
        package_name: &str,
        class_name: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let safety = self.state.apps.safety();
        safety.validate_package_name(package_name, trace_id)?;
        safety.validate_component_name(class_name, trace_id)?;
        self.start(&format!("am start -n '{package_name}/{class_name}'"), trace_id)
    }

    pub fn launch_activity(
        &self,
        package_name: &str,
        activity_name: &str,
        trace_id: Option<String>,
    ) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        self.start_component(package_name, activity_name, &trace_id)
            .map_err(|err| {
                warn!(trace_id = %trace_id, package_name, activity_name, error = %err, "launch activity failed")
            })
            .is_ok()
    }

    pub fn launch_app(&self, package_name: &str, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        let launched = self
            .state
            .apps
            .safety()
            .validate_package_name(package_name, &trace_id)
            .and_then(|_| {
                self.start(
                    &format!("monkey -p {package_name} -c android.intent.category.LAUNCHER 1"),
                    &trace_id,
                )
            });
        launched
            .map_err(|err| warn!(trace_id = %trace_id, package_name, error = %err, "launch app failed"))
            .is_ok()
    }

    pub fn open_app_settings(&self, package_name: &str, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        let opened = self
            .state
            .apps
            .safety()
            .validate_package_name(package_name, &trace_id)
            .and_then(|_| {
                self.start(
                    &format!(
                        "am start -a android.settings.APPLICATION_DETAILS_SETTINGS -d package:{package_name}"
                    ),
                    &trace_id,
                )
            });
        opened
            .map_err(|err| warn!(trace_id = %trace_id, package_name, error = %err, "open app settings failed"))
            .is_ok()
    }

    /// Tries each `package/class` candidate in order and stops at the first that starts.
    pub fn open_hidden_setting(&self, intents_json: &str, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        let Ok(intents) = serde_json::from_str::<Vec<String>>(intents_json) else {
            return false;
        };
        for intent in intents {
            let parts: Vec<&str> = intent.split('/').collect();
            let [package_name, class_name] = parts.as_slice() else {
                continue;
            };
            match self.start_component(package_name, class_name, &trace_id) {
                Ok(()) => return true,
                Err(err) => debug!(trace_id = %trace_id, intent = %intent, error = %err, "hidden setting candidate failed"),
            }
        }
        false
    }

    pub fn get_action_history(&self, limit: Option<usize>, trace_id: Option<String>) -> Vec<ActionLog> {
        let trace_id = resolve_trace_id(trace_id);
        let Some(history) = &self.state.history else {
            return Vec::new();
        };
        let limit = limit.unwrap_or(self.state.config().history.max_entries);
        history.recent(limit, &trace_id).unwrap_or_else(|err| {
            warn!(trace_id = %trace_id, error = %err, "action history unavailable");
            Vec::new()
        })
    }

    pub fn clear_action_history(&self, trace_id: Option<String>) -> bool {
        let trace_id = resolve_trace_id(trace_id);
        let Some(history) = &self.state.history else {
            return false;
        };
        history
            .clear(&trace_id)
            .map(|()| info!(trace_id = %trace_id, "action history cleared"))
            .map_err(|err| warn!(trace_id = %trace_id, error = %err, "action history clear failed"))
            .is_ok()
    }

    pub fn rollback_last_action(&self, trace_id: Option<String>) -> Vec<ActionResult> {
        let trace_id = resolve_trace_id(trace_id);
        let Some(history) = &self.state.history else {
            return Vec::new();
        };
        self.state.ensure_mode(&trace_id);
        history
            .rollback_last(&self.state.apps, &trace_id)
            .unwrap_or_else(|err| {
                info!(trace_id = %trace_id, error = %err, "nothing rolled back");
                Vec::new()
            })
    }

    pub fn cleanup(&self) {
        self.state.poller.stop();
        self.state.realtime_poller.stop();
        self.state.shell.cleanup();
    }

    /// Routes a named bridge call. Arguments are looked up by name in `args`; JSON payload
    /// arguments may be given either inline or as an encoded string.
    pub fn dispatch(&self, method: &str, args: &Value) -> Result<Value, AppError> {
        let trace_id = args
            .get("traceId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let text = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let payload = |key: &str| match args.get(key) {
            Some(Value::String(raw)) => raw.clone(),
            Some(value) => value.to_string(),
            None => String::new(),
        };
        let number = |key: &str| args.get(key).and_then(Value::as_u64);

        let value = match method {
            "getExecutionMode" => json!(self.get_execution_mode(trace_id)),
            "setExecutionMode" => json!(self.set_execution_mode(&text("mode"), trace_id)),
            "resetExecutionMode" => json!(self.reset_execution_mode(trace_id)),
            "validateExecutionMode" => to_json(&self.validate_execution_mode(trace_id)),
            "checkShizukuAccess" => to_json(&self.check_shizuku_access(trace_id)),
            "checkRootAccess" => json!(self.check_root_access(trace_id)),
            "getAppList" => to_json(&self.get_app_list(&payload("filter"), trace_id)),
            "getAppIcon" => to_json(&self.get_app_icon(&text("packageName"), trace_id)),
            "getAppDetail" => self.get_app_detail(&text("packageName"), trace_id),
            "getSafetyStatus" => to_json(&self.get_safety_status(&text("packageName"))),
            "executeAction" => {
                self.execute_action(&text("packageName"), &text("action"), trace_id)
            }
            "executeBatchAction" => json!(self.execute_batch_action(
                &payload("packages"),
                &text("action"),
                &text("callbackId"),
                trace_id
            )),
            "clearCache" => self.clear_cache(&text("packageName"), trace_id),
            "clearData" => self.clear_data(&text("packageName"), trace_id),
            "getSystemStats" => to_json(&self.get_system_stats()),
            "startSystemMonitor" => json!(self.start_system_monitor(number("intervalMs"), trace_id)),
            "stopSystemMonitor" => json!(self.stop_system_monitor()),
            "startRealtimeMonitor" => {
                json!(self.start_realtime_monitor(number("intervalMs"), trace_id))
            }
            "stopRealtimeMonitor" => json!(self.stop_realtime_monitor()),
            "getDeviceInfo" => to_json(&self.get_device_info()),
            "getActivities" => to_json(&self.get_activities(&payload("filter"), trace_id)),
            "launchActivity" => json!(self.launch_activity(
                &text("packageName"),
                &text("activityName"),
                trace_id
            )),
            "launchApp" => json!(self.launch_app(&text("packageName"), trace_id)),
            "openAppSettings" => json!(self.open_app_settings(&text("packageName"), trace_id)),
            "openHiddenSetting" => json!(self.open_hidden_setting(&payload("intents"), trace_id)),
            "getActionHistory" => to_json(&self.get_action_history(
                number("limit").map(|limit| limit as usize),
                trace_id
            )),
            "rollbackLastAction" => to_json(&self.rollback_last_action(trace_id)),
            "clearActionHistory" => json!(self.clear_action_history(trace_id)),
            "cleanup" => {
                self.cleanup();
                json!(true)
            }
            other => {
                return Err(AppError::validation(
                    format!("Unknown method: {other}"),
                    resolve_trace_id(trace_id),
                ))
            }
        };
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    args: Value,
}

fn write_line<W: Write>(out: &Mutex<W>, value: &Value) {
    let Ok(mut writer) = out.lock() else {
        return;
    };
    let line = value.to_string();
    if writeln!(writer, "{line}").and_then(|_| writer.flush()).is_err() {
        warn!("bridge output closed");
    }
}

/// Emitter that writes each event as one JSON line to `out`.
pub fn line_emitter<W: Write + Send + 'static>(out: Arc<Mutex<W>>) -> Emitter {
    Arc::new(move |event: BridgeEvent| write_line(&out, &to_json(&event)))
}

/// Reads requests until EOF, answering each one on `out`.
pub fn serve_lines<R: BufRead, W: Write>(reader: R, out: &Mutex<W>, bridge: &NativeBridge) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "bridge input failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<BridgeRequest>(&line) {
            Ok(request) => match bridge.dispatch(&request.method, &request.args) {
                Ok(result) => json!({ "id": request.id, "result": result }),
                Err(err) => json!({ "id": request.id, "error": err }),
            },
            Err(err) => json!({
                "id": Value::Null,
                "error": AppError::validation(format!("Malformed request: {err}"), ""),
            }),
        };
        write_line(out, &response);
    }
}
