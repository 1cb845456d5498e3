use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    #[serde(rename = "ROOT")]
    Root,
    /// Separate-process privileged helper; the front end knows it as `SHIZUKU`.
    #[serde(rename = "SHIZUKU", alias = "HELPER", alias = "PRIVILEGED_HELPER")]
    Helper,
    #[serde(rename = "NONE")]
    None,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Root => "ROOT",
            ExecutionMode::Helper => "SHIZUKU",
            ExecutionMode::None => "NONE",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ExecutionMode::Root => "Root",
            ExecutionMode::Helper => "Shizuku",
            ExecutionMode::None => "View Only",
        }
    }

    pub fn can_execute_actions(&self) -> bool {
        *self != ExecutionMode::None
    }

    /// Case-insensitive lookup; unknown names map to `None` (view-only).
    pub fn from_name(name: &str) -> ExecutionMode {
        match name.trim().to_uppercase().as_str() {
            "ROOT" => ExecutionMode::Root,
            "SHIZUKU" | "HELPER" | "PRIVILEGED_HELPER" => ExecutionMode::Helper,
            _ => ExecutionMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLevel {
    Critical,
    ForceStopOnly,
    Warning,
    Safe,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Critical => "CRITICAL",
            SafetyLevel::ForceStopOnly => "FORCE_STOP_ONLY",
            SafetyLevel::Warning => "WARNING",
            SafetyLevel::Safe => "SAFE",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppAction {
    Freeze,
    Unfreeze,
    ForceStop,
    Uninstall,
    ClearCache,
    ClearData,
    RestrictBackground,
    AllowBackground,
}

impl AppAction {
    pub const ALL: [AppAction; 8] = [
        AppAction::Freeze,
        AppAction::Unfreeze,
        AppAction::ForceStop,
        AppAction::Uninstall,
        AppAction::ClearCache,
        AppAction::ClearData,
        AppAction::RestrictBackground,
        AppAction::AllowBackground,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppAction::Freeze => "FREEZE",
            AppAction::Unfreeze => "UNFREEZE",
            AppAction::ForceStop => "FORCE_STOP",
            AppAction::Uninstall => "UNINSTALL",
            AppAction::ClearCache => "CLEAR_CACHE",
            AppAction::ClearData => "CLEAR_DATA",
            AppAction::RestrictBackground => "RESTRICT_BACKGROUND",
            AppAction::AllowBackground => "ALLOW_BACKGROUND",
        }
    }

    pub fn from_name(name: &str) -> Option<AppAction> {
        let name = name.trim();
        AppAction::ALL
            .into_iter()
            .find(|action| action.as_str() == name)
    }

    /// The action that undoes this one, for the state-toggling actions.
    pub fn inverse(&self) -> Option<AppAction> {
        match self {
            AppAction::Freeze => Some(AppAction::Unfreeze),
            AppAction::Unfreeze => Some(AppAction::Freeze),
            AppAction::RestrictBackground => Some(AppAction::AllowBackground),
            AppAction::AllowBackground => Some(AppAction::RestrictBackground),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub package_name: String,
    pub app_name: String,
    pub icon_base64: Option<String>,
    pub version_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_code: Option<String>,
    pub is_system_app: bool,
    pub is_enabled: bool,
    pub is_running: bool,
    pub is_frozen: bool,
    pub is_background_restricted: bool,
    pub size: u64,
    pub uid: i64,
    pub safety_level: SafetyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_sdk: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_sdk: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    pub package_name: String,
    pub action: AppAction,
}

impl ActionResult {
    pub fn ok(package_name: &str, action: AppAction) -> Self {
        Self {
            success: true,
            message: "Success".to_string(),
            package_name: package_name.to_string(),
            action,
        }
    }

    pub fn failed(package_name: &str, action: AppAction, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            package_name: package_name.to_string(),
            action,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    #[serde(rename = "type")]
    pub kind: String,
    pub current: usize,
    pub total: usize,
    pub package_name: String,
}

impl BatchProgress {
    pub fn new(current: usize, total: usize, package_name: &str) -> Self {
        Self {
            kind: "progress".to_string(),
            current,
            total,
            package_name: package_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchComplete {
    #[serde(rename = "type")]
    pub kind: String,
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchComplete {
    pub fn new(total: usize, success_count: usize, failure_count: usize) -> Self {
        Self {
            kind: "complete".to_string(),
            total,
            success_count,
            failure_count,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0, 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppFilter {
    pub show_system_apps: bool,
    pub show_user_apps: bool,
    pub show_enabled_only: bool,
    pub show_disabled_only: bool,
    pub search_query: String,
}

impl Default for AppFilter {
    fn default() -> Self {
        Self {
            show_system_apps: true,
            show_user_apps: true,
            show_enabled_only: false,
            show_disabled_only: false,
            search_query: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppActivityFilter {
    #[serde(rename = "type")]
    pub kind: String,
    pub search: String,
}

impl Default for AppActivityFilter {
    fn default() -> Self {
        Self {
            kind: "all".to_string(),
            search: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    pub activity_name: String,
    pub is_exported: bool,
    pub can_launch_without_root: bool,
    pub has_launcher_intent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppActivities {
    pub package_name: String,
    pub app_name: String,
    pub icon_base64: Option<String>,
    pub is_system: bool,
    pub activities: Vec<ActivityInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackendAccess {
    pub available: bool,
    pub granted: bool,
}

impl BackendAccess {
    pub fn ready(&self) -> bool {
        self.available && self.granted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyStatus {
    pub level: SafetyLevel,
    pub allowed_actions: Vec<AppAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionLog {
    pub id: i64,
    pub action: AppAction,
    pub packages: Vec<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IconPayload {
    pub package_name: String,
    pub icon_base64: Option<String>,
}
