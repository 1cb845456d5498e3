//! Package safety tiers.
//!
//! Classification is a pure function of the package name. It is used to grey out controls in
//! the UI and, independently, to reject disallowed actions before any command is built.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::error::AppError;
use crate::app::models::{AppAction, SafetyLevel, SafetyStatus};

pub const MAX_PACKAGE_NAME_LEN: usize = 255;

const INJECTION_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '\'', '"', '\n', '\r', '\\', '(', ')', '<', '>', '{', '}', '[', ']',
    ' ',
];

const CRITICAL_PACKAGES: &[&str] = &[
    "com.appcontrolx",
    "android",
    "com.android.systemui",
    "com.android.settings",
    "com.android.phone",
    "com.android.server.telecom",
    "com.android.providers.settings",
    "com.android.providers.contacts",
    "com.android.providers.telephony",
    "com.android.providers.media",
    "com.android.providers.media.module",
    "com.android.shell",
    "com.android.bluetooth",
    "com.android.wifi",
    "com.android.networkstack",
    "com.android.permissioncontroller",
    "com.android.packageinstaller",
    "com.android.launcher3",
    "com.android.webview",
    "com.google.android.gms",
    "com.google.android.gsf",
    "com.android.vending",
    "com.google.android.webview",
    "com.miui.system",
    "com.miui.securitycenter",
    "com.miui.home",
    "com.xiaomi.xmsf",
    "com.lbe.security.miui",
    "com.samsung.android.providers.context",
    "com.sec.android.app.launcher",
    "com.coloros.systemui",
    "com.oppo.launcher",
    "com.oneplus.launcher",
    "com.huawei.android.launcher",
    "com.topjohnwu.magisk",
    "rikka.shizuku",
    "moe.shizuku.privileged.api",
    "me.weishu.kernelsu",
];

const FORCE_STOP_ONLY_PACKAGES: &[&str] = &[
    "com.miui.powerkeeper",
    "com.miui.securityadd",
    "com.samsung.android.lool",
    "com.samsung.android.sm",
    "com.coloros.safecenter",
    "com.huawei.systemmanager",
    "com.google.android.apps.adm",
];

const WARNING_PACKAGES: &[&str] = &[
    "com.google.android.apps.messaging",
    "com.google.android.dialer",
    "com.google.android.contacts",
];

fn package_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*(\.[a-zA-Z][a-zA-Z0-9_]*)+$")
            .expect("package name pattern is valid")
    })
}

fn component_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_$]+(\.[a-zA-Z0-9_$]+)*$").expect("component pattern is valid")
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyValidator;

impl SafetyValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn safety_level(&self, package_name: &str) -> SafetyLevel {
        if CRITICAL_PACKAGES.contains(&package_name) {
            SafetyLevel::Critical
        } else if FORCE_STOP_ONLY_PACKAGES.contains(&package_name) {
            SafetyLevel::ForceStopOnly
        } else if WARNING_PACKAGES.contains(&package_name) {
            SafetyLevel::Warning
        } else {
            SafetyLevel::Safe
        }
    }

    pub fn allowed_actions(&self, package_name: &str) -> BTreeSet<AppAction> {
        match self.safety_level(package_name) {
            SafetyLevel::Critical => BTreeSet::new(),
            SafetyLevel::ForceStopOnly => BTreeSet::from([AppAction::ForceStop]),
            SafetyLevel::Warning | SafetyLevel::Safe => AppAction::ALL.into_iter().collect(),
        }
    }

    pub fn status(&self, package_name: &str) -> SafetyStatus {
        SafetyStatus {
            level: self.safety_level(package_name),
            allowed_actions: self.allowed_actions(package_name).into_iter().collect(),
        }
    }

    pub fn validate_action(
        &self,
        package_name: &str,
        action: AppAction,
        trace_id: &str,
    ) -> Result<(), AppError> {
        if self.allowed_actions(package_name).contains(&action) {
            return Ok(());
        }
        Err(AppError::authorization(
            format!(
                "Action {} not allowed for {package_name} ({} package)",
                action.as_str(),
                self.safety_level(package_name).as_str()
            ),
            trace_id,
        ))
    }

    pub fn validate_package_name(&self, package_name: &str, trace_id: &str) -> Result<(), AppError> {
        if package_name.trim().is_empty() {
            return Err(AppError::validation("Package name is empty", trace_id));
        }
        if package_name.len() > MAX_PACKAGE_NAME_LEN {
            return Err(AppError::validation("Package name too long", trace_id));
        }
        if package_name.contains(INJECTION_CHARS) {
            return Err(AppError::validation("Injection attempt detected", trace_id));
        }
        if !package_pattern().is_match(package_name) {
            return Err(AppError::validation("Invalid package name format", trace_id));
        }
        Ok(())
    }

    /// Activity class names: either fully qualified or relative (`.MainActivity`).
    pub fn validate_component_name(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        let trimmed = name.strip_prefix('.').unwrap_or(name);
        if trimmed.is_empty() || name.len() > MAX_PACKAGE_NAME_LEN {
            return Err(AppError::validation("Invalid activity name", trace_id));
        }
        // `$` marks nested classes; callers single-quote component names.
        let injected = name
            .chars()
            .any(|ch| ch != '$' && INJECTION_CHARS.contains(&ch));
        if injected || !component_pattern().is_match(trimmed) {
            return Err(AppError::validation("Invalid activity name", trace_id));
        }
        Ok(())
    }
}
