use crate::app::error::AppError;

pub const DEFAULT_ALLOWED_PREFIXES: &[&str] = &[
    "pm disable",
    "pm enable",
    "pm uninstall",
    "pm clear",
    "pm list",
    "am force-stop",
    "am start -n",
    "am start -a android.settings.",
    "monkey -p",
    "appops set",
    "appops get",
    "cmd appops",
    "dumpsys activity",
    "dumpsys package",
    "dumpsys battery",
    "ps -A",
    "cat /proc",
    "cat /sys",
    "settings put",
    "settings get",
    "settings delete",
];

pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "format",
    "mkfs",
    "dd if=",
    "> /dev/",
    "reboot",
    "shutdown",
    "su -c",
    "chmod 777 /",
    "; rm",
    "&& rm",
    "| rm",
    "rm -rf",
];

/// Static allow/deny table checked on every outbound command.
///
/// Both tables are matched case-insensitively against the trimmed command. The deny-list wins:
/// a command with a permitted prefix is still rejected if it contains a blocked pattern.
#[derive(Debug, Clone)]
pub struct CommandGate {
    allowed_prefixes: Vec<String>,
    blocked_patterns: Vec<String>,
}

impl Default for CommandGate {
    fn default() -> Self {
        Self::with_policy(&[], &[])
    }
}

impl CommandGate {
    pub fn with_policy(extra_allowed: &[String], extra_blocked: &[String]) -> Self {
        let normalize = |value: &str| value.trim().to_lowercase();
        let allowed_prefixes = DEFAULT_ALLOWED_PREFIXES
            .iter()
            .map(|value| normalize(value))
            .chain(extra_allowed.iter().map(|value| normalize(value)))
            .filter(|value| !value.is_empty())
            .collect();
        let blocked_patterns = DEFAULT_BLOCKED_PATTERNS
            .iter()
            .map(|value| normalize(value))
            .chain(extra_blocked.iter().map(|value| normalize(value)))
            .filter(|value| !value.is_empty())
            .collect();
        Self {
            allowed_prefixes,
            blocked_patterns,
        }
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        let normalized = command.trim().to_lowercase();
        if self
            .blocked_patterns
            .iter()
            .any(|pattern| normalized.contains(pattern.as_str()))
        {
            return false;
        }
        self.allowed_prefixes
            .iter()
            .any(|prefix| normalized.starts_with(prefix.as_str()))
    }

    pub fn check(&self, command: &str, trace_id: &str) -> Result<(), AppError> {
        if self.is_allowed(command) {
            return Ok(());
        }
        Err(AppError::authorization(
            format!("Command not allowed: {}", command.trim()),
            trace_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_permitted_prefixes() {
        let gate = CommandGate::default();
        for command in [
            "pm disable-user --user 0 com.example.app",
            "pm enable com.example.app",
            "pm uninstall -k --user 0 com.example.app",
            "pm clear --cache-only com.example.app",
            "am force-stop com.example.app",
            "appops set com.example.app RUN_IN_BACKGROUND ignore",
            "dumpsys activity processes",
            "  PM LIST packages -f  ",
            "settings get global adb_enabled",
        ] {
            assert!(gate.is_allowed(command), "{command}");
        }
    }

    #[test]
    fn rejects_unknown_prefixes() {
        let gate = CommandGate::default();
        for command in ["ls /", "id", "", "pmdisable x", "cat /data/system/packages.xml"] {
            assert!(!gate.is_allowed(command), "{command}");
        }
    }

    #[test]
    fn deny_list_takes_precedence_over_allow_list() {
        let gate = CommandGate::default();
        for command in [
            "pm clear com.example.app; rm -rf /sdcard",
            "pm list packages && rm x",
            "dumpsys package | rm",
            "settings put global reboot 1",
            "cat /proc/meminfo > /dev/block/sda",
            "am force-stop x; su -c id",
            "pm disable-user MKFS.ext4",
        ] {
            assert!(!gate.is_allowed(command), "{command}");
        }
    }

    #[test]
    fn policy_extends_both_tables() {
        let gate = CommandGate::with_policy(
            &["cmd package compile".to_string()],
            &["--user 10".to_string()],
        );
        assert!(gate.is_allowed("cmd package compile -m speed com.example.app"));
        assert!(!gate.is_allowed("pm enable --user 10 com.example.app"));
        assert!(gate.is_allowed("pm enable --user 0 com.example.app"));
    }

    #[test]
    fn check_reports_authorization_error() {
        let gate = CommandGate::default();
        let err = gate.check("reboot", "trace-9").expect_err("blocked");
        assert_eq!(err.code, "ERR_AUTHORIZATION");
        assert_eq!(err.trace_id, "trace-9");
        assert!(err.error.starts_with("Command not allowed"));
    }
}
