use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use base64::Engine as _;
use regex::Regex;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::app::error::AppError;
use crate::app::models::ActivityInfo;
use crate::app::shell::manager::ShellManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub package_name: String,
    pub apk_path: Option<String>,
    pub uid: i64,
    pub is_system: bool,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageDetails {
    pub version_name: Option<String>,
    pub version_code: Option<String>,
    pub target_sdk: Option<u32>,
    pub min_sdk: Option<u32>,
    pub permission_count: Option<u32>,
    pub is_background_restricted: bool,
}

/// Where the inventory gets its package data from.
pub trait PackageSource: Send + Sync {
    fn list_packages(&self, trace_id: &str) -> Result<Vec<PackageRecord>, AppError>;

    fn running_packages(&self, trace_id: &str) -> Result<HashSet<String>, AppError>;

    fn package_details(&self, package_name: &str, trace_id: &str)
        -> Result<PackageDetails, AppError>;

    fn activities(&self, package_name: &str, trace_id: &str)
        -> Result<Vec<ActivityInfo>, AppError>;

    fn icon_base64(&self, record: &PackageRecord, trace_id: &str) -> Option<String> {
        let path = record.apk_path.as_deref()?;
        match extract_best_icon_from_apk(Path::new(path), trace_id) {
            Ok(Some((_, bytes))) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            Ok(None) => None,
            Err(err) => {
                debug!(
                    trace_id = %trace_id,
                    package_name = %record.package_name,
                    error = %err,
                    "icon extraction failed"
                );
                None
            }
        }
    }
}

/// Enumerates packages with `pm` and `dumpsys`, through whichever backend is active.
pub struct PmPackageSource {
    shell: Arc<ShellManager>,
}

impl PmPackageSource {
    pub fn new(shell: Arc<ShellManager>) -> Self {
        Self { shell }
    }

    fn package_names(&self, flag: &str, trace_id: &str) -> Result<HashSet<String>, AppError> {
        let output = self
            .shell
            .execute_read(&format!("pm list packages {flag}"), trace_id)?;
        Ok(parse_pm_list_packages_output(&output)
            .into_iter()
            .map(|entry| entry.package_name)
            .collect())
    }
}

impl PackageSource for PmPackageSource {
    fn list_packages(&self, trace_id: &str) -> Result<Vec<PackageRecord>, AppError> {
        let output = self.shell.execute_read("pm list packages -f -U", trace_id)?;
        let disabled = self.package_names("-d", trace_id).unwrap_or_else(|err| {
            warn!(trace_id = %trace_id, error = %err, "disabled package list failed");
            HashSet::new()
        });
        let system = self.package_names("-s", trace_id).unwrap_or_default();
        let mut records = parse_pm_list_packages_output(&output);
        for record in &mut records {
            record.is_enabled = !disabled.contains(&record.package_name);
            record.is_system = record.is_system || system.contains(&record.package_name);
        }
        Ok(records)
    }

    fn running_packages(&self, trace_id: &str) -> Result<HashSet<String>, AppError> {
        let output = self
            .shell
            .execute_read("dumpsys activity processes", trace_id)?;
        Ok(parse_running_packages(&output))
    }

    fn package_details(
        &self,
        package_name: &str,
        trace_id: &str,
    ) -> Result<PackageDetails, AppError> {
        let dump = self
            .shell
            .execute_read(&format!("dumpsys package {package_name}"), trace_id)?;
        let mut details = parse_package_details(&dump);
        match self.shell.execute_read(
            &format!("appops get {package_name} RUN_IN_BACKGROUND"),
            trace_id,
        ) {
            Ok(ops) => details.is_background_restricted = is_background_restricted(&ops),
            Err(err) => {
                debug!(trace_id = %trace_id, package_name, error = %err, "appops query failed")
            }
        }
        Ok(details)
    }

    fn activities(
        &self,
        package_name: &str,
        trace_id: &str,
    ) -> Result<Vec<ActivityInfo>, AppError> {
        let dump = self
            .shell
            .execute_read(&format!("dumpsys package {package_name}"), trace_id)?;
        Ok(parse_activities(package_name, &dump))
    }
}

/// Parses `pm list packages [-f] [-U]` output. Lines look like
/// `package:/data/app/~~x/com.example-1/base.apk=com.example uid:10123`.
pub fn parse_pm_list_packages_output(output: &str) -> Vec<PackageRecord> {
    let mut records = Vec::new();
    for raw in output.lines() {
        let line = raw.trim();
        let Some(payload) = line.strip_prefix("package:") else {
            continue;
        };
        let (payload, uid) = match payload.split_once(" uid:") {
            Some((head, uid)) => (head, uid.trim().parse::<i64>().unwrap_or(-1)),
            None => (payload, -1),
        };
        let (apk_path, package_name) = match payload.rsplit_once('=') {
            Some((path, pkg)) => (Some(path.trim().to_string()), pkg.trim().to_string()),
            None => (None, payload.trim().to_string()),
        };
        if package_name.is_empty() {
            continue;
        }
        let is_system = apk_path.as_deref().map(is_system_path).unwrap_or(false);
        records.push(PackageRecord {
            package_name,
            apk_path,
            uid,
            is_system,
            is_enabled: true,
        });
    }
    records
}

fn is_system_path(path: &str) -> bool {
    path.starts_with("/system/")
        || path.starts_with("/product/")
        || path.starts_with("/vendor/")
        || path.starts_with("/system_ext/")
        || path.starts_with("/apex/")
}

fn process_record_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"ProcessRecord\{[^}]+\s+\d+:([a-zA-Z][a-zA-Z0-9_.]*)/")
            .expect("process record regex")
    })
}

pub fn parse_running_packages(output: &str) -> HashSet<String> {
    process_record_regex()
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

pub fn parse_package_details(output: &str) -> PackageDetails {
    let mut details = PackageDetails::default();
    for line in output.lines() {
        for token in line.split_whitespace() {
            if let Some(value) = token.strip_prefix("versionName=") {
                details
                    .version_name
                    .get_or_insert_with(|| value.trim_matches(['"', '\'']).to_string());
            } else if let Some(value) = token.strip_prefix("versionCode=") {
                details.version_code.get_or_insert_with(|| value.to_string());
            } else if let Some(value) = token.strip_prefix("targetSdk=") {
                if details.target_sdk.is_none() {
                    details.target_sdk = value.parse().ok();
                }
            } else if let Some(value) = token.strip_prefix("minSdk=") {
                if details.min_sdk.is_none() {
                    details.min_sdk = value.parse().ok();
                }
            }
        }
    }
    details.permission_count = count_requested_permissions(output);
    details
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn count_requested_permissions(output: &str) -> Option<u32> {
    let mut lines = output.lines();
    let header = lines.find(|line| line.trim() == "requested permissions:")?;
    let header_indent = indent_of(header);
    let count = lines
        .take_while(|line| !line.trim().is_empty() && indent_of(line) > header_indent)
        .count();
    Some(count as u32)
}

pub fn is_background_restricted(appops_output: &str) -> bool {
    appops_output.lines().any(|line| {
        let line = line.trim();
        line.starts_with("RUN_IN_BACKGROUND") && (line.contains("ignore") || line.contains("deny"))
    })
}

fn resolver_entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s+[0-9a-f]+\s+([a-zA-Z0-9_.]+)/([a-zA-Z0-9_.$]+)")
            .expect("resolver entry regex")
    })
}

/// Test, debug and internal screens plus non-activity components are never offered for launch.
pub fn is_hidden_activity(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("test")
        || lower.contains("debug")
        || lower.contains("internal")
        || lower.ends_with("receiver")
        || lower.ends_with("service")
        || lower.ends_with("provider")
}

/// Reads the activity resolver table of `dumpsys package <pkg>`. Activities listed there carry
/// an intent filter, so they are exported.
pub fn parse_activities(package_name: &str, output: &str) -> Vec<ActivityInfo> {
    let mut found: BTreeMap<String, ActivityInfo> = BTreeMap::new();
    let mut in_table = false;
    let mut current: Option<String> = None;
    for line in output.lines() {
        if line.trim() == "Activity Resolver Table:" {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        if !line.is_empty() && indent_of(line) == 0 {
            break;
        }
        if let Some(caps) = resolver_entry_regex().captures(line) {
            current = None;
            if &caps[1] != package_name {
                continue;
            }
            let class = &caps[2];
            let activity_name = if let Some(short) = class.strip_prefix('.') {
                format!("{package_name}.{short}")
            } else {
                class.to_string()
            };
            if is_hidden_activity(&activity_name) {
                continue;
            }
            found.entry(activity_name.clone()).or_insert(ActivityInfo {
                activity_name: activity_name.clone(),
                is_exported: true,
                can_launch_without_root: true,
                has_launcher_intent: false,
            });
            current = Some(activity_name);
            continue;
        }
        if line.contains("android.intent.category.LAUNCHER") {
            if let Some(entry) = current.as_ref().and_then(|name| found.get_mut(name)) {
                entry.has_launcher_intent = true;
            }
        }
    }
    let mut activities: Vec<ActivityInfo> = found.into_values().collect();
    activities.sort_by(|a, b| {
        b.has_launcher_intent
            .cmp(&a.has_launcher_intent)
            .then_with(|| a.activity_name.cmp(&b.activity_name))
    });
    activities
}

pub fn apk_size(apk_path: Option<&str>) -> u64 {
    apk_path
        .and_then(|path| fs::metadata(path).ok())
        .map(|meta| meta.len())
        .unwrap_or(0)
}

fn density_rank(path: &str) -> i32 {
    let lower = path.to_lowercase();
    if lower.contains("xxxhdpi") {
        return 6;
    }
    if lower.contains("xxhdpi") {
        return 5;
    }
    if lower.contains("xhdpi") {
        return 4;
    }
    if lower.contains("hdpi") {
        return 3;
    }
    if lower.contains("mdpi") {
        return 2;
    }
    if lower.contains("ldpi") {
        return 1;
    }
    0
}

fn icon_name_rank(path: &str) -> i32 {
    let lower = path.to_lowercase();
    if lower.contains("ic_launcher") {
        return 6;
    }
    if lower.contains("launcher") {
        return 5;
    }
    if lower.contains("appicon") || lower.contains("app_icon") {
        return 4;
    }
    if lower.contains("icon") {
        return 2;
    }
    0
}

/// Picks the most launcher-like bitmap in the APK: name first, then density, then size.
pub fn extract_best_icon_from_apk(
    path: &Path,
    trace_id: &str,
) -> Result<Option<(String, Vec<u8>)>, AppError> {
    let file = fs::File::open(path)
        .map_err(|err| AppError::system(format!("Failed to open APK: {err}"), trace_id))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|err| AppError::system(format!("Failed to read APK zip: {err}"), trace_id))?;

    let mut best: Option<((i32, i32, u64), usize)> = None;
    for index in 0..zip.len() {
        let Ok(entry) = zip.by_index(index) else {
            continue;
        };
        let name = entry.name().to_lowercase();
        if !name.starts_with("res/") || !(name.ends_with(".png") || name.ends_with(".webp")) {
            continue;
        }
        if !(name.contains("/mipmap") || name.contains("/drawable")) {
            continue;
        }
        let score = (icon_name_rank(&name), density_rank(&name), entry.size());
        if best.as_ref().map_or(true, |(current, _)| score > *current) {
            best = Some((score, index));
        }
    }

    let Some((_, index)) = best else {
        return Ok(None);
    };
    let mut entry = zip
        .by_index(index)
        .map_err(|err| AppError::system(format!("Failed to read icon entry: {err}"), trace_id))?;
    let name = entry.name().to_string();
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|err| AppError::system(format!("Failed to read icon bytes: {err}"), trace_id))?;
    Ok(Some((name, bytes)))
}
