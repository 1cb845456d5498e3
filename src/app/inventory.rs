use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::config::InventorySettings;
use crate::app::error::AppError;
use crate::app::models::{AppActivities, AppActivityFilter, AppFilter, AppInfo, IconPayload};
use crate::app::packages::{apk_size, PackageRecord, PackageSource};
use crate::app::safety::SafetyValidator;

struct Snapshot {
    apps: Arc<Vec<AppInfo>>,
    records: HashMap<String, PackageRecord>,
    scanned_at: Instant,
}

/// TTL'd list of installed apps. Replaced wholesale on every rescan, never patched in place.
pub struct InventoryCache {
    source: Box<dyn PackageSource>,
    safety: SafetyValidator,
    ttl: Duration,
    detect_running: bool,
    snapshot: Mutex<Option<Snapshot>>,
    icons: Mutex<HashMap<String, Option<String>>>,
}

impl InventoryCache {
    pub fn new(source: Box<dyn PackageSource>, ttl: Duration, detect_running: bool) -> Self {
        Self {
            source,
            safety: SafetyValidator::new(),
            ttl,
            detect_running,
            snapshot: Mutex::new(None),
            icons: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(source: Box<dyn PackageSource>, settings: &InventorySettings) -> Self {
        Self::new(
            source,
            Duration::from_secs(settings.cache_ttl_secs),
            settings.detect_running,
        )
    }

    /// Returns the cached list (the same `Arc`) while it is younger than the TTL, otherwise
    /// enumerates again.
    pub fn scan(&self, force_refresh: bool, trace_id: &str) -> Result<Arc<Vec<AppInfo>>, AppError> {
        let mut snapshot = self
            .snapshot
            .lock()
            .map_err(|_| AppError::system("Inventory lock poisoned", trace_id))?;
        if !force_refresh {
            if let Some(current) = snapshot.as_ref() {
                if current.scanned_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&current.apps));
                }
            }
        }

        let started = Instant::now();
        let records = self.source.list_packages(trace_id)?;
        let running = if self.detect_running {
            self.source.running_packages(trace_id).unwrap_or_else(|err| {
                debug!(trace_id = %trace_id, error = %err, "running process probe failed");
                Default::default()
            })
        } else {
            Default::default()
        };

        let mut apps: Vec<AppInfo> = records
            .iter()
            .map(|record| AppInfo {
                package_name: record.package_name.clone(),
                app_name: record.package_name.clone(),
                icon_base64: None,
                version_name: String::new(),
                version_code: None,
                is_system_app: record.is_system,
                is_enabled: record.is_enabled,
                is_running: running.contains(&record.package_name),
                is_frozen: !record.is_enabled,
                is_background_restricted: false,
                size: apk_size(record.apk_path.as_deref()),
                uid: record.uid,
                safety_level: self.safety.safety_level(&record.package_name),
                install_path: record.apk_path.clone(),
                target_sdk: None,
                min_sdk: None,
                permissions: None,
            })
            .collect();
        apps.sort_by_cached_key(|app| app.app_name.to_lowercase());

        info!(
            trace_id = %trace_id,
            count = apps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inventory scanned"
        );
        let apps = Arc::new(apps);
        *snapshot = Some(Snapshot {
            apps: Arc::clone(&apps),
            records: records
                .into_iter()
                .map(|record| (record.package_name.clone(), record))
                .collect(),
            scanned_at: Instant::now(),
        });
        Ok(apps)
    }

    /// Drops the package list and the icon memo so both reflect the next scan.
    pub fn invalidate(&self) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = None;
        }
        if let Ok(mut icons) = self.icons.lock() {
            icons.clear();
        }
    }

    pub fn list(&self, filter: &AppFilter, trace_id: &str) -> Result<Vec<AppInfo>, AppError> {
        let apps = self.scan(false, trace_id)?;
        Ok(filter_apps(&apps, filter))
    }

    fn lookup(&self, package_name: &str, trace_id: &str) -> Result<(AppInfo, PackageRecord), AppError> {
        self.scan(false, trace_id)?;
        let snapshot = self
            .snapshot
            .lock()
            .map_err(|_| AppError::system("Inventory lock poisoned", trace_id))?;
        let found = snapshot.as_ref().and_then(|current| {
            let record = current.records.get(package_name)?;
            let app = current
                .apps
                .iter()
                .find(|app| app.package_name == package_name)?;
            Some((app.clone(), record.clone()))
        });
        found.ok_or_else(|| {
            AppError::validation(format!("Package not found: {package_name}"), trace_id)
        })
    }

    fn icon_for(&self, record: &PackageRecord, trace_id: &str) -> Option<String> {
        if let Ok(icons) = self.icons.lock() {
            if let Some(cached) = icons.get(&record.package_name) {
                return cached.clone();
            }
        }
        let icon = self.source.icon_base64(record, trace_id);
        if let Ok(mut icons) = self.icons.lock() {
            icons.insert(record.package_name.clone(), icon.clone());
        }
        icon
    }

    pub fn app_icon(&self, package_name: &str, trace_id: &str) -> Result<IconPayload, AppError> {
        let (_, record) = self.lookup(package_name, trace_id)?;
        Ok(IconPayload {
            package_name: package_name.to_string(),
            icon_base64: self.icon_for(&record, trace_id),
        })
    }

    /// The cached entry enriched with the per-package details the list scan skips.
    pub fn app_detail(&self, package_name: &str, trace_id: &str) -> Result<AppInfo, AppError> {
        let (mut app, record) = self.lookup(package_name, trace_id)?;
        match self.source.package_details(package_name, trace_id) {
            Ok(details) => {
                app.version_name = details.version_name.unwrap_or_default();
                app.version_code = details.version_code;
                app.target_sdk = details.target_sdk;
                app.min_sdk = details.min_sdk;
                app.permissions = details.permission_count;
                app.is_background_restricted = details.is_background_restricted;
            }
            Err(err) => {
                warn!(trace_id = %trace_id, package_name, error = %err, "package details unavailable");
            }
        }
        app.icon_base64 = self.icon_for(&record, trace_id);
        Ok(app)
    }

    pub fn activities(
        &self,
        filter: &AppActivityFilter,
        trace_id: &str,
    ) -> Result<Vec<AppActivities>, AppError> {
        let apps = self.scan(false, trace_id)?;
        let search = filter.search.trim().to_lowercase();
        let mut result = Vec::new();
        for app in apps.iter() {
            let keep = match filter.kind.as_str() {
                "user" => !app.is_system_app,
                "system" => app.is_system_app,
                _ => true,
            };
            if !keep {
                continue;
            }
            let mut activities = match self.source.activities(&app.package_name, trace_id) {
                Ok(activities) => activities,
                Err(err) => {
                    debug!(
                        trace_id = %trace_id,
                        package_name = %app.package_name,
                        error = %err,
                        "activity listing failed"
                    );
                    continue;
                }
            };
            let app_matches = search.is_empty()
                || app.package_name.to_lowercase().contains(&search)
                || app.app_name.to_lowercase().contains(&search);
            if !app_matches {
                activities.retain(|activity| activity.activity_name.to_lowercase().contains(&search));
            }
            if activities.is_empty() {
                continue;
            }
            result.push(AppActivities {
                package_name: app.package_name.clone(),
                app_name: app.app_name.clone(),
                icon_base64: None,
                is_system: app.is_system_app,
                activities,
            });
        }
        Ok(result)
    }
}

pub fn filter_apps(apps: &[AppInfo], filter: &AppFilter) -> Vec<AppInfo> {
    let query = filter.search_query.trim().to_lowercase();
    apps.iter()
        .filter(|app| {
            if app.is_system_app {
                filter.show_system_apps
            } else {
                filter.show_user_apps
            }
        })
        .filter(|app| !filter.show_enabled_only || app.is_enabled)
        .filter(|app| !filter.show_disabled_only || !app.is_enabled)
        .filter(|app| {
            query.is_empty()
                || app.app_name.to_lowercase().contains(&query)
                || app.package_name.to_lowercase().contains(&query)
        })
        .cloned()
        .collect()
}
