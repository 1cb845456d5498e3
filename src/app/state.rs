use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::app::actions::AppManager;
use crate::app::config::{backup_config_path, save_config_to_path, AppConfig};
use crate::app::error::AppError;
use crate::app::history::ActionLogStore;
use crate::app::inventory::InventoryCache;
use crate::app::models::ExecutionMode;
use crate::app::monitor::{ProcStatsSource, StatsPoller, StatsSource};
use crate::app::packages::{PackageSource, PmPackageSource};
use crate::app::shell::manager::ShellManager;

/// Everything the bridge needs, built once at startup.
pub struct AppState {
    config: RwLock<AppConfig>,
    config_path: Option<PathBuf>,
    pub shell: Arc<ShellManager>,
    pub inventory: Arc<InventoryCache>,
    pub apps: AppManager,
    pub history: Option<ActionLogStore>,
    pub stats_source: Arc<dyn StatsSource>,
    pub poller: StatsPoller,
    pub realtime_poller: StatsPoller,
}

impl AppState {
    pub fn new(config: AppConfig, config_path: Option<PathBuf>) -> Self {
        let shell = Arc::new(ShellManager::from_config(&config));
        let source = Box::new(PmPackageSource::new(Arc::clone(&shell)));
        let history_path = config.history_db_path();
        let history = ActionLogStore::open(&history_path, config.history.max_entries)
            .or_else(|err| {
                warn!(
                    path = %history_path.display(),
                    error = %err,
                    "action log unavailable on disk; keeping it in memory"
                );
                ActionLogStore::open_in_memory(config.history.max_entries)
            })
            .ok();
        Self::from_parts(
            config,
            config_path,
            shell,
            source,
            Arc::new(ProcStatsSource::default()),
            history,
        )
    }

    pub fn from_parts(
        config: AppConfig,
        config_path: Option<PathBuf>,
        shell: Arc<ShellManager>,
        source: Box<dyn PackageSource>,
        stats_source: Arc<dyn StatsSource>,
        history: Option<ActionLogStore>,
    ) -> Self {
        let inventory = Arc::new(InventoryCache::from_settings(source, &config.inventory));
        let apps = AppManager::new(Arc::clone(&shell), Arc::clone(&inventory));
        Self {
            config: RwLock::new(config),
            config_path,
            shell,
            inventory,
            apps,
            history,
            stats_source,
            poller: StatsPoller::new(),
            realtime_poller: StatsPoller::named("realtime"),
        }
    }

    pub fn config(&self) -> AppConfig {
        self.config
            .read()
            .map(|config| config.clone())
            .unwrap_or_default()
    }

    /// Detects the backends, honouring the persisted preference when that backend is ready.
    pub fn select_initial_mode(&self, trace_id: &str) -> ExecutionMode {
        let preferred = self.config().execution.preferred_mode;
        self.shell.initialize_with_preference(preferred, trace_id)
    }

    /// Runs detection once if nothing has selected a mode yet.
    pub fn ensure_mode(&self, trace_id: &str) -> ExecutionMode {
        if self.shell.is_probed() {
            self.shell.mode()
        } else {
            self.select_initial_mode(trace_id)
        }
    }

    /// Stores the mode the user picked so the next start tries it first.
    pub fn persist_preferred_mode(&self, mode: ExecutionMode, trace_id: &str) -> Result<(), AppError> {
        let snapshot = {
            let mut config = self
                .config
                .write()
                .map_err(|_| AppError::system("Config lock poisoned", trace_id))?;
            config.execution.preferred_mode = Some(mode);
            config.clone()
        };
        if let Some(path) = &self.config_path {
            save_config_to_path(&snapshot, path, &backup_config_path(path))
                .map_err(|err| AppError::system(err.error, trace_id))?;
        }
        Ok(())
    }
}
