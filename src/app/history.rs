use std::fs;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::app::actions::AppManager;
use crate::app::error::AppError;
use crate::app::models::{ActionLog, ActionResult, AppAction};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS action_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    packages TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    success INTEGER NOT NULL,
    message TEXT
);
CREATE INDEX IF NOT EXISTS idx_action_logs_ts ON action_logs(timestamp);";

/// Persistent log of executed actions, newest first, capped at `max_entries` rows.
pub struct ActionLogStore {
    connection: Mutex<Connection>,
    max_entries: usize,
}

impl ActionLogStore {
    pub fn open(path: &Path, max_entries: usize) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create history dir: {err}"), "")
            })?;
        }
        let connection = Connection::open(path)
            .map_err(|err| AppError::system(format!("Failed to open action log: {err}"), ""))?;
        Self::with_connection(connection, max_entries)
    }

    pub fn open_in_memory(max_entries: usize) -> Result<Self, AppError> {
        let connection = Connection::open_in_memory()
            .map_err(|err| AppError::system(format!("Failed to open action log: {err}"), ""))?;
        Self::with_connection(connection, max_entries)
    }

    fn with_connection(connection: Connection, max_entries: usize) -> Result<Self, AppError> {
        connection.execute_batch(SCHEMA).map_err(|err| {
            AppError::system(format!("Failed to initialize action log: {err}"), "")
        })?;
        Ok(Self {
            connection: Mutex::new(connection),
            max_entries: max_entries.max(1),
        })
    }

    fn lock(&self, trace_id: &str) -> Result<std::sync::MutexGuard<'_, Connection>, AppError> {
        self.connection
            .lock()
            .map_err(|_| AppError::system("Action log lock poisoned", trace_id))
    }

    pub fn record(
        &self,
        action: AppAction,
        packages: &[String],
        success: bool,
        error_message: Option<&str>,
        trace_id: &str,
    ) -> Result<ActionLog, AppError> {
        let encoded = serde_json::to_string(packages).map_err(|err| {
            AppError::system(format!("Failed to encode packages: {err}"), trace_id)
        })?;
        let timestamp = chrono::Utc::now().timestamp_millis();
        let connection = self.lock(trace_id)?;
        connection
            .execute(
                "INSERT INTO action_logs (action, packages, timestamp, success, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![action.as_str(), encoded, timestamp, success, error_message],
            )
            .map_err(|err| AppError::system(format!("Failed to write action log: {err}"), trace_id))?;
        let id = connection.last_insert_rowid();
        connection
            .execute(
                "DELETE FROM action_logs WHERE id NOT IN (
                   SELECT id FROM action_logs ORDER BY timestamp DESC, id DESC LIMIT ?1
                 )",
                params![self.max_entries as i64],
            )
            .map_err(|err| AppError::system(format!("Failed to prune action log: {err}"), trace_id))?;
        Ok(ActionLog {
            id,
            action,
            packages: packages.to_vec(),
            success,
            error_message: error_message.map(str::to_string),
            timestamp,
        })
    }

    /// Logs one batch outcome: success only if every item succeeded; the message is the first
    /// failure.
    pub fn record_results(
        &self,
        action: AppAction,
        results: &[ActionResult],
        trace_id: &str,
    ) -> Result<ActionLog, AppError> {
        let packages: Vec<String> = results
            .iter()
            .map(|result| result.package_name.clone())
            .collect();
        let failure = results.iter().find(|result| !result.success);
        self.record(
            action,
            &packages,
            failure.is_none(),
            failure.map(|result| result.message.as_str()),
            trace_id,
        )
    }

    pub fn recent(&self, limit: usize, trace_id: &str) -> Result<Vec<ActionLog>, AppError> {
        let connection = self.lock(trace_id)?;
        let mut stmt = connection
            .prepare(
                "SELECT id, action, packages, timestamp, success, message FROM action_logs
                 ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )
            .map_err(|err| AppError::system(format!("Failed to query action log: {err}"), trace_id))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|err| AppError::system(format!("Failed to query action log: {err}"), trace_id))?;

        let mut logs = Vec::new();
        for row in rows {
            let (id, action, packages, timestamp, success, error_message) = row.map_err(|err| {
                AppError::system(format!("Failed to read action log row: {err}"), trace_id)
            })?;
            let Some(action) = AppAction::from_name(&action) else {
                warn!(trace_id = %trace_id, id, action = %action, "skipping unknown action in log");
                continue;
            };
            logs.push(ActionLog {
                id,
                action,
                packages: serde_json::from_str(&packages).unwrap_or_default(),
                success,
                error_message,
                timestamp,
            });
        }
        Ok(logs)
    }

    pub fn clear(&self, trace_id: &str) -> Result<(), AppError> {
        self.lock(trace_id)?
            .execute("DELETE FROM action_logs", [])
            .map_err(|err| AppError::system(format!("Failed to clear action log: {err}"), trace_id))?;
        Ok(())
    }

    /// Latest successful entry whose action has an inverse.
    pub fn last_reversible(&self, trace_id: &str) -> Result<Option<ActionLog>, AppError> {
        Ok(self
            .recent(self.max_entries, trace_id)?
            .into_iter()
            .find(|log| log.success && log.action.inverse().is_some()))
    }

    /// Applies the inverse of the last reversible action to each of its packages and logs the
    /// rollback as a new entry.
    pub fn rollback_last(
        &self,
        manager: &AppManager,
        trace_id: &str,
    ) -> Result<Vec<ActionResult>, AppError> {
        let entry = self
            .last_reversible(trace_id)?
            .ok_or_else(|| AppError::validation("No action to roll back", trace_id))?;
        let inverse = entry
            .action
            .inverse()
            .ok_or_else(|| AppError::validation("Action cannot be rolled back", trace_id))?;
        let results = manager.execute_batch_action(&entry.packages, inverse, |_, _, _| {}, trace_id);
        self.record_results(inverse, &results, trace_id)?;
        info!(
            trace_id = %trace_id,
            log_id = entry.id,
            action = inverse.as_str(),
            "rolled back action"
        );
        Ok(results)
    }
}
