use crate::app::error::AppError;
use crate::app::models::BackendAccess;

/// A privileged command channel. Implementations never validate commands themselves; the
/// `ShellManager` gates every command before it reaches `exec`.
pub trait ShellBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Live availability probe. Must not panic; failures report `available: false`.
    fn access(&self, trace_id: &str) -> BackendAccess;

    fn exec(&self, command: &str, trace_id: &str) -> Result<String, AppError>;

    /// Starts establishing a connection, if the backend needs one.
    fn bind(&self, _trace_id: &str) -> Result<(), AppError> {
        Ok(())
    }

    /// Idempotent, best effort.
    fn unbind(&self) {}
}
