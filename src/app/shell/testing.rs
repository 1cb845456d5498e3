//! In-memory backend for unit tests: records every command and answers from canned output.

use std::sync::{Arc, Mutex};

use crate::app::error::AppError;
use crate::app::models::BackendAccess;
use crate::app::shell::backend::ShellBackend;

#[derive(Default)]
struct Recorded {
    name: Option<&'static str>,
    access: BackendAccess,
    fail_bind: bool,
    binds: usize,
    unbinds: usize,
    commands: Vec<String>,
    responses: Vec<(String, Result<String, String>)>,
}

#[derive(Clone, Default)]
pub struct RecordingBackend {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingBackend {
    pub fn with_access(available: bool, granted: bool) -> Self {
        let backend = Self::default();
        backend.set_access(available, granted);
        backend
    }

    pub fn ready() -> Self {
        Self::with_access(true, true)
    }

    pub fn unavailable() -> Self {
        Self::with_access(false, false)
    }

    pub fn named(self, name: &'static str) -> Self {
        self.inner.lock().unwrap().name = Some(name);
        self
    }

    pub fn failing_bind(self) -> Self {
        self.inner.lock().unwrap().fail_bind = true;
        self
    }

    /// Commands containing `needle` answer with `output`. Later rules win.
    pub fn respond(self, needle: &str, output: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .responses
            .push((needle.to_string(), Ok(output.to_string())));
        self
    }

    /// Commands containing `needle` fail with `message`.
    pub fn fail_on(self, needle: &str, message: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .responses
            .push((needle.to_string(), Err(message.to_string())));
        self
    }

    pub fn set_access(&self, available: bool, granted: bool) {
        self.inner.lock().unwrap().access = BackendAccess { available, granted };
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn bind_count(&self) -> usize {
        self.inner.lock().unwrap().binds
    }

    pub fn unbind_count(&self) -> usize {
        self.inner.lock().unwrap().unbinds
    }
}

impl ShellBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        self.inner.lock().unwrap().name.unwrap_or("recording")
    }

    fn access(&self, _trace_id: &str) -> BackendAccess {
        self.inner.lock().unwrap().access
    }

    fn exec(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(command.to_string());
        let answer = inner
            .responses
            .iter()
            .rev()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, answer)| answer.clone());
        match answer {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(AppError::command(message, trace_id)),
            None => Ok("Success".to_string()),
        }
    }

    fn bind(&self, trace_id: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        inner.binds += 1;
        if inner.fail_bind {
            return Err(AppError::dependency("Failed to bind Shizuku service", trace_id));
        }
        Ok(())
    }

    fn unbind(&self) {
        self.inner.lock().unwrap().unbinds += 1;
    }
}
