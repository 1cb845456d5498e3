use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::config::ExecutionSettings;
use crate::app::error::AppError;
use crate::app::models::BackendAccess;
use crate::app::shell::backend::ShellBackend;
use crate::app::shell::protocol::{
    decode_exec_reply, encode_line, token_path_for, HelperReply, HelperRequest, PONG,
};

/// One-shot gate opened when a bind attempt finishes, successfully or not.
#[derive(Debug, Default)]
pub struct ConnectionGate {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        if let Ok(mut opened) = self.opened.lock() {
            *opened = true;
            self.cv.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened.lock().map(|opened| *opened).unwrap_or(true)
    }

    /// Returns whether the gate opened before the timeout elapsed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut opened) = self.opened.lock() else {
            return false;
        };
        while !*opened {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.cv.wait_timeout(opened, deadline - now) {
                Ok((guard, _)) => opened = guard,
                Err(_) => return false,
            }
        }
        true
    }
}

struct HelperConnection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl HelperConnection {
    fn connect(path: &PathBuf, io_timeout: Duration) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn call(&mut self, request: &HelperRequest) -> Result<HelperReply, String> {
        let line = encode_line(request).map_err(|err| err.to_string())?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|err| err.to_string())?;
        let mut reply = String::new();
        let read = self.reader.read_line(&mut reply).map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("connection closed by helper".to_string());
        }
        serde_json::from_str(reply.trim_end()).map_err(|err| format!("bad reply: {err}"))
    }
}

/// Client side of the helper channel.
///
/// Binding happens on a background thread; `exec` waits on the gate for at most
/// `connect_timeout` and then uses whatever connection state resulted.
///
/// Without a configured token the client reads the one the daemon published next to its
/// socket, on every request, so a restarted daemon is picked up.
pub struct HelperClient {
    socket_path: PathBuf,
    token: Option<String>,
    connect_timeout: Duration,
    io_timeout: Duration,
    connection: Arc<Mutex<Option<HelperConnection>>>,
    bound: Arc<AtomicBool>,
    // Bumped by `unbind`; a bind thread from an older generation discards its connection.
    generation: Arc<AtomicU64>,
    gate: Mutex<Arc<ConnectionGate>>,
}

impl HelperClient {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        token: Option<String>,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            token: token.filter(|value| !value.trim().is_empty()),
            connect_timeout,
            io_timeout,
            connection: Arc::new(Mutex::new(None)),
            bound: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            gate: Mutex::new(Arc::new(ConnectionGate::new())),
        }
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self::new(
            settings.helper_socket_path.clone(),
            settings.helper_token.clone(),
            Duration::from_millis(settings.helper_connect_timeout_ms),
            // The helper itself enforces the session timeout; leave headroom for the reply.
            Duration::from_secs(settings.session_timeout_secs + 5),
        )
    }

    fn request_token(&self) -> Option<String> {
        self.token.clone().or_else(|| {
            fs::read_to_string(token_path_for(&self.socket_path))
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn current_gate(&self) -> Option<Arc<ConnectionGate>> {
        self.gate.lock().ok().map(|gate| Arc::clone(&gate))
    }

    fn wait_for_connection(&self, trace_id: &str) -> bool {
        if self.is_connected() {
            return true;
        }
        if !self.is_bound() {
            if let Err(err) = self.bind(trace_id) {
                warn!(trace_id = %trace_id, error = %err, "helper bind failed");
                return false;
            }
        }
        if let Some(gate) = self.current_gate() {
            if !gate.wait(self.connect_timeout) {
                debug!(trace_id = %trace_id, "timed out waiting for helper connection");
            }
        }
        self.is_connected()
    }

    fn drop_connection(&self) {
        if let Ok(mut guard) = self.connection.lock() {
            *guard = None;
        }
        self.bound.store(false, Ordering::SeqCst);
    }

    fn probe(&self) -> Result<BackendAccess, String> {
        let mut connection =
            HelperConnection::connect(&self.socket_path, self.connect_timeout).map_err(|err| err.to_string())?;
        let available = matches!(
            connection.call(&HelperRequest::Ping)?,
            HelperReply::Text(ref text) if text == PONG
        );
        if !available {
            return Ok(BackendAccess::default());
        }
        let granted = matches!(
            connection.call(&HelperRequest::CheckPermission {
                token: self.request_token(),
            })?,
            HelperReply::Flag(true)
        );
        Ok(BackendAccess { available, granted })
    }
}

impl ShellBackend for HelperClient {
    fn name(&self) -> &'static str {
        "helper"
    }

    fn access(&self, trace_id: &str) -> BackendAccess {
        match self.probe() {
            Ok(access) => access,
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "helper probe failed");
                BackendAccess::default()
            }
        }
    }

    fn bind(&self, trace_id: &str) -> Result<(), AppError> {
        if self.bound.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let gate = Arc::new(ConnectionGate::new());
        if let Ok(mut current) = self.gate.lock() {
            *current = Arc::clone(&gate);
        }

        let path = self.socket_path.clone();
        let io_timeout = self.io_timeout;
        let connection = Arc::clone(&self.connection);
        let bound = Arc::clone(&self.bound);
        let generation = Arc::clone(&self.generation);
        let bind_generation = generation.load(Ordering::SeqCst);
        let trace = trace_id.to_string();
        let spawned = std::thread::Builder::new()
            .name("helper-bind".to_string())
            .spawn(move || {
                let result = HelperConnection::connect(&path, io_timeout).and_then(|mut conn| {
                    match conn.call(&HelperRequest::Ping) {
                        Ok(HelperReply::Text(text)) if text == PONG => Ok(conn),
                        Ok(other) => Err(std::io::Error::other(format!(
                            "unexpected ping reply: {other:?}"
                        ))),
                        Err(err) => Err(std::io::Error::other(err)),
                    }
                });
                // Checked under the connection lock: `unbind` bumps the generation before it
                // clears the slot.
                let Ok(mut guard) = connection.lock() else {
                    gate.open();
                    return;
                };
                if generation.load(Ordering::SeqCst) != bind_generation {
                    drop(guard);
                    debug!(trace_id = %trace, "helper unbound while connecting; discarding");
                    gate.open();
                    return;
                }
                match result {
                    Ok(conn) => {
                        *guard = Some(conn);
                        info!(trace_id = %trace, socket = %path.display(), "helper connected");
                    }
                    Err(err) => {
                        bound.store(false, Ordering::SeqCst);
                        warn!(trace_id = %trace, error = %err, "helper connection failed");
                    }
                }
                drop(guard);
                gate.open();
            });

        if let Err(err) = spawned {
            self.bound.store(false, Ordering::SeqCst);
            return Err(AppError::system(
                format!("Failed to start helper binding: {err}"),
                trace_id,
            ));
        }
        Ok(())
    }

    fn exec(&self, command: &str, trace_id: &str) -> Result<String, AppError> {
        if !self.wait_for_connection(trace_id) {
            return Err(AppError::dependency("Shizuku service not available", trace_id));
        }
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| AppError::system("Helper connection lock poisoned", trace_id))?;
        let Some(connection) = guard.as_mut() else {
            return Err(AppError::dependency("Shizuku service not available", trace_id));
        };

        let request = HelperRequest::Exec {
            command: command.to_string(),
            token: self.request_token(),
        };
        match connection.call(&request) {
            Ok(HelperReply::Text(reply)) => decode_exec_reply(&reply).map_err(|message| {
                if message.is_empty() {
                    AppError::command("Command failed", trace_id)
                } else {
                    AppError::command(message, trace_id)
                }
            }),
            Ok(other) => Err(AppError::system(
                format!("Unexpected helper reply: {other:?}"),
                trace_id,
            )),
            Err(err) => {
                *guard = None;
                drop(guard);
                self.bound.store(false, Ordering::SeqCst);
                warn!(trace_id = %trace_id, error = %err, "helper disconnected");
                Err(AppError::system(
                    format!("Shizuku service disconnected: {err}"),
                    trace_id,
                ))
            }
        }
    }

    fn unbind(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.drop_connection();
        if let Some(gate) = self.current_gate() {
            gate.open();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::shell::gate::CommandGate;
    use crate::app::shell::helper_service::HelperServer;
    use std::os::unix::net::UnixListener;

    fn start_server(dir: &tempfile::TempDir, token: Option<&str>) -> PathBuf {
        let path = dir.path().join("helper.sock");
        let server = Arc::new(HelperServer::new(
            path.clone(),
            token.map(|value| value.to_string()),
            Duration::from_secs(5),
            CommandGate::with_policy(&["echo".to_string(), "exit".to_string()], &[]),
        ));
        let listener = server.bind().expect("bind helper");
        std::thread::spawn(move || server.serve(listener));
        path
    }

    fn client(path: PathBuf, token: Option<&str>) -> HelperClient {
        HelperClient::new(
            path,
            token.map(|value| value.to_string()),
            Duration::from_millis(1500),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn gate_wait_times_out_until_opened() {
        let gate = Arc::new(ConnectionGate::new());
        assert!(!gate.wait(Duration::from_millis(30)));
        let opener = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            opener.open();
        });
        assert!(gate.wait(Duration::from_secs(2)));
        assert!(gate.is_open());
        handle.join().expect("join");
    }

    #[test]
    fn exec_round_trips_through_the_helper() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = start_server(&dir, None);
        let helper = client(path, None);

        assert_eq!(helper.exec("echo hello", "t").expect("exec"), "hello");
        assert!(helper.is_bound());
        assert!(helper.is_connected());

        let err = helper.exec("exit 3", "t").expect_err("non-zero exit");
        assert_eq!(err.code, "ERR_COMMAND");
        assert_eq!(err.error, "Exit code: 3");

        helper.unbind();
        helper.unbind();
        assert!(!helper.is_connected());
        assert!(!helper.is_bound());
        assert_eq!(helper.exec("echo again", "t").expect("rebind"), "again");
    }

    #[test]
    fn access_reports_permission_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = start_server(&dir, Some("secret"));

        let denied = client(path.clone(), Some("wrong"));
        assert_eq!(
            denied.access("t"),
            BackendAccess {
                available: true,
                granted: false
            }
        );
        let err = denied.exec("echo hi", "t").expect_err("denied");
        assert_eq!(err.error, "Permission denied");

        let allowed = client(path, Some("secret"));
        assert!(allowed.access("t").ready());
    }

    #[test]
    fn published_token_is_used_when_none_is_configured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = start_server(&dir, None);
        let helper = client(path, None);
        assert!(helper.access("t").ready());
        assert_eq!(helper.exec("echo via-token-file", "t").expect("exec"), "via-token-file");
    }

    #[test]
    fn unbind_during_connect_discards_the_late_connection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut writer = stream.try_clone().expect("clone");
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).expect("read ping");
            std::thread::sleep(Duration::from_millis(200));
            let reply = encode_line(&HelperReply::Text(PONG.to_string())).expect("encode");
            let _ = writer.write_all(reply.as_bytes());
            std::thread::sleep(Duration::from_millis(200));
        });

        let helper = client(path, Some("secret"));
        helper.bind("t").expect("bind");
        std::thread::sleep(Duration::from_millis(50));
        helper.unbind();
        std::thread::sleep(Duration::from_millis(400));

        assert!(!helper.is_connected());
        assert!(!helper.is_bound());
        server.join().expect("join");
    }

    #[test]
    fn missing_helper_fails_within_the_connect_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = client(dir.path().join("absent.sock"), None);
        assert_eq!(helper.access("t"), BackendAccess::default());

        let started = Instant::now();
        let err = helper.exec("echo hi", "t").expect_err("no helper");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!helper.is_bound());
    }
}
