use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::error::AppError;
use crate::app::shell::gate::CommandGate;
use crate::app::shell::protocol::{
    encode_exec_outcome, encode_line, token_path_for, HelperReply, HelperRequest, PONG,
};
use crate::app::shell::runner::run_shell_command;

const OWNER_ONLY: u32 = 0o600;

/// The privileged side of the helper channel. Runs in its own process (started with the
/// elevated privilege obtained out of band) and executes gated commands for callers holding
/// the session token.
///
/// Without a configured token a random one is generated; `bind` publishes it in a 0600 file
/// next to the socket.
#[derive(Debug, Clone)]
pub struct HelperServer {
    socket_path: PathBuf,
    token: String,
    exec_timeout: Duration,
    gate: CommandGate,
    owner_uid: Option<u32>,
}

impl HelperServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        token: Option<String>,
        exec_timeout: Duration,
        gate: CommandGate,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            token: token
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            exec_timeout,
            gate,
            owner_uid: None,
        }
    }

    /// Hands the socket and token file to `uid` after binding, so an unprivileged host
    /// process can reach them.
    pub fn with_owner(mut self, uid: Option<u32>) -> Self {
        self.owner_uid = uid;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_path(&self) -> PathBuf {
        token_path_for(&self.socket_path)
    }

    pub fn bind(&self) -> Result<UnixListener, AppError> {
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path).map_err(|err| {
                AppError::system(format!("Failed to remove stale socket: {err}"), "")
            })?;
        }
        if let Some(parent) = self.socket_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|err| AppError::system(format!("Failed to bind helper socket: {err}"), ""))?;
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(OWNER_ONLY)).map_err(
            |err| AppError::system(format!("Failed to restrict helper socket: {err}"), ""),
        )?;
        self.publish_token()?;
        if let Some(uid) = self.owner_uid {
            for path in [self.socket_path.clone(), self.token_path()] {
                std::os::unix::fs::chown(&path, Some(uid), None).map_err(|err| {
                    AppError::system(
                        format!("Failed to hand {} to uid {uid}: {err}", path.display()),
                        "",
                    )
                })?;
            }
        }
        Ok(listener)
    }

    fn publish_token(&self) -> Result<(), AppError> {
        let path = self.token_path();
        let _ = fs::remove_file(&path);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(OWNER_ONLY)
            .open(&path)
            .map_err(|err| AppError::system(format!("Failed to write helper token: {err}"), ""))?;
        file.write_all(self.token.as_bytes())
            .map_err(|err| AppError::system(format!("Failed to write helper token: {err}"), ""))
    }

    /// Accept loop. Each connection gets its own thread; requests on one connection are handled
    /// strictly in order.
    pub fn serve(self: Arc<Self>, listener: UnixListener) {
        info!(socket = %self.socket_path.display(), "helper listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self);
                    std::thread::spawn(move || server.handle_connection(stream));
                }
                Err(err) => {
                    warn!(error = %err, "helper accept failed");
                }
            }
        }
    }

    fn handle_connection(&self, stream: UnixStream) {
        let mut writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                warn!(error = %err, "failed to clone helper connection");
                return;
            }
        };
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<HelperRequest>(&line) {
                Ok(request) => self.handle_request(request),
                Err(err) => HelperReply::Text(encode_exec_outcome(Err(format!(
                    "Malformed request: {err}"
                )))),
            };
            let payload = match encode_line(&reply) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to encode helper reply");
                    break;
                }
            };
            if writer.write_all(payload.as_bytes()).is_err() || writer.flush().is_err() {
                break;
            }
        }
        debug!("helper connection closed");
    }

    pub fn handle_request(&self, request: HelperRequest) -> HelperReply {
        match request {
            HelperRequest::Ping => HelperReply::Text(PONG.to_string()),
            HelperRequest::CheckPermission { token } => HelperReply::Flag(self.authorized(&token)),
            HelperRequest::Exec { command, token } => {
                if !self.authorized(&token) {
                    return HelperReply::Text(encode_exec_outcome(Err(
                        "Permission denied".to_string()
                    )));
                }
                HelperReply::Text(self.exec(&command))
            }
            HelperRequest::ExecReturnCode { command, token } => {
                if !self.authorized(&token) {
                    return HelperReply::Code(-1);
                }
                HelperReply::Code(self.exec_return_code(&command))
            }
        }
    }

    fn authorized(&self, token: &Option<String>) -> bool {
        token.as_deref().map(str::trim) == Some(self.token.as_str())
    }

    /// Trimmed stdout on success. On a non-zero exit: stderr, else stdout, else the exit code,
    /// behind the error prefix. Commands outside the gate never reach the shell.
    pub fn exec(&self, command: &str) -> String {
        let trace_id = Uuid::new_v4().to_string();
        if !self.gate.is_allowed(command) {
            warn!(trace_id = %trace_id, command = %command.trim(), "helper rejected command");
            return encode_exec_outcome(Err("Command not allowed".to_string()));
        }
        let outcome = match run_shell_command(command, self.exec_timeout, &trace_id) {
            Ok(output) if output.success() => Ok(output.stdout.trim().to_string()),
            Ok(output) => {
                let stderr = output.stderr.trim();
                let stdout = output.stdout.trim();
                let message = if !stderr.is_empty() {
                    stderr.to_string()
                } else if !stdout.is_empty() {
                    stdout.to_string()
                } else {
                    format!("Exit code: {}", output.exit_code.unwrap_or(-1))
                };
                Err(message)
            }
            Err(err) => Err(err.error),
        };
        encode_exec_outcome(outcome)
    }

    pub fn exec_return_code(&self, command: &str) -> i64 {
        let trace_id = Uuid::new_v4().to_string();
        if !self.gate.is_allowed(command) {
            warn!(trace_id = %trace_id, command = %command.trim(), "helper rejected command");
            return -1;
        }
        match run_shell_command(command, self.exec_timeout, &trace_id) {
            Ok(output) => output.exit_code.map(i64::from).unwrap_or(-1),
            Err(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::AppConfig;

    const TOKEN: &str = "secret";

    fn shell_gate() -> CommandGate {
        CommandGate::with_policy(&["echo".to_string(), "exit".to_string()], &[])
    }

    fn server() -> HelperServer {
        HelperServer::new(
            "/tmp/unused.sock",
            Some(TOKEN.to_string()),
            Duration::from_secs(5),
            shell_gate(),
        )
    }

    fn exec(helper: &HelperServer, command: &str, token: Option<&str>) -> HelperReply {
        helper.handle_request(HelperRequest::Exec {
            command: command.to_string(),
            token: token.map(str::to_string),
        })
    }

    #[test]
    fn exec_returns_trimmed_stdout() {
        assert_eq!(server().exec("echo '  hello  '"), "hello");
    }

    #[test]
    fn exec_failures_use_error_prefix() {
        let helper = server();
        assert_eq!(helper.exec("echo bad 1>&2; exit 1"), "ERROR:bad");
        assert_eq!(helper.exec("echo only-out; exit 1"), "ERROR:only-out");
        assert_eq!(helper.exec("exit 7"), "ERROR:Exit code: 7");
    }

    #[test]
    fn exec_return_code_reports_exit_status() {
        let helper = server();
        assert_eq!(helper.exec_return_code("exit 0"), 0);
        assert_eq!(helper.exec_return_code("exit 4"), 4);
    }

    #[test]
    fn token_gates_exec_and_permission() {
        let helper = server();
        assert_eq!(
            helper.handle_request(HelperRequest::CheckPermission { token: None }),
            HelperReply::Flag(false)
        );
        assert_eq!(
            helper.handle_request(HelperRequest::CheckPermission {
                token: Some(TOKEN.to_string())
            }),
            HelperReply::Flag(true)
        );
        assert_eq!(
            exec(&helper, "echo hi", Some("wrong")),
            HelperReply::Text("ERROR:Permission denied".to_string())
        );
        assert_eq!(
            helper.handle_request(HelperRequest::ExecReturnCode {
                command: "exit 0".to_string(),
                token: None,
            }),
            HelperReply::Code(-1)
        );
    }

    #[test]
    fn default_config_still_requires_a_token() {
        let helper = HelperServer::new(
            "/tmp/unused.sock",
            AppConfig::default().execution.helper_token,
            Duration::from_secs(5),
            CommandGate::default(),
        );
        assert!(!helper.token().is_empty());
        assert_eq!(
            helper.handle_request(HelperRequest::CheckPermission { token: None }),
            HelperReply::Flag(false)
        );
        assert_eq!(
            exec(&helper, "echo any-client; id -u", None),
            HelperReply::Text("ERROR:Permission denied".to_string())
        );
    }

    #[test]
    fn gate_runs_inside_the_daemon() {
        let helper = HelperServer::new(
            "/tmp/unused.sock",
            Some(TOKEN.to_string()),
            Duration::from_secs(5),
            CommandGate::default(),
        );
        assert_eq!(
            exec(&helper, "id -u", Some(TOKEN)),
            HelperReply::Text("ERROR:Command not allowed".to_string())
        );
        assert_eq!(
            exec(&helper, "pm list packages; reboot", Some(TOKEN)),
            HelperReply::Text("ERROR:Command not allowed".to_string())
        );
        assert_eq!(helper.exec_return_code("id -u"), -1);
    }

    #[test]
    fn bind_restricts_socket_and_publishes_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = HelperServer::new(
            dir.path().join("helper.sock"),
            None,
            Duration::from_secs(5),
            shell_gate(),
        );
        let _listener = helper.bind().expect("bind");

        let socket_mode = fs::metadata(helper.socket_path()).expect("socket").permissions().mode();
        assert_eq!(socket_mode & 0o777, 0o600);
        let token_meta = fs::metadata(helper.token_path()).expect("token file");
        assert_eq!(token_meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(
            fs::read_to_string(helper.token_path()).expect("token"),
            helper.token()
        );
    }

    #[test]
    fn ping_answers_pong() {
        assert_eq!(
            server().handle_request(HelperRequest::Ping),
            HelperReply::Text(PONG.to_string())
        );
    }
}
