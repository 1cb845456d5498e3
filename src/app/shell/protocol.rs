//! Wire format between the host and the helper daemon.
//!
//! Each request and each reply is a single line of JSON. The `exec` reply is a plain string:
//! errors travel as an `ERROR:`-prefixed string because the helper interface only returns
//! strings. Only `encode_exec_outcome` and `decode_exec_reply` know about the prefix.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const ERROR_PREFIX: &str = "ERROR:";
pub const PONG: &str = "pong";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum HelperRequest {
    Ping,
    CheckPermission {
        #[serde(default)]
        token: Option<String>,
    },
    Exec {
        command: String,
        #[serde(default)]
        token: Option<String>,
    },
    ExecReturnCode {
        command: String,
        #[serde(default)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HelperReply {
    Flag(bool),
    Code(i64),
    Text(String),
}

/// Where the daemon publishes its session token: next to the socket, mode 0600.
pub fn token_path_for(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("token")
}

pub fn encode_exec_outcome(outcome: Result<String, String>) -> String {
    match outcome {
        Ok(output) => output,
        Err(message) => format!("{ERROR_PREFIX}{message}"),
    }
}

pub fn decode_exec_reply(reply: &str) -> Result<String, String> {
    match reply.strip_prefix(ERROR_PREFIX) {
        Some(message) => Err(message.trim().to_string()),
        None => Ok(reply.to_string()),
    }
}

pub fn encode_line<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_method() {
        let request = HelperRequest::Exec {
            command: "pm list packages".to_string(),
            token: None,
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["method"], "exec");
        assert_eq!(value["command"], "pm list packages");

        let decoded: HelperRequest =
            serde_json::from_str(r#"{"method":"checkPermission"}"#).expect("decode");
        assert_eq!(decoded, HelperRequest::CheckPermission { token: None });

        let line = encode_line(&HelperRequest::Ping).expect("line");
        assert_eq!(line, "{\"method\":\"ping\"}\n");
    }

    #[test]
    fn replies_decode_by_shape() {
        assert_eq!(
            serde_json::from_str::<HelperReply>("true").expect("flag"),
            HelperReply::Flag(true)
        );
        assert_eq!(
            serde_json::from_str::<HelperReply>("-1").expect("code"),
            HelperReply::Code(-1)
        );
        assert_eq!(
            serde_json::from_str::<HelperReply>("\"ERROR:nope\"").expect("text"),
            HelperReply::Text("ERROR:nope".to_string())
        );
    }

    #[test]
    fn error_prefix_marks_failures() {
        assert_eq!(
            decode_exec_reply(&encode_exec_outcome(Err("Exit code: 1".to_string()))),
            Err("Exit code: 1".to_string())
        );
        assert_eq!(
            decode_exec_reply(&encode_exec_outcome(Ok("Success".to_string()))),
            Ok("Success".to_string())
        );
        assert_eq!(decode_exec_reply("ERROR: spaced "), Err("spaced".to_string()));
    }
}
