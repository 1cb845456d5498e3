//! Privileged helper daemon. Started once with elevated rights (for example from a one-shot
//! `su` or a wireless debugging shell); the host then forwards commands over its socket.
//!
//! The socket and the session token file are created 0600. Pass `--owner-uid` with the host
//! app's uid so it can reach them.

use std::sync::Arc;
use std::time::Duration;

use appcontrol_lib::app::config::load_config;
use appcontrol_lib::app::logging::init_logging;
use appcontrol_lib::app::shell::gate::CommandGate;
use appcontrol_lib::app::shell::helper_service::HelperServer;
use tracing::{error, info};

#[derive(Debug, Clone)]
struct Args {
    socket: Option<String>,
    token: Option<String>,
    timeout_secs: Option<u64>,
    owner_uid: Option<u32>,
}

fn print_usage() {
    eprintln!(
        "Usage: appcontrol-helper [--socket <path>] [--token <secret>] [--timeout-secs <n>] \
         [--owner-uid <uid>]\n\
         Defaults come from the appcontrol config file."
    );
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        socket: None,
        token: std::env::var("APPCONTROL_HELPER_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty()),
        timeout_secs: None,
        owner_uid: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--socket" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--socket requires a value".to_string())?;
                args.socket = Some(value);
            }
            "--token" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--token requires a value".to_string())?;
                args.token = Some(value);
            }
            "--timeout-secs" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--timeout-secs requires a value".to_string())?;
                let secs = value
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| format!("invalid --timeout-secs: {value}"))?;
                args.timeout_secs = Some(secs);
            }
            "--owner-uid" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--owner-uid requires a value".to_string())?;
                let uid = value
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --owner-uid: {value}"))?;
                args.owner_uid = Some(uid);
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            print_usage();
            std::process::exit(2);
        }
    };

    let config = load_config().unwrap_or_default();
    init_logging(&config.logging.log_level);
    let gate = CommandGate::with_policy(
        &config.policy.extra_allowed_prefixes,
        &config.policy.extra_blocked_patterns,
    );
    let settings = config.execution;

    let socket = args.socket.unwrap_or(settings.helper_socket_path);
    let token = args.token.or(settings.helper_token);
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(settings.session_timeout_secs));

    let server = Arc::new(HelperServer::new(socket, token, timeout, gate).with_owner(args.owner_uid));
    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "helper failed to start");
            std::process::exit(1);
        }
    };
    info!(
        socket = %server.socket_path().display(),
        token_file = %server.token_path().display(),
        "helper ready"
    );
    server.serve(listener);
}
