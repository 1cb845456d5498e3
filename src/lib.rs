pub mod app;

use std::io;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use uuid::Uuid;

use app::bridge::{line_emitter, serve_lines, NativeBridge};
use app::config::{config_path, load_config, AppConfig};
use app::logging::init_logging;
use app::state::AppState;

/// Host entry point: answers bridge requests from stdin on stdout until stdin closes.
pub fn run() {
    let (config, load_error) = match load_config() {
        Ok(config) => (config, None),
        Err(err) => (AppConfig::default(), Some(err)),
    };
    init_logging(&config.logging.log_level);
    if let Some(err) = load_error {
        warn!(error = %err, "config unreadable; using defaults");
    }

    let out = Arc::new(Mutex::new(io::stdout()));
    let state = Arc::new(AppState::new(config, Some(config_path())));
    let startup_trace = Uuid::new_v4().to_string();
    let mode = state.select_initial_mode(&startup_trace);
    let bridge = NativeBridge::new(state, line_emitter(Arc::clone(&out)));
    info!(
        trace_id = %startup_trace,
        version = env!("CARGO_PKG_VERSION"),
        mode = mode.as_str(),
        "bridge host started"
    );

    serve_lines(io::stdin().lock(), out.as_ref(), &bridge);

    bridge.cleanup();
    info!("bridge host stopped");
}
