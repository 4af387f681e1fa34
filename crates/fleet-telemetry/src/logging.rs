use tracing_subscriber::{fmt, EnvFilter};

/// Output format for [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging for a worker process.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info", "fleet_daemon=debug,warn").
/// Safe to call multiple times (e.g. in tests); later calls are no-ops.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    match format {
        LogFormat::Human => init_logging(service_name, default_level),
        LogFormat::Json => init_logging_json(service_name, default_level),
    }
}

pub fn init_logging(service_name: &str, default_level: &str) {
    let installed = fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "logging initialised (human-readable)");
    }
}

/// JSON lines, one object per event, for log shippers.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let installed = fmt()
        .json()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_current_span(true)
        .with_level(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "logging initialised (json)");
    }
}
