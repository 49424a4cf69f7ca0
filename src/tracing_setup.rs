use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::{AppConfig, LogFormat};

/// Initialize logging from the application configuration.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_from_config(config: &AppConfig) -> Result<()> {
    let level = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| config.log_level.clone());
    init_tracing_with_config(&level, config.log_format == LogFormat::Json)
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("A global tracing subscriber is already installed")?;

    tracing::info!(
        "Logging initialized with level: {}, json: {}",
        level,
        json_format
    );
    Ok(())
}

/// Span wrapping the lifetime of one server instance.
pub fn create_server_span(base_url: &str) -> tracing::Span {
    tracing::info_span!("server", url = base_url)
}

/// Span wrapping the handling of one accepted connection.
pub fn create_connection_span(connection_id: u64, remote_addr: &str) -> tracing::Span {
    tracing::debug_span!(
        "connection",
        connection.id = connection_id,
        net.peer = remote_addr,
    )
}
