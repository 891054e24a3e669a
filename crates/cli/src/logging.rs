use anyhow::{anyhow, Context};
use leaveflow_core::config::{AppConfig, LogFormat};
use tracing::Level;

/// Installs the global subscriber. Logs go to stderr so stdout stays a single JSON line.
/// Falls back to defaults when the configuration does not load; the command itself
/// reports that failure.
pub fn init(config: Option<&AppConfig>) -> anyhow::Result<()> {
    let default_config = AppConfig::default();
    let config = config.unwrap_or(&default_config);
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let installed = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|error| anyhow!(error)).context("failed to install tracing subscriber")
}
