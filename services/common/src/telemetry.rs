//! Tracing and logging setup.

use crate::config::MonitoringConfig;
use crate::error::Result;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured log level when set.
pub fn init(service_name: &str, config: &MonitoringConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = if config.log_format == "json" {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    Registry::default().with(env_filter).with(fmt_layer).init();

    tracing::info!(service = service_name, "Telemetry initialized");
    Ok(())
}
