//! Logging setup shared by the bridge binaries.
//!
//! Output format and filtering come from `LOG_FORMAT` and `RUST_LOG`; see
//! [`TelemetryConfig`].

use anyhow::Result;

mod config;
mod tracing_init;

pub use config::{DEFAULT_LOG_FILTER, TelemetryConfig};
pub use tracing_init::init_telemetry;

/// Installs the subscriber configured from the environment.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(&TelemetryConfig::from_env(
        service_name,
        env!("CARGO_PKG_VERSION"),
    ))
}
