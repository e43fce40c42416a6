use std::env;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub json_logs: bool,
    /// `EnvFilter` directives, e.g. `info,bridge_core=debug`.
    pub filter: String,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        Self::from_lookup(default_service_name, default_service_version, |name| {
            env::var(name).ok()
        })
    }

    pub fn from_lookup<F>(default_service_name: &str, default_service_version: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = lookup("BRIDGE_SERVICE_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_service_name.to_string());
        let json_logs = lookup("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);
        let filter = lookup("RUST_LOG")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Self {
            service_name,
            service_version: default_service_version.to_string(),
            json_logs,
            filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_json_at_info() {
        let cfg = TelemetryConfig::from_lookup("bridge", "1.0.0", |_| None);
        assert_eq!(cfg.service_name, "bridge");
        assert!(cfg.json_logs);
        assert_eq!(cfg.filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn text_format_and_filter_from_env() {
        let cfg = TelemetryConfig::from_lookup("bridge", "1.0.0", |name| match name {
            "LOG_FORMAT" => Some("Pretty".into()),
            "RUST_LOG" => Some("bridge_core=trace".into()),
            "BRIDGE_SERVICE_NAME" => Some("orders-bridge".into()),
            _ => None,
        });
        assert!(!cfg.json_logs);
        assert_eq!(cfg.filter, "bridge_core=trace");
        assert_eq!(cfg.service_name, "orders-bridge");
    }
}
