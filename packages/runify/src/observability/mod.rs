// packages/runify/src/observability/mod.rs
//! Logging and metrics
//!
//! Agents report through the `metrics` facade; nothing is exported unless
//! the embedding application installs a recorder.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{HarnessError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const EVALUATIONS_TOTAL: &str = "runify_evaluations_total";
pub const EVAL_DURATION_SECONDS: &str = "runify_eval_duration_seconds";
pub const STOPS_TOTAL: &str = "runify_stops_total";
pub const BACKEND_CRASHES_TOTAL: &str = "runify_backend_crashes_total";

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            HarnessError::ConfigurationError(format!(
                "invalid log filter {:?}: {}",
                config.level, e
            ))
        })?;

    let json = config.json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text = (!config.json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| HarnessError::ConfigurationError(format!("tracing already set up: {}", e)))
}

/// Register descriptions for every metric agents emit
pub fn describe_metrics() {
    metrics::describe_counter!(EVALUATIONS_TOTAL, "Evaluations completed, by backend");
    metrics::describe_histogram!(
        EVAL_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Wall time of one evaluation round trip"
    );
    metrics::describe_counter!(STOPS_TOTAL, "Forced terminations via stop()");
    metrics::describe_counter!(BACKEND_CRASHES_TOTAL, "Backends that died mid-operation");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_configuration_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "runify=loud".to_string(),
            json: false,
        };
        assert!(matches!(
            init_tracing(&config),
            Err(HarnessError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
