//! Process settings read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::control::ServiceOptions;
use crate::detection::DEFAULT_DEGRADED_AFTER;

/// Settings for the `peekguard` server process
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub host: String,
    pub port: u16,
    /// Where subject state is persisted; in-memory when unset
    pub data_dir: Option<PathBuf>,
    pub api_token: Option<String>,
    pub max_samples: usize,
    pub max_alerts: usize,
    pub sample_timeout_ms: u64,
    pub delivery_timeout_ms: u64,
    pub degraded_after: u32,
    /// Peek probability of the simulated sampler
    pub peek_probability: f64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: None,
            api_token: None,
            max_samples: 1000,
            max_alerts: 500,
            sample_timeout_ms: 5000,
            delivery_timeout_ms: 3000,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            peek_probability: 0.1,
        }
    }
}

impl ServiceSettings {
    /// Read `PEEKGUARD_*` variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            host: text("PEEKGUARD_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PEEKGUARD_PORT", defaults.port),
            data_dir: text("PEEKGUARD_DATA_DIR").map(PathBuf::from),
            api_token: text("PEEKGUARD_API_TOKEN"),
            max_samples: parse_or(&lookup, "PEEKGUARD_MAX_SAMPLES", defaults.max_samples).max(1),
            max_alerts: parse_or(&lookup, "PEEKGUARD_MAX_ALERTS", defaults.max_alerts).max(1),
            sample_timeout_ms: parse_or(&lookup, "PEEKGUARD_SAMPLE_TIMEOUT_MS", defaults.sample_timeout_ms),
            delivery_timeout_ms: parse_or(
                &lookup,
                "PEEKGUARD_DELIVERY_TIMEOUT_MS",
                defaults.delivery_timeout_ms,
            ),
            degraded_after: parse_or(&lookup, "PEEKGUARD_DEGRADED_AFTER", defaults.degraded_after).max(1),
            peek_probability: parse_or(&lookup, "PEEKGUARD_PEEK_PROBABILITY", defaults.peek_probability)
                .clamp(0.0, 1.0),
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            max_samples: self.max_samples,
            max_alerts: self.max_alerts,
            sample_timeout: Duration::from_millis(self.sample_timeout_ms),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            degraded_after: self.degraded_after,
            ..ServiceOptions::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}, using default", name, raw);
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> ServiceSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from(&[]);
        assert_eq!(settings, ServiceSettings::default());
        assert!(settings.data_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = settings_from(&[
            ("PEEKGUARD_PORT", "9090"),
            ("PEEKGUARD_DATA_DIR", "/var/lib/peekguard"),
            ("PEEKGUARD_API_TOKEN", "secret"),
            ("PEEKGUARD_MAX_SAMPLES", "200"),
            ("PEEKGUARD_DEGRADED_AFTER", "5"),
        ]);

        assert_eq!(settings.port, 9090);
        assert_eq!(settings.data_dir, Some(PathBuf::from("/var/lib/peekguard")));
        assert_eq!(settings.api_token.as_deref(), Some("secret"));
        assert_eq!(settings.service_options().max_samples, 200);
        assert_eq!(settings.service_options().degraded_after, 5);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let settings = settings_from(&[
            ("PEEKGUARD_PORT", "not-a-port"),
            ("PEEKGUARD_API_TOKEN", "   "),
            ("PEEKGUARD_PEEK_PROBABILITY", "7"),
        ]);

        assert_eq!(settings.port, 8080);
        assert!(settings.api_token.is_none());
        assert_eq!(settings.peek_probability, 1.0);
    }
}
