//! Server configuration. Values are layered: built-in defaults, then an
//! optional TOML file, then `HIGH_DETECTOR_*` environment variables. The
//! inference API key may also come from `GEMINI_API_KEY`.

use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Default tracing filter when `RUST_LOG` is unset
pub const RUST_LOG: &str = "info,actix_web=info";

/// Config file read when no path is passed on the command line
pub const DEFAULT_CONFIG_FILE: &str = "high-detector.toml";

/// Prefix of the environment variables that override the config file
pub const ENV_PREFIX: &str = "HIGH_DETECTOR";

/// Fallback environment variable holding the inference API key
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

/// Route the capture client posts images to
pub const ANALYZE_PATH: &str = "/api/analyze-face";

#[derive(Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    /// Secret for the inference service. Never logged
    pub api_key: String,

    /// Base URL of the Gemini REST API, without a trailing `/models`
    pub api_base_url: String,
    pub model: String,
    pub temperature: f32,

    /// Upper bound on a single inference call
    pub request_timeout_secs: u64,

    /// Total attempts per request, including the first one
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Largest accepted request body. Photos are sent as base 64 inside JSON
    pub max_body_bytes: usize,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl Settings {
    /// Load settings from `path` (or `DEFAULT_CONFIG_FILE`) and the
    /// environment. Fails when no API key is configured anywhere
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path.unwrap_or(DEFAULT_CONFIG_FILE)).required(path.is_some()))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Self::from_builder(config, std::env::var(API_KEY_VAR).ok())
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        fallback_key: Option<String>,
    ) -> Result<Self> {
        let mut settings: Settings = Self::with_defaults(builder)?
            .build()?
            .try_deserialize()?;

        if settings.api_key.trim().is_empty() {
            settings.api_key = fallback_key.unwrap_or_default();
        }
        settings.validate()?;

        Ok(settings)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(builder
            .set_default("host", "0.0.0.0")?
            .set_default("port", 3000_i64)?
            .set_default("api_key", "")?
            .set_default(
                "api_base_url",
                "https://generativelanguage.googleapis.com/v1beta",
            )?
            .set_default("model", "gemini-2.5-flash")?
            .set_default("temperature", 0.7_f64)?
            .set_default("request_timeout_secs", 30_i64)?
            .set_default("max_attempts", 3_i64)?
            .set_default("backoff_base_ms", 500_i64)?
            .set_default("backoff_max_ms", 5_000_i64)?
            .set_default("max_body_bytes", 10 * 1024 * 1024_i64)?)
    }

    fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!("no inference API key configured: set {API_KEY_VAR} or {ENV_PREFIX}_API_KEY");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_with_fallback_key() {
        let settings = Settings::from_builder(Config::builder(), Some("secret".into())).unwrap();
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.api_key, "secret");
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert!((settings.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn missing_api_key_fails_fast() {
        let err = Settings::from_builder(Config::builder(), None).unwrap_err();
        assert!(err.to_string().contains(API_KEY_VAR));
    }

    #[test]
    fn configured_key_beats_fallback() {
        let builder = Config::builder()
            .set_override("api_key", "from-config")
            .unwrap()
            .set_override("port", 8080_i64)
            .unwrap();
        let settings = Settings::from_builder(builder, Some("from-env".into())).unwrap();
        assert_eq!(settings.api_key, "from-config");
        assert_eq!(settings.port, 8080);
    }

    #[test]
    fn rejects_zero_attempts() {
        let builder = Config::builder().set_override("max_attempts", 0_i64).unwrap();
        assert!(Settings::from_builder(builder, Some("k".into())).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let settings = Settings::from_builder(Config::builder(), Some("hunter2".into())).unwrap();
        let shown = format!("{settings:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("<redacted>"));
    }
}
