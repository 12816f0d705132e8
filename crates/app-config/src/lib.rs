// In crates/app-config/src/lib.rs

use config::{Config, Environment, File};

pub mod error;
pub mod types;

// Re-export the most important types for easy access.
pub use error::{Error, Result};
pub use types::{
    ActivitySettings, AppSettings, BackoffSettings, ExchangeSettings, HealthSettings,
    IndicatorSettings, ServerSettings, SessionSettings, Settings, SimulationSettings,
    StrategySettings,
};

/// Loads the application settings from various sources.
///
/// This function orchestrates the layered configuration loading:
/// 1. Reads from a default `base.toml` file.
/// 2. Merges settings from an environment-specific file (e.g., `development.toml`).
/// 3. Merges settings from environment variables.
pub fn load_settings() -> Result<Settings> {
    load_settings_from("config")
}

/// Same as [`load_settings`], reading the TOML files from `dir`.
pub fn load_settings_from(dir: &str) -> Result<Settings> {
    // Get the current environment. Default to "development" if not set.
    let environment = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".into());

    let settings = Config::builder()
        .add_source(File::with_name(&format!("{}/base", dir)))
        .add_source(File::with_name(&format!("{}/{}", dir, environment)).required(false))
        // e.g. `APP_HEALTH__WARN_AFTER_SECS=90`
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let settings: Settings = settings.try_deserialize()?;
    check(settings)
}

/// Parses a complete settings document from TOML text, without layering.
pub fn parse_settings(content: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(content)?;
    check(settings)
}

fn check(settings: Settings) -> Result<Settings> {
    let jitter = settings.backoff.jitter;
    if !(0.0..=BackoffSettings::MAX_JITTER).contains(&jitter) {
        return Err(Error::InvalidSetting {
            name: "backoff.jitter",
            reason: format!("{} is outside 0.0..={}", jitter, BackoffSettings::MAX_JITTER),
        });
    }
    Ok(settings)
}
