//! Relay configuration.
//!
//! Sources, lowest precedence first:
//! - built-in defaults (`Settings::default()`)
//! - `config/default.toml`, if present
//! - an explicit file passed with `--config`
//! - `RELAY_`-prefixed environment variables, `__` between section and key
//!   (e.g. `RELAY_BROKER__HOST=localhost`)

mod settings;

use std::path::Path;

use config::{Config, Environment, File};

use crate::config::settings::PartialSettings;
use crate::utils::error::SettingsError;

pub use settings::{
    BrokerSettings, ConsumerSettings, LogSettings, PublisherSettings, QueueSettings,
    RetrySettings, Settings,
};

/// Loads the configuration from the default file, an optional extra file and
/// environment variables, merges it over the defaults and validates it.
pub fn load_config(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));
    if let Some(path) = path {
        builder = builder.add_source(File::from(path));
    }
    builder = builder.add_source(
        Environment::with_prefix("RELAY")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = partial.merge(Settings::default());
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests;
