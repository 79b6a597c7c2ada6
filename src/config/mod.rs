//! The `config` module loads the bridge configuration.
//!
//! Settings come from a configuration file (YAML unless the extension says
//! otherwise) layered with `MQTT_LOGGER__`-prefixed environment variables,
//! e.g. `MQTT_LOGGER__LOGGING__ROOT=/var/log/mqtt`. The raw values are
//! deserialized into [`PartialSettings`] and validated into [`Settings`].

mod settings;
pub mod size;

use std::path::Path;

use config::{Config, Environment, File, FileFormat};

use crate::utils::SettingsError;

pub use settings::{
    BrokerEndpoint, LoggingSettings, PartialBroker, PartialLogging, PartialSettings, PartialTopic,
    Qos, Settings, TopicSettings,
};
pub use size::{RawSize, parse_size};

pub const ENV_PREFIX: &str = "MQTT_LOGGER";

pub const DEFAULT_CONFIG_PATH: &str = "/config/configuration.yaml";

/// Loads and validates the configuration file at `path`, applying
/// environment overrides on top.
pub fn load_config(path: &Path) -> Result<Settings, SettingsError> {
    let builder = Config::builder()
        .add_source(File::from(path).required(true))
        .add_source(env_source());

    load(builder.build()?)
}

/// Same as [`load_config`] but reads the configuration from a string.
pub fn load_config_str(text: &str, format: FileFormat) -> Result<Settings, SettingsError> {
    let builder = Config::builder()
        .add_source(File::from_str(text, format))
        .add_source(env_source());

    load(builder.build()?)
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX).separator("__")
}

fn load(config: Config) -> Result<Settings, SettingsError> {
    let partial: PartialSettings = config.try_deserialize()?;
    Settings::from_partial(partial)
}
