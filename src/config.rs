//! Connection records from the configuration provider.
//!
//! The provider hands over a flat record using the `DB_*` field names. It
//! can come from a JSON, TOML or YAML file or from the environment, and is
//! validated into a [`DatabaseConfig`] before anything connects.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::database::{DatabaseConfig, DatabaseType};

/// Errors raised while reading or validating a connection record
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// `DB_PORT` arrives either as a number or as a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> Result<u16, ConfigError> {
        let n = match self {
            PortValue::Number(n) => *n,
            PortValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| ConfigError::Invalid(format!("DB_PORT '{}' is not a number", s)))?,
        };
        match u16::try_from(n) {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ConfigError::Invalid(format!(
                "DB_PORT {} is outside 1-65535",
                n
            ))),
        }
    }
}

/// Raw connection record as the provider supplies it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default, alias = "DB_TYPE")]
    pub db_type: Option<String>,
    #[serde(rename = "DB_NAME", default)]
    pub name: Option<String>,
    #[serde(rename = "DB_HOST", default)]
    pub host: Option<String>,
    #[serde(rename = "DB_PORT", default)]
    pub port: Option<PortValue>,
    #[serde(rename = "DB_USER", default)]
    pub user: Option<String>,
    #[serde(rename = "DB_PASSWORD", default)]
    pub password: Option<SecretString>,
    #[serde(rename = "DB_OPTIONS", default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionSettings {
    /// Load a record from a `.json`, `.toml`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        debug!(path = %path.display(), "reading connection settings");
        let parse =
            |e: &dyn std::fmt::Display| ConfigError::Parse(format!("{}: {}", path.display(), e));
        match extension.as_str() {
            "json" => {
                let content = fs::read_to_string(path)?;
                serde_json::from_str(&content).map_err(|e| parse(&e))
            }
            "toml" => {
                let content = fs::read_to_string(path)?;
                toml::from_str(&content).map_err(|e| parse(&e))
            }
            "yaml" | "yml" => {
                let content = fs::read_to_string(path)?;
                serde_yaml::from_str(&content).map_err(|e| parse(&e))
            }
            _ => Err(ConfigError::Invalid(format!(
                "unsupported configuration file extension: {}",
                path.display()
            ))),
        }
    }

    /// Read the record from process environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a record from `(name, value)` pairs using the environment names.
    ///
    /// `DB_OPTIONS` is a comma-separated list of `key=value` pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut settings = Self::default();
        for (key, value) in vars {
            let value = value.into();
            match key.as_ref() {
                "DB_TYPE" | "db_type" => settings.db_type = Some(value),
                "DB_NAME" => settings.name = Some(value),
                "DB_HOST" => settings.host = Some(value),
                "DB_PORT" => settings.port = Some(PortValue::Text(value)),
                "DB_USER" => settings.user = Some(value),
                "DB_PASSWORD" => settings.password = Some(SecretString::new(value)),
                "DB_OPTIONS" => {
                    settings.options = value
                        .split(',')
                        .filter_map(|pair| pair.split_once('='))
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                        .filter(|(k, _)| !k.is_empty())
                        .collect();
                }
                _ => {}
            }
        }
        settings
    }

    /// Replace the engine kind, as the CLI's `--db-type` does.
    pub fn with_db_type(mut self, db_type: impl Into<String>) -> Self {
        self.db_type = Some(db_type.into());
        self
    }
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingField(field))
}

impl TryFrom<ConnectionSettings> for DatabaseConfig {
    type Error = ConfigError;

    fn try_from(settings: ConnectionSettings) -> Result<Self, Self::Error> {
        let db_type: DatabaseType = required(&settings.db_type, "db_type")?
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{}", e)))?;
        let name = required(&settings.name, "DB_NAME")?;

        let built = if db_type.is_server() {
            let host = required(&settings.host, "DB_HOST")?;
            let user = required(&settings.user, "DB_USER")?;
            let port = match &settings.port {
                Some(port) => port.to_port()?,
                None => db_type
                    .default_port()
                    .ok_or(ConfigError::MissingField("DB_PORT"))?,
            };
            let password = settings
                .password
                .clone()
                .filter(|p| !p.expose_secret().is_empty())
                .ok_or(ConfigError::MissingField("DB_PASSWORD"))?;

            DatabaseConfig::new(db_type, host, port, name, user, password)
        } else {
            DatabaseConfig::sqlite(name)
        };
        let config = built.map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(config.with_options(settings.options))
    }
}
