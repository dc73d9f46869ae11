//! Application configuration.
//!
//! Loaded from a TOML file; credentials and installation details can be
//! overridden from the environment.

use std::path::Path;

use panelwire_commands::ConnectionConfig;
use serde::{Deserialize, Serialize};

use crate::alarm::AlarmConfig;
use crate::session::SessionConfig;

/// Environment variable names.
pub mod env_vars {
    pub const USER: &str = "PANELWIRE_USER";
    pub const PASSWORD: &str = "PANELWIRE_PASSWORD";
    pub const INSTALLATION: &str = "PANELWIRE_INSTALLATION";
    pub const PANEL: &str = "PANELWIRE_PANEL";
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub alarm: AlarmConfig,
}

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Replace values for which `lookup` yields a non-empty string.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(user) = get(env_vars::USER) {
            self.session.user = Some(user);
        }
        if let Some(password) = get(env_vars::PASSWORD) {
            self.session.password = Some(password);
        }
        if let Some(installation) = get(env_vars::INSTALLATION) {
            self.alarm.installation = Some(installation);
        }
        if let Some(panel) = get(env_vars::PANEL) {
            self.alarm.panel = Some(panel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Country;

    #[test]
    fn test_parse_full() {
        let config = AppConfig::from_toml(
            r#"
            [connection]
            interval = 2
            attempts = 5

            [session]
            user = "3331234567"
            password = "secret"
            country = "italy"
            timeout = 120

            [alarm]
            installation = "1234567"
            panel = "SDVFAST"
            refresh = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.interval, 2);
        assert_eq!(config.connection.attempts, 5);
        assert_eq!(config.session.country, Some(Country::Italy));
        assert_eq!(config.session.timeout, 120);
        assert_eq!(config.alarm.panel.as_deref(), Some("SDVFAST"));
        assert_eq!(config.alarm.refresh, 10);
    }

    #[test]
    fn test_empty_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.connection.attempts, 10);
        assert_eq!(config.session.timeout, 60);
        assert!(config.alarm.installation.is_none());
    }

    #[test]
    fn test_unknown_country_rejected() {
        let result = AppConfig::from_toml("[session]\ncountry = \"atlantis\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = AppConfig::default();
        config.session.user = Some("file-user".to_string());

        config.apply_overrides(|name| match name {
            env_vars::USER => Some("env-user".to_string()),
            env_vars::PANEL => Some("SDVECU".to_string()),
            env_vars::PASSWORD => Some(String::new()),
            _ => None,
        });

        assert_eq!(config.session.user.as_deref(), Some("env-user"));
        assert_eq!(config.alarm.panel.as_deref(), Some("SDVECU"));
        assert!(config.session.password.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/panelwire.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panelwire.toml");
        std::fs::write(&path, "[alarm]\nrefresh = 3\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.alarm.refresh, 3);
    }
}
