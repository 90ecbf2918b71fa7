//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::NetConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::NetError {
    fn from(e: ConfigError) -> Self {
        crate::error::NetError::Config(e.to_string())
    }
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<NetConfig, ConfigError> {
    let config: NetConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<NetConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::SecurityMode;

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.pools.tx_buffers, 7);
        assert_eq!(config.sockets.max_with_callbacks, 5);
        assert!(config.network.join_fallback.is_none());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = parse_config(
            r#"
            [tcp]
            mss = 536

            [network]
            join_fallback = "wpa_psk"
            "#,
        )
        .unwrap();
        assert_eq!(config.tcp.mss, 536);
        assert_eq!(config.tcp.listen_queue, 5);
        assert_eq!(config.network.join_fallback, Some(SecurityMode::WpaPsk));
    }

    #[test]
    fn validation_failures_are_reported() {
        let err = parse_config("[pools]\nrx_buffers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert!(err.to_string().contains("pools.rx_buffers"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/ember.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
