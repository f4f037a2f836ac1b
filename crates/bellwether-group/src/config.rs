//! Group backend configuration.
//!
//! Loaded from TOML; every field has a default so an empty table is valid.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::client::validate_path;
use crate::constants::DEFAULT_CONNECT_STRING;
use crate::constants::DEFAULT_MEMBER_PREFIX;
use crate::constants::DEFAULT_ROOT_PATH;
use crate::constants::DEFAULT_SESSION_TIMEOUT_MS;
use crate::constants::MAX_SESSION_TIMEOUT_MS;
use crate::constants::MIN_SESSION_TIMEOUT_MS;

/// Where and how groups are laid out in the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Parent path of every cluster. Views live at
    /// `{root_path}/{cluster_id}/{namespace}`.
    #[serde(default = "default_root_path")]
    pub root_path: String,

    /// Name prefix of member nodes.
    #[serde(default = "default_member_prefix")]
    pub member_prefix: String,

    /// Session timeout requested from the coordination service.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Coordination service address list, `host:port[,host:port...]`.
    #[serde(default = "default_connect_string")]
    pub connect_string: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            member_prefix: default_member_prefix(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_string: default_connect_string(),
        }
    }
}

impl GroupConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).context(ParseTomlSnafu { path: PathBuf::from("<inline>") })
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = validate_path(&self.root_path) {
            return Err(ConfigError::InvalidValue {
                key: "root_path".into(),
                value: self.root_path.clone(),
                reason: e.to_string(),
            });
        }

        if self.member_prefix.is_empty() || self.member_prefix.contains('/') {
            return Err(ConfigError::InvalidValue {
                key: "member_prefix".into(),
                value: self.member_prefix.clone(),
                reason: "must be non-empty and must not contain '/'".into(),
            });
        }

        if !(MIN_SESSION_TIMEOUT_MS..=MAX_SESSION_TIMEOUT_MS).contains(&self.session_timeout_ms) {
            return Err(ConfigError::InvalidValue {
                key: "session_timeout_ms".into(),
                value: self.session_timeout_ms.to_string(),
                reason: format!("must be between {MIN_SESSION_TIMEOUT_MS} and {MAX_SESSION_TIMEOUT_MS}"),
            });
        }

        if self.connect_string.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "connect_string".into(),
                value: self.connect_string.clone(),
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }

    /// Path of the group backing `namespace` of `cluster_id`.
    pub fn group_path(&self, cluster_id: &str, namespace: &str) -> String {
        let root = self.root_path.trim_end_matches('/');
        format!("{root}/{cluster_id}/{namespace}")
    }
}

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.into()
}

fn default_member_prefix() -> String {
    DEFAULT_MEMBER_PREFIX.into()
}

fn default_session_timeout_ms() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MS
}

fn default_connect_string() -> String {
    DEFAULT_CONNECT_STRING.into()
}

/// Configuration loading and validation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// The file could not be read.
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// The I/O failure.
        source: std::io::Error,
    },

    /// The file is not valid TOML for the expected schema.
    #[snafu(display("failed to parse TOML config {}: {source}", path.display()))]
    ParseToml {
        /// File that was parsed.
        path: PathBuf,
        /// The parser failure.
        source: toml::de::Error,
    },

    /// A value is out of range or malformed.
    #[snafu(display("invalid configuration for {key}: '{value}' ({reason})"))]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = GroupConfig::from_toml_str("").unwrap();
        assert_eq!(config, GroupConfig::default());
        assert_eq!(config.root_path, "/bellwether/clusters");
        assert_eq!(config.member_prefix, "member-");
        assert_eq!(config.session_timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = GroupConfig::from_toml_str("root_path = \"/apps\"\nsession_timeout_ms = 5000\n").unwrap();
        assert_eq!(config.root_path, "/apps");
        assert_eq!(config.session_timeout_ms, 5000);
        assert_eq!(config.member_prefix, "member-");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connect_string = \"zk1:2181,zk2:2181\"").unwrap();

        let config = GroupConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.connect_string, "zk1:2181,zk2:2181");
    }

    #[test]
    fn test_missing_file() {
        let err = GroupConfig::from_toml_file(Path::new("/nonexistent/bellwether.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_bad_toml() {
        let err = GroupConfig::from_toml_str("session_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
    }

    #[test]
    fn test_validation() {
        let relative = GroupConfig {
            root_path: "clusters".into(),
            ..GroupConfig::default()
        };
        assert!(matches!(relative.validate(), Err(ConfigError::InvalidValue { key, .. }) if key == "root_path"));

        let slash_prefix = GroupConfig {
            member_prefix: "a/b".into(),
            ..GroupConfig::default()
        };
        assert!(slash_prefix.validate().is_err());

        let short_timeout = GroupConfig {
            session_timeout_ms: 10,
            ..GroupConfig::default()
        };
        assert!(matches!(
            short_timeout.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "session_timeout_ms"
        ));
    }

    #[test]
    fn test_group_path() {
        let config = GroupConfig::default();
        assert_eq!(config.group_path("payments", "orders"), "/bellwether/clusters/payments/orders");

        let root = GroupConfig {
            root_path: "/".into(),
            ..GroupConfig::default()
        };
        assert_eq!(root.group_path("c", "ns"), "/c/ns");
    }
}
