//! Node configuration.
//!
//! Loaded in layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML configuration file
//! 3. Environment variables (BELLWETHER_*)
//! 4. Command-line arguments (applied by the binary)

use std::path::Path;
use std::path::PathBuf;

use bellwether_cluster::validate_namespace;
use bellwether_group::GroupConfig;
use bellwether_group::config::ConfigError;
use bellwether_group::config::ParseTomlSnafu;
use bellwether_group::config::ReadFileSnafu;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use uuid::Uuid;

/// Environment variable overriding [`NodeConfig::cluster_id`].
pub const ENV_CLUSTER_ID: &str = "BELLWETHER_CLUSTER_ID";
/// Environment variable overriding [`NodeConfig::member_id`].
pub const ENV_MEMBER_ID: &str = "BELLWETHER_MEMBER_ID";
/// Environment variable overriding [`NodeConfig::namespace`].
pub const ENV_NAMESPACE: &str = "BELLWETHER_NAMESPACE";
/// Environment variable overriding [`GroupConfig::root_path`].
pub const ENV_ROOT_PATH: &str = "BELLWETHER_ROOT_PATH";
/// Environment variable overriding [`GroupConfig::session_timeout_ms`].
pub const ENV_SESSION_TIMEOUT_MS: &str = "BELLWETHER_SESSION_TIMEOUT_MS";
/// Environment variable overriding [`GroupConfig::connect_string`].
pub const ENV_CONNECT_STRING: &str = "BELLWETHER_CONNECT_STRING";

/// Identity and election settings of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster this node belongs to.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Member identity advertised in the group.
    #[serde(default = "default_member_id")]
    pub member_id: String,

    /// Election namespace workloads are gated on.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Group backend layout.
    #[serde(default)]
    pub group: GroupConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            member_id: default_member_id(),
            namespace: default_namespace(),
            group: GroupConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).context(ParseTomlSnafu {
            path: PathBuf::from("<inline>"),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load from `path` if given, otherwise start from defaults, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `BELLWETHER_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`, keyed by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_CLUSTER_ID) {
            self.cluster_id = value;
        }
        if let Some(value) = lookup(ENV_MEMBER_ID) {
            self.member_id = value;
        }
        if let Some(value) = lookup(ENV_NAMESPACE) {
            self.namespace = value;
        }
        if let Some(value) = lookup(ENV_ROOT_PATH) {
            self.group.root_path = value;
        }
        if let Some(value) = lookup(ENV_CONNECT_STRING) {
            self.group.connect_string = value;
        }
        if let Some(value) = lookup(ENV_SESSION_TIMEOUT_MS) {
            self.group.session_timeout_ms = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_SESSION_TIMEOUT_MS.into(),
                value: value.clone(),
                reason: "must be an integer number of milliseconds".into(),
            })?;
        }
        Ok(())
    }

    /// Check every field, including the group layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_segment("cluster_id", &self.cluster_id)?;

        if self.member_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "member_id".into(),
                value: self.member_id.clone(),
                reason: "must not be empty".into(),
            });
        }

        if let Err(e) = validate_namespace(&self.namespace) {
            return Err(ConfigError::InvalidValue {
                key: "namespace".into(),
                value: self.namespace.clone(),
                reason: e.to_string(),
            });
        }

        self.group.validate()
    }

    /// Coordination path of the group backing this node's namespace.
    pub fn group_path(&self) -> String {
        self.group.group_path(&self.cluster_id, &self.namespace)
    }
}

fn check_segment(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: "must be a non-empty path segment without '/' or whitespace".into(),
        });
    }
    Ok(())
}

fn default_cluster_id() -> String {
    "default".into()
}

/// Random per process, so unconfigured nodes on different hosts never share
/// an id.
fn default_member_id() -> String {
    format!("node-{}", Uuid::new_v4().simple())
}

fn default_namespace() -> String {
    "default".into()
}
