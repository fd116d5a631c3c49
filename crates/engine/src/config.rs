//! Coordinator configuration via `txscope.toml`
//!
//! All fields have defaults, so an empty file (or no file) is a valid
//! configuration. Values are validated eagerly when loaded.

use serde::{Deserialize, Serialize};
use std::path::Path;
use txscope_core::{CreatorTag, IsolationLevel, TxError, TxResult};

/// Config file name
pub const CONFIG_FILE_NAME: &str = "txscope.toml";

/// Coordinator configuration loaded from `txscope.toml`.
///
/// # Example
///
/// ```toml
/// creator_tag = "txscope"
/// host_interop = true
/// default_isolation = "default"
/// strict_end_calls = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Propagation domain; coordinators with different tags never share transactions.
    #[serde(default = "default_creator_tag")]
    pub creator_tag: String,
    /// Consult the host transaction manager before acquiring a connection.
    #[serde(default = "default_host_interop")]
    pub host_interop: bool,
    /// Isolation level applied when a begin asks for `default`.
    #[serde(default)]
    pub default_isolation: IsolationLevel,
    /// Reject end calls without a matching begin instead of logging them.
    #[serde(default)]
    pub strict_end_calls: bool,
}

fn default_creator_tag() -> String {
    CreatorTag::DEFAULT.to_string()
}

fn default_host_interop() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            creator_tag: default_creator_tag(),
            host_interop: default_host_interop(),
            default_isolation: IsolationLevel::Default,
            strict_end_calls: false,
        }
    }
}

impl CoordinatorConfig {
    /// Set the creator tag
    pub fn with_creator_tag(mut self, tag: impl Into<String>) -> Self {
        self.creator_tag = tag.into();
        self
    }

    /// Enable or disable host interop
    pub fn with_host_interop(mut self, enabled: bool) -> Self {
        self.host_interop = enabled;
        self
    }

    /// Set the isolation level used for `default` begins
    pub fn with_default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    /// Enable or disable strict end calls
    pub fn with_strict_end_calls(mut self, strict: bool) -> Self {
        self.strict_end_calls = strict;
        self
    }

    /// Creator tag as a registry key component
    pub fn creator(&self) -> CreatorTag {
        CreatorTag::new(&self.creator_tag)
    }

    /// Check field values.
    ///
    /// # Errors
    ///
    /// Returns a config error if the creator tag is empty or contains whitespace.
    pub fn validate(&self) -> TxResult<()> {
        if self.creator_tag.is_empty() {
            return Err(TxError::config("creator_tag must not be empty"));
        }
        if self.creator_tag.chars().any(char::is_whitespace) {
            return Err(TxError::config(format!(
                "creator_tag '{}' must not contain whitespace",
                self.creator_tag
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# txscope coordinator configuration
#
# Propagation domain. Coordinators with different tags never share a
# transaction, even for the same resource on the same thread.
creator_tag = "txscope"

# Reuse a connection already managed by the host transaction manager
# instead of acquiring a new one (default: true).
host_interop = true

# Isolation level for begins that do not ask for one:
# "default" (leave the connection alone), "read_uncommitted",
# "read_committed", "repeatable_read" or "serializable".
default_isolation = "default"

# Reject commit/rollback calls that have no matching begin instead of
# logging and ignoring them (default: false).
strict_end_calls = false
"#
    }

    /// Parse and validate config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a config error if the text cannot be parsed or fails validation.
    pub fn from_toml_str(content: &str) -> TxResult<Self> {
        let config: CoordinatorConfig = toml::from_str(content)
            .map_err(|e| TxError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns a config error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> TxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TxError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| {
            TxError::config(format!("Invalid config file '{}': {}", path.display(), e))
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> TxResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                TxError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TxResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TxError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            TxError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
