//! Configuration management for the token gate.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{GuardError, Result};

/// Minimum accepted salt length in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// Environment prefix used by [`GuardConfig::load`].
const ENV_PREFIX: &str = "TOKEN_GATE";

/// Main configuration for the token gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Key material and token lookup
    #[serde(default)]
    pub auth: AuthConfig,

    /// Admission limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Key derivation and token lookup configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Password the token key is derived from
    #[serde(default)]
    pub password: String,

    /// Salt for key derivation, at least 16 bytes
    #[serde(default)]
    pub salt: String,

    /// Query/cookie parameter name searched for a token
    #[serde(default = "default_param")]
    pub param: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            salt: String::new(),
            param: default_param(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("password", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("param", &self.param)
            .finish()
    }
}

fn default_param() -> String {
    "token".to_string()
}

/// Admission limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Number of stateless instances sharing one logical rate budget.
    /// Every interval is multiplied by this value.
    #[serde(default = "default_nodes")]
    pub nodes: u32,

    /// Maximum estimated queue wait in milliseconds before new requests
    /// are rejected outright. `None` disables the check.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            timeout_ms: None,
        }
    }
}

fn default_nodes() -> u32 {
    1
}

impl LimiterConfig {
    /// Check the limiter settings.
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(GuardError::Config(
                "the node count multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl AuthConfig {
    /// Create an auth configuration from a password and salt.
    pub fn new(password: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            salt: salt.into(),
            param: default_param(),
        }
    }

    /// Check that usable key material is present.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(GuardError::Config(
                "unable to initialize without a password".to_string(),
            ));
        }
        if self.salt.is_empty() {
            return Err(GuardError::Config(
                "unable to initialize without a password salt".to_string(),
            ));
        }
        if self.salt.len() < MIN_SALT_LEN {
            return Err(GuardError::Config(format!(
                "the given salt is too short ({} bytes), use at least {} bytes",
                self.salt.len(),
                MIN_SALT_LEN
            )));
        }
        if self.param.trim().is_empty() {
            return Err(GuardError::Config(
                "the token parameter name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl GuardConfig {
    /// Create a configuration with the given key material and default limiter settings.
    pub fn new(password: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            auth: AuthConfig::new(password, salt),
            limiter: LimiterConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.auth.validate()?;
        self.limiter.validate()
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file, overridden by
    /// `TOKEN_GATE__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<GuardConfig>())
            .map_err(|e| GuardError::Config(format!("Failed to load configuration: {}", e)))
    }
}
