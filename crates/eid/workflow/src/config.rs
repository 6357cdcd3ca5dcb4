use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Prefix of environment variables overriding the configuration
pub const ENV_PREFIX: &str = "EID_";

/// Errors loading a [`WorkflowConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file or the environment holds invalid values
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Settings of an authentication workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Accept `http` addresses and skip the certificate description checks
    /// for them
    pub developer_mode: bool,
    /// How long a password prompt may stay unanswered
    #[serde(with = "seconds")]
    pub input_timeout: Duration,
    /// Redirect hops followed while checking the refresh address
    pub max_redirects: usize,
    /// Smallest RSA and DH key accepted on TLS connections
    pub min_rsa_key_bits: u32,
    /// Smallest elliptic curve key accepted on TLS connections
    pub min_ec_key_bits: u32,
    /// Name announced in `StartPAOS`
    pub user_agent: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            developer_mode: false,
            input_timeout: Duration::from_secs(60),
            max_redirects: 10,
            min_rsa_key_bits: 2000,
            min_ec_key_bits: 250,
            user_agent: "eID client".to_owned(),
        }
    }
}

impl WorkflowConfig {
    /// Load from a TOML file, then apply `EID_*` environment overrides
    ///
    /// A missing file leaves the defaults in place.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }

    fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Toggle developer mode
    pub const fn with_developer_mode(mut self, developer_mode: bool) -> Self {
        self.developer_mode = developer_mode;
        self
    }

    /// Set the password prompt timeout
    pub const fn with_input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout = timeout;
        self
    }

    /// Set the number of redirect hops followed
    pub const fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Set the smallest accepted RSA and DH key
    pub const fn with_min_rsa_key_bits(mut self, bits: u32) -> Self {
        self.min_rsa_key_bits = bits;
        self
    }

    /// Set the smallest accepted elliptic curve key
    pub const fn with_min_ec_key_bits(mut self, bits: u32) -> Self {
        self.min_ec_key_bits = bits;
        self
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
