use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(20);
pub const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

// Enough items to fill one page-sized release message.
pub const DEFAULT_MAX_CAPS_PER_RELEASE: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse session config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid session config: {0}")]
    Invalid(&'static str),
}

/// Tunables shared by every [`Session`](crate::Session) of a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// How long capabilities stay valid after a renewal request is acknowledged.
    #[serde(with = "secs")]
    pub session_timeout: Duration,

    /// How often the client core should ask for a capability renewal.
    #[serde(with = "secs")]
    pub renew_interval: Duration,

    /// Upper bound on release records per outgoing message.
    pub max_caps_per_release: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            max_caps_per_release: DEFAULT_MAX_CAPS_PER_RELEASE,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout.is_zero() {
            return Err(ConfigError::Invalid("session_timeout must be non-zero"));
        }

        if self.session_timeout > MAX_SESSION_TIMEOUT {
            return Err(ConfigError::Invalid("session_timeout must not exceed one day"));
        }

        if self.renew_interval >= self.session_timeout {
            return Err(ConfigError::Invalid(
                "renew_interval must be shorter than session_timeout",
            ));
        }

        if self.max_caps_per_release == 0 {
            return Err(ConfigError::Invalid("max_caps_per_release must be non-zero"));
        }

        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        f64::deserialize(de).and_then(|secs| {
            Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
        })
    }
}
