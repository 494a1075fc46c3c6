//! Channel and queue configuration.

use serde::{Deserialize, Serialize};

use crate::distributor::DistributionPolicy;
use crate::error::ConfigError;

fn default_timer_thread() -> String {
    "delivery-timer".to_string()
}

/// Settings for a [`Channel`](crate::Channel).
///
/// ```
/// use delivery_core::{ChannelConfig, DistributionPolicy};
///
/// let config = ChannelConfig::from_json(r#"{"id": "orders", "policy": "fan_out"}"#).unwrap();
/// assert_eq!(config.policy, DistributionPolicy::FanOut);
/// assert!(!config.accept_reliable);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    /// Only consulted for in-memory channels; recoverable channels always
    /// accept reliable messages.
    #[serde(default)]
    pub accept_reliable: bool,
    #[serde(default)]
    pub policy: DistributionPolicy,
    /// Name prefix of the timer thread the convenience constructors start
    /// for scheduled messages.
    #[serde(default = "default_timer_thread")]
    pub timer_thread: String,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        ChannelConfig {
            id: id.into(),
            accept_reliable: false,
            policy: DistributionPolicy::default(),
            timer_thread: default_timer_thread(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ChannelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_accept_reliable(mut self, accept_reliable: bool) -> Self {
        self.accept_reliable = accept_reliable;
        self
    }

    pub fn with_policy(mut self, policy: DistributionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timer_thread(mut self, prefix: impl Into<String>) -> Self {
        self.timer_thread = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("channel id must not be empty".into()));
        }
        if self.timer_thread.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "timer thread prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for a [`Queue`](crate::Queue).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub policy: DistributionPolicy,
    /// Name prefix of the timer thread started by
    /// [`Queue::with_thread_timer`](crate::Queue::with_thread_timer).
    #[serde(default = "default_timer_thread")]
    pub timer_thread: String,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        QueueConfig {
            name: name.into(),
            policy: DistributionPolicy::default(),
            timer_thread: default_timer_thread(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: QueueConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_policy(mut self, policy: DistributionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timer_thread(mut self, prefix: impl Into<String>) -> Self {
        self.timer_thread = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty".into()));
        }
        if self.timer_thread.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "timer thread prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}
