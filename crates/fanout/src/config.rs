use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::retry::Backoff;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tuning knobs for one fan-out instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Names this instance's consumer group (`fanout-<instance_id>`) and its members.
    pub instance_id: String,
    pub consumer_loops: usize,
    pub batch_size: usize,
    pub block_timeout: Duration,
    /// Pending entries idle this long are redelivered to another member.
    pub visibility_timeout: Duration,
    /// Deliveries after which an entry is dead-lettered instead of retried.
    pub max_deliveries: u32,
    pub subscriber_queue_capacity: usize,
    pub hub_shards: usize,
    pub dedup_ttl: Duration,
    pub cursor_ttl: Duration,
    pub offline_counter_ttl: Duration,
    /// Retention of each conversation log, in entries.
    pub conversation_max_len: usize,
    pub conversation_trim_every: u64,
    /// Retention of the fan-out log.
    pub fanout_max_age: Duration,
    pub session_idle_timeout: Duration,
    pub backlog_page_size: usize,
    pub backoff: Backoff,
    pub store_retry_attempts: u32,
    pub maintenance_interval: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().simple().to_string(),
            consumer_loops: 2,
            batch_size: 10,
            block_timeout: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            max_deliveries: 5,
            subscriber_queue_capacity: 256,
            hub_shards: 16,
            dedup_ttl: Duration::from_secs(10 * 60),
            cursor_ttl: 30 * DAY,
            offline_counter_ttl: DAY,
            conversation_max_len: 50_000,
            conversation_trim_every: 100,
            fanout_max_age: DAY,
            session_idle_timeout: Duration::from_secs(5 * 60),
            backlog_page_size: 200,
            backoff: Backoff {
                initial: Duration::from_millis(50),
                max: Duration::from_secs(5),
            },
            store_retry_attempts: 5,
            maintenance_interval: HOUR,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("instance id must be non-empty and contain no whitespace")]
    InstanceId,
    #[error(
        "dedup ttl {dedup_ttl:?} must exceed visibility timeout x max deliveries ({redelivery_window:?})"
    )]
    DedupWindow {
        dedup_ttl: Duration,
        redelivery_window: Duration,
    },
    #[error("backoff initial delay {initial:?} exceeds its maximum {max:?}")]
    Backoff { initial: Duration, max: Duration },
}

impl FanoutConfig {
    pub fn group_name(&self) -> String {
        format!("fanout-{}", self.instance_id)
    }

    pub fn member_name(&self, index: usize) -> String {
        format!("{}-{index}", self.instance_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.is_empty() || self.instance_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::InstanceId);
        }
        let counts = [
            ("consumer_loops", self.consumer_loops),
            ("batch_size", self.batch_size),
            ("subscriber_queue_capacity", self.subscriber_queue_capacity),
            ("hub_shards", self.hub_shards),
            ("conversation_max_len", self.conversation_max_len),
            ("backlog_page_size", self.backlog_page_size),
        ];
        if let Some((field, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*field));
        }
        if self.max_deliveries == 0 {
            return Err(ConfigError::Zero("max_deliveries"));
        }
        if self.conversation_trim_every == 0 {
            return Err(ConfigError::Zero("conversation_trim_every"));
        }
        let durations = [
            ("visibility_timeout", self.visibility_timeout),
            ("dedup_ttl", self.dedup_ttl),
            ("cursor_ttl", self.cursor_ttl),
            ("offline_counter_ttl", self.offline_counter_ttl),
            ("fanout_max_age", self.fanout_max_age),
            ("session_idle_timeout", self.session_idle_timeout),
            ("maintenance_interval", self.maintenance_interval),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Zero(*field));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::Backoff {
                initial: self.backoff.initial,
                max: self.backoff.max,
            });
        }

        let redelivery_window = self.visibility_timeout.saturating_mul(self.max_deliveries);
        if self.dedup_ttl <= redelivery_window {
            return Err(ConfigError::DedupWindow {
                dedup_ttl: self.dedup_ttl,
                redelivery_window,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        FanoutConfig::default().validate().expect("defaults");
    }

    #[test]
    fn dedup_ttl_must_cover_every_redelivery() {
        let config = FanoutConfig {
            visibility_timeout: Duration::from_secs(30),
            max_deliveries: 5,
            dedup_ttl: Duration::from_secs(150),
            ..FanoutConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::DedupWindow {
                dedup_ttl: Duration::from_secs(150),
                redelivery_window: Duration::from_secs(150),
            })
        );
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = FanoutConfig {
            batch_size: 0,
            ..FanoutConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("batch_size")));

        let config = FanoutConfig {
            visibility_timeout: Duration::ZERO,
            ..FanoutConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("visibility_timeout")));
    }

    #[test]
    fn instance_id_names_group_and_members() {
        let config = FanoutConfig {
            instance_id: "edge-1".into(),
            ..FanoutConfig::default()
        };
        assert_eq!(config.group_name(), "fanout-edge-1");
        assert_eq!(config.member_name(2), "edge-1-2");

        let config = FanoutConfig {
            instance_id: "edge 1".into(),
            ..FanoutConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InstanceId));
    }
}
