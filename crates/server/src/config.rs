use std::{fs, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use fanout::{Backoff, FanoutConfig};
use storage::{FanoutStore, MemoryStore, SqliteStore};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_bind: String,
    pub store: StoreBackend,
    pub database_url: String,
    /// Random per process when unset, so each process owns a fresh consumer group.
    pub instance_id: Option<String>,
    pub max_body_bytes: usize,
    pub consumer_loops: usize,
    pub batch_size: usize,
    pub block_timeout_ms: u64,
    pub visibility_timeout_ms: u64,
    pub max_deliveries: u32,
    pub subscriber_queue_capacity: usize,
    pub hub_shards: usize,
    pub dedup_ttl_secs: u64,
    pub cursor_ttl_secs: u64,
    pub offline_counter_ttl_secs: u64,
    pub conversation_max_len: usize,
    pub conversation_trim_every: u64,
    pub fanout_max_age_secs: u64,
    pub session_idle_timeout_secs: u64,
    pub backlog_page_size: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub store_retry_attempts: u32,
    pub maintenance_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let fanout = FanoutConfig::default();
        Self {
            server_bind: "127.0.0.1:8443".into(),
            store: StoreBackend::Sqlite,
            database_url: "sqlite://./data/server.db".into(),
            instance_id: None,
            max_body_bytes: 256 * 1024,
            consumer_loops: fanout.consumer_loops,
            batch_size: fanout.batch_size,
            block_timeout_ms: millis(fanout.block_timeout),
            visibility_timeout_ms: millis(fanout.visibility_timeout),
            max_deliveries: fanout.max_deliveries,
            subscriber_queue_capacity: fanout.subscriber_queue_capacity,
            hub_shards: fanout.hub_shards,
            dedup_ttl_secs: fanout.dedup_ttl.as_secs(),
            cursor_ttl_secs: fanout.cursor_ttl.as_secs(),
            offline_counter_ttl_secs: fanout.offline_counter_ttl.as_secs(),
            conversation_max_len: fanout.conversation_max_len,
            conversation_trim_every: fanout.conversation_trim_every,
            fanout_max_age_secs: fanout.fanout_max_age.as_secs(),
            session_idle_timeout_secs: fanout.session_idle_timeout.as_secs(),
            backlog_page_size: fanout.backlog_page_size,
            backoff_initial_ms: millis(fanout.backoff.initial),
            backoff_max_ms: millis(fanout.backoff.max),
            store_retry_attempts: fanout.store_retry_attempts,
            maintenance_interval_secs: fanout.maintenance_interval.as_secs(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Short environment names accepted next to `APP__<KEY>`.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("SERVER_BIND", "bind_addr"),
    ("DATABASE_URL", "database_url"),
    ("FANOUT_STORE", "store"),
    ("INSTANCE_ID", "instance_id"),
];

impl Settings {
    /// Applies one `key = value` pair. Unknown keys and unparsable values are reported,
    /// not fatal.
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("invalid value '{value}' for {key}"))
        }

        match key {
            "bind_addr" | "server_bind" => self.server_bind = value.to_string(),
            "store" => self.store = value.parse()?,
            "database_url" => self.database_url = value.to_string(),
            "instance_id" => self.instance_id = Some(value.trim().to_string()),
            "max_body_bytes" => self.max_body_bytes = parse(key, value)?,
            "consumer_loops" => self.consumer_loops = parse(key, value)?,
            "batch_size" => self.batch_size = parse(key, value)?,
            "block_timeout_ms" => self.block_timeout_ms = parse(key, value)?,
            "visibility_timeout_ms" => self.visibility_timeout_ms = parse(key, value)?,
            "max_deliveries" => self.max_deliveries = parse(key, value)?,
            "subscriber_queue_capacity" => self.subscriber_queue_capacity = parse(key, value)?,
            "hub_shards" => self.hub_shards = parse(key, value)?,
            "dedup_ttl_secs" => self.dedup_ttl_secs = parse(key, value)?,
            "cursor_ttl_secs" => self.cursor_ttl_secs = parse(key, value)?,
            "offline_counter_ttl_secs" => self.offline_counter_ttl_secs = parse(key, value)?,
            "conversation_max_len" => self.conversation_max_len = parse(key, value)?,
            "conversation_trim_every" => self.conversation_trim_every = parse(key, value)?,
            "fanout_max_age_secs" => self.fanout_max_age_secs = parse(key, value)?,
            "session_idle_timeout_secs" => self.session_idle_timeout_secs = parse(key, value)?,
            "backlog_page_size" => self.backlog_page_size = parse(key, value)?,
            "backoff_initial_ms" => self.backoff_initial_ms = parse(key, value)?,
            "backoff_max_ms" => self.backoff_max_ms = parse(key, value)?,
            "store_retry_attempts" => self.store_retry_attempts = parse(key, value)?,
            "maintenance_interval_secs" => self.maintenance_interval_secs = parse(key, value)?,
            other => return Err(format!("unknown setting '{other}'")),
        }
        Ok(())
    }

    pub fn fanout_config(&self) -> FanoutConfig {
        let defaults = FanoutConfig::default();
        FanoutConfig {
            instance_id: self
                .instance_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or(defaults.instance_id),
            consumer_loops: self.consumer_loops,
            batch_size: self.batch_size,
            block_timeout: Duration::from_millis(self.block_timeout_ms),
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
            max_deliveries: self.max_deliveries,
            subscriber_queue_capacity: self.subscriber_queue_capacity,
            hub_shards: self.hub_shards,
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            cursor_ttl: Duration::from_secs(self.cursor_ttl_secs),
            offline_counter_ttl: Duration::from_secs(self.offline_counter_ttl_secs),
            conversation_max_len: self.conversation_max_len,
            conversation_trim_every: self.conversation_trim_every,
            fanout_max_age: Duration::from_secs(self.fanout_max_age_secs),
            session_idle_timeout: Duration::from_secs(self.session_idle_timeout_secs),
            backlog_page_size: self.backlog_page_size,
            backoff: Backoff {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
            store_retry_attempts: self.store_retry_attempts,
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
        }
    }
}

/// Defaults, then `server.toml` in the working directory, then the environment.
pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    load_settings_from(file.as_deref(), std::env::vars())
}

pub(crate) fn load_settings_from(
    file: Option<&str>,
    env: impl IntoIterator<Item = (String, String)>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<toml::Table>(raw) {
            Ok(table) => {
                for (key, value) in table {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    if let Err(reason) = settings.apply(&key, &value) {
                        warn!(%reason, "ignoring server.toml entry");
                    }
                }
            }
            Err(error) => warn!(%error, "ignoring unparsable server.toml"),
        }
    }

    let mut aliased = Vec::new();
    let mut prefixed = Vec::new();
    for (name, value) in env {
        if let Some(key) = name.strip_prefix("APP__") {
            prefixed.push((key.to_ascii_lowercase(), value));
        } else if let Some((_, key)) = ENV_ALIASES.iter().find(|(alias, _)| *alias == name) {
            aliased.push((key.to_string(), value));
        }
    }
    // APP__ names win over the short aliases
    for (key, value) in aliased.into_iter().chain(prefixed) {
        if let Err(reason) = settings.apply(&key, &value) {
            warn!(%reason, "ignoring environment override");
        }
    }

    settings
}

pub async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn FanoutStore>> {
    match settings.store {
        StoreBackend::Memory => {
            info!("using in-memory store; state is lost on exit and not shared between processes");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let database_url = normalize_database_url(&settings.database_url);
            let store = SqliteStore::new(&database_url).await.with_context(|| {
                format!(
                    "failed to open SQLite database '{database_url}'; verify parent directory exists and permissions are correct"
                )
            })?;
            info!(%database_url, "using SQLite store");
            Ok(Arc::new(store))
        }
    }
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
