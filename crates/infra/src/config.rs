//! Pipeline configuration: defaults, an optional JSON layer, then `SMARTPROJ_*`
//! environment overrides.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use smartproj_core::FailureKind;
use smartproj_events::TopicPattern;
use smartproj_observability::{LogFormat, TracingConfig};

use crate::consumer::ConsumerConfig;
use crate::outbox::PublisherConfig;
use crate::query_patterns::OptimizerConfig;
use crate::retry::BackoffStrategy;
use crate::smart_config::ConfigCacheConfig;

pub const ENV_PREFIX: &str = "SMARTPROJ_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Configuration
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Postgres connection string for the outbox, read store and index catalog.
    pub database_url: Option<String>,
    /// Redis connection string; the in-memory bus is used when absent.
    pub redis_url: Option<String>,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    pub optimizer: OptimizerConfig,
    pub config_cache: ConfigCacheConfig,
    pub tracing: TracingConfig,
}

impl PipelineConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Parse a JSON layer; omitted fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides read through `lookup` (keyed by the full variable name).
    ///
    /// Values that fail to parse are logged and skipped.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env { lookup: &lookup };

        if let Some(v) = env.string("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = env.string("REDIS_URL") {
            self.redis_url = Some(v);
        }

        let p = &mut self.publisher;
        env.set_string("PUBLISHER_NAME", &mut p.name);
        env.set_parsed("PUBLISHER_BATCH_SIZE", &mut p.batch_size);
        env.set_millis("PUBLISHER_POLL_INTERVAL_MS", &mut p.poll_interval);
        env.set_secs("PUBLISHER_CLAIM_TIMEOUT_SECS", &mut p.claim_timeout);
        env.set_secs("PUBLISHER_SWEEP_INTERVAL_SECS", &mut p.sweep_interval);
        env.set_parsed("PUBLISHER_SWEEP_LIMIT", &mut p.sweep_limit);
        env.set_secs("PUBLISHER_RETENTION_SECS", &mut p.retention);
        env.set_millis("PUBLISHER_RETRY_BASE_MS", &mut p.retry.base_delay);
        env.set_millis("PUBLISHER_RETRY_MAX_MS", &mut p.retry.max_delay);
        if let Some(raw) = env.string("PUBLISHER_RETRY_STRATEGY") {
            match BackoffStrategy::parse(&raw) {
                Some(strategy) => p.retry.strategy = strategy,
                None => env.invalid("PUBLISHER_RETRY_STRATEGY", &raw),
            }
        }

        let c = &mut self.consumer;
        env.set_string("CONSUMER_GROUP", &mut c.group);
        if let Some(raw) = env.string("CONSUMER_TOPICS") {
            let topics: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if topics.is_empty() {
                env.invalid("CONSUMER_TOPICS", &raw);
            } else {
                c.topics = topics;
            }
        }
        env.set_parsed("CONSUMER_WORKERS", &mut c.workers);
        env.set_parsed("CONSUMER_QUEUE_DEPTH", &mut c.queue_depth);
        env.set_parsed("CONSUMER_AUDIT", &mut c.audit);
        env.set_millis("CONSUMER_RETRY_BASE_MS", &mut c.retry.base_delay);
        env.set_millis("CONSUMER_RETRY_MAX_MS", &mut c.retry.max_delay);

        let o = &mut self.optimizer;
        env.set_parsed("OPTIMIZER_ENABLED", &mut o.enabled);
        env.set_secs("OPTIMIZER_ANALYSIS_INTERVAL_SECS", &mut o.analysis_interval);
        env.set_parsed("OPTIMIZER_CHANNEL_CAPACITY", &mut o.channel_capacity);
        env.set_parsed("OPTIMIZER_DECAY_FACTOR", &mut o.decay_factor);
        env.set_parsed("OPTIMIZER_MAX_PATTERNS", &mut o.max_patterns_per_collection);

        env.set_secs("CONFIG_CACHE_TTL_SECS", &mut self.config_cache.ttl);

        if let Some(raw) = env.string("LOG_FORMAT") {
            match LogFormat::parse(&raw) {
                Some(format) => self.tracing.format = format,
                None => env.invalid("LOG_FORMAT", &raw),
            }
        }
        env.set_string("LOG_FILTER", &mut self.tracing.filter);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.publisher.batch_size == 0 {
            return invalid("publisher.batch_size must be greater than zero");
        }
        if self.publisher.poll_interval.is_zero() {
            return invalid("publisher.poll_interval must be greater than zero");
        }
        if self.publisher.claim_timeout.is_zero() {
            return invalid("publisher.claim_timeout must be greater than zero");
        }
        if self.publisher.retry.max_delay < self.publisher.retry.base_delay {
            return invalid("publisher.retry.max_delay must not be below base_delay");
        }
        if self.consumer.workers == 0 {
            return invalid("consumer.workers must be greater than zero");
        }
        if self.consumer.queue_depth == 0 {
            return invalid("consumer.queue_depth must be greater than zero");
        }
        if self.consumer.group.trim().is_empty() {
            return invalid("consumer.group must not be empty");
        }
        if self.consumer.topics.is_empty() {
            return invalid("consumer.topics must name at least one pattern");
        }
        for raw in &self.consumer.topics {
            if TopicPattern::new(raw.as_str()).is_err() {
                return Err(ConfigError::Invalid(format!("consumer.topics: invalid pattern '{raw}'")));
            }
        }
        if self.optimizer.channel_capacity == 0 {
            return invalid("optimizer.channel_capacity must be greater than zero");
        }
        if !(self.optimizer.decay_factor > 0.0 && self.optimizer.decay_factor <= 1.0) {
            return invalid("optimizer.decay_factor must be in (0, 1]");
        }
        if self.optimizer.enabled && self.optimizer.analysis_interval.is_zero() {
            return invalid("optimizer.analysis_interval must be greater than zero");
        }
        Ok(())
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn invalid(&self, name: &str, raw: &str) {
        warn!(variable = %format!("{ENV_PREFIX}{name}"), value = raw, "ignoring invalid environment override");
    }

    fn set_string(&self, name: &str, target: &mut String) {
        if let Some(v) = self.string(name) {
            *target = v;
        }
    }

    fn set_parsed<T: std::str::FromStr>(&self, name: &str, target: &mut T) {
        if let Some(raw) = self.string(name) {
            match raw.parse() {
                Ok(v) => *target = v,
                Err(_) => self.invalid(name, &raw),
            }
        }
    }

    fn set_secs(&self, name: &str, target: &mut Duration) {
        let mut secs = target.as_secs();
        if self.string(name).is_some() {
            self.set_parsed(name, &mut secs);
            *target = Duration::from_secs(secs);
        }
    }

    fn set_millis(&self, name: &str, target: &mut Duration) {
        let mut millis = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
        if self.string(name).is_some() {
            self.set_parsed(name, &mut millis);
            *target = Duration::from_millis(millis);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_apply_per_section() {
        let mut config = PipelineConfig::default();
        config.apply_env_from(env(&[
            ("SMARTPROJ_DATABASE_URL", "postgres://localhost/proj"),
            ("SMARTPROJ_PUBLISHER_BATCH_SIZE", "25"),
            ("SMARTPROJ_PUBLISHER_RETRY_STRATEGY", "linear"),
            ("SMARTPROJ_CONSUMER_WORKERS", "8"),
            ("SMARTPROJ_CONSUMER_TOPICS", "domain.sales.#, domain.parties.*"),
            ("SMARTPROJ_OPTIMIZER_ANALYSIS_INTERVAL_SECS", "120"),
            ("SMARTPROJ_CONFIG_CACHE_TTL_SECS", "10"),
            ("SMARTPROJ_LOG_FORMAT", "pretty"),
        ]));

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/proj"));
        assert_eq!(config.publisher.batch_size, 25);
        assert_eq!(config.publisher.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.consumer.workers, 8);
        assert_eq!(config.consumer.topics, vec!["domain.sales.#", "domain.parties.*"]);
        assert_eq!(config.optimizer.analysis_interval, Duration::from_secs(120));
        assert_eq!(config.config_cache.ttl, Duration::from_secs(10));
        assert_eq!(config.tracing.format, LogFormat::Pretty);
        config.validate().unwrap();
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = PipelineConfig::default();
        config.apply_env_from(env(&[
            ("SMARTPROJ_CONSUMER_WORKERS", "many"),
            ("SMARTPROJ_OPTIMIZER_ANALYSIS_INTERVAL_SECS", "-5"),
            ("SMARTPROJ_LOG_FORMAT", "xml"),
            ("SMARTPROJ_CONSUMER_TOPICS", " , "),
        ]));

        let defaults = PipelineConfig::default();
        assert_eq!(config.consumer.workers, defaults.consumer.workers);
        assert_eq!(config.optimizer.analysis_interval, defaults.optimizer.analysis_interval);
        assert_eq!(config.tracing.format, defaults.tracing.format);
        assert_eq!(config.consumer.topics, defaults.consumer.topics);
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut config = PipelineConfig::default();
        config.consumer.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PipelineConfig::default();
        config.publisher.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.optimizer.decay_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.consumer.topics = vec!["a.#.b".to_string()];
        assert_eq!(config.validate().unwrap_err().kind(), FailureKind::Configuration);
    }

    #[test]
    fn json_layer_keeps_defaults_for_missing_fields() {
        let config = PipelineConfig::from_json(
            r#"{"consumer": {"workers": 2, "group": "read-models"}, "optimizer": {"enabled": false}}"#,
        )
        .unwrap();
        assert_eq!(config.consumer.workers, 2);
        assert_eq!(config.consumer.group, "read-models");
        assert_eq!(config.consumer.queue_depth, ConsumerConfig::default().queue_depth);
        assert!(!config.optimizer.enabled);
        assert_eq!(config.publisher, PublisherConfig::default());
    }
}
