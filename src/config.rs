use crate::error::{ExporterError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\??([^}:-]+)(?::-([^}]*))?\}").expect("env var pattern is a valid regex")
});

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub exporter: ExporterConfig,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_http_host")]
    pub http_host: String,
    /// Number of topics collected concurrently within one cycle.
    #[serde(default = "default_max_concurrent_topics")]
    pub max_concurrent_topics: usize,
    /// Capacity of the per-cycle metric sample channel.
    #[serde(default = "default_metric_channel_capacity")]
    pub metric_channel_capacity: usize,
}

/// One RocketMQ deployment, reached through its name servers.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub name: String,
    /// Semicolon separated `host:port` list, as accepted by RocketMQ clients.
    pub namesrv_addr: String,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Consumer group name sent with latency probe pulls.
    #[serde(default = "default_probe_group")]
    pub probe_group: String,
    #[serde(default = "default_whitelist")]
    pub group_whitelist: Vec<String>,
    #[serde(default)]
    pub group_blacklist: Vec<String>,
    #[serde(default = "default_whitelist")]
    pub topic_whitelist: Vec<String>,
    #[serde(default)]
    pub topic_blacklist: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_http_port() -> u16 {
    5557
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_concurrent_topics() -> usize {
    8
}

fn default_metric_channel_capacity() -> usize {
    1024
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_probe_group() -> String {
    "rocketmq-exporter-probe".to_string()
}

fn default_whitelist() -> Vec<String> {
    vec![".*".to_string()]
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Config> {
        let config_path = path.unwrap_or("config.toml");

        if !Path::new(config_path).exists() {
            return Err(ExporterError::Config(format!(
                "Configuration file not found: {config_path}"
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let content = Self::substitute_env_vars(&content);

        let config: Config = toml::from_str(&content)
            .map_err(|e| ExporterError::Config(format!("TOML parse error: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn substitute_env_vars(content: &str) -> String {
        // ${VAR}, ${?VAR} and ${VAR:-default}
        ENV_VAR_PATTERN
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map_or("", |m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            })
            .to_string()
    }

    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(ExporterError::Config(
                "At least one target must be configured".to_string(),
            ));
        }

        if self.exporter.max_concurrent_topics == 0 {
            return Err(ExporterError::Config(
                "max_concurrent_topics must be greater than zero".to_string(),
            ));
        }

        if self.exporter.metric_channel_capacity == 0 {
            return Err(ExporterError::Config(
                "metric_channel_capacity must be greater than zero".to_string(),
            ));
        }

        for target in &self.targets {
            target.validate()?;
        }

        Ok(())
    }
}

impl TargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ExporterError::Config(
                "Target name cannot be empty".to_string(),
            ));
        }

        if self.namesrv_addrs().is_empty() {
            return Err(ExporterError::Config(format!(
                "Target '{}': namesrv_addr cannot be empty",
                self.name
            )));
        }

        self.compile_filters()?;
        Ok(())
    }

    pub fn namesrv_addrs(&self) -> Vec<String> {
        self.namesrv_addr
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn compile_filters(&self) -> Result<CompiledFilters> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<std::result::Result<Vec<_>, _>>()
        };

        Ok(CompiledFilters {
            group_whitelist: compile(&self.group_whitelist)?,
            group_blacklist: compile(&self.group_blacklist)?,
            topic_whitelist: compile(&self.topic_whitelist)?,
            topic_blacklist: compile(&self.topic_blacklist)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFilters {
    pub group_whitelist: Vec<Regex>,
    pub group_blacklist: Vec<Regex>,
    pub topic_whitelist: Vec<Regex>,
    pub topic_blacklist: Vec<Regex>,
}

impl CompiledFilters {
    pub fn matches_group(&self, group: &str) -> bool {
        let matches_whitelist = self.group_whitelist.iter().any(|r| r.is_match(group));
        let matches_blacklist = self.group_blacklist.iter().any(|r| r.is_match(group));
        matches_whitelist && !matches_blacklist
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        let matches_whitelist = self.topic_whitelist.iter().any(|r| r.is_match(topic));
        let matches_blacklist = self.topic_blacklist.iter().any(|r| r.is_match(topic));
        matches_whitelist && !matches_blacklist
    }
}
