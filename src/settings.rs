use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

// Every field has a default so an empty (or missing) config file still yields
// a runnable pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Interface to capture on. When absent the binary asks interactively.
    pub interface: Option<String>,
    /// Replay a pcap file instead of capturing live.
    pub replay_file: Option<String>,
    pub known_hosts_file_path: Option<String>,
    pub stats_interval_secs: u64,
    pub capture: CaptureSettings,
    pub pipeline: PipelineSettings,
    pub resolver: ResolverSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub snap_len: i32,
    pub promiscuous: bool,
    pub read_timeout_ms: i32,
    /// BPF program applied to the capture handle.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub pop_timeout_ms: u64,
    pub sink_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub negative_ttl_secs: u64,
    pub threads: usize,
    pub timeout_ms: u64,
    pub max_entries: usize,
    pub max_pending: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: "info".to_string(),
            interface: None,
            replay_file: None,
            known_hosts_file_path: None,
            stats_interval_secs: 10,
            capture: CaptureSettings::default(),
            pipeline: PipelineSettings::default(),
            resolver: ResolverSettings::default(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            snap_len: 65535,
            promiscuous: true,
            read_timeout_ms: 50,
            filter: None,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            queue_capacity: 1024,
            worker_count: 1,
            pop_timeout_ms: 100,
            sink_timeout_ms: 250,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        ResolverSettings {
            enabled: true,
            ttl_secs: 300,
            negative_ttl_secs: 30,
            threads: 2,
            timeout_ms: 2000,
            max_entries: 65_536,
            max_pending: 1024,
        }
    }
}

impl PipelineSettings {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

impl Settings {
    /// Loads `config/default.toml` (if present), then `PKTFLOW__*` environment overrides,
    /// e.g. `PKTFLOW__PIPELINE__WORKER_COUNT=4`.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(
            Config::builder().add_source(File::with_name("config/default").required(false)),
            environment(),
        )
    }

    fn load(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env: Environment,
    ) -> Result<Self, ConfigError> {
        let settings: Settings = builder
            .add_source(env)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.capture.snap_len > 0, "capture.snap_len must be positive"),
            (self.capture.read_timeout_ms > 0, "capture.read_timeout_ms must be positive"),
            (self.pipeline.queue_capacity > 0, "pipeline.queue_capacity must be at least 1"),
            (self.pipeline.worker_count > 0, "pipeline.worker_count must be at least 1"),
            (self.pipeline.pop_timeout_ms > 0, "pipeline.pop_timeout_ms must be positive"),
            (self.pipeline.sink_timeout_ms > 0, "pipeline.sink_timeout_ms must be positive"),
            (self.resolver.threads > 0, "resolver.threads must be at least 1"),
            (self.resolver.timeout_ms > 0, "resolver.timeout_ms must be positive"),
            (self.resolver.max_entries > 0, "resolver.max_entries must be at least 1"),
            (self.resolver.max_pending > 0, "resolver.max_pending must be at least 1"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(ConfigError::Message(msg.to_string())),
            None => Ok(()),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("PKTFLOW")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
