//! Gateway configuration: reader list plus protocol and worker timing.
//!
//! Values come from the environment (with `.env` support), the reader list
//! optionally from a TOML file named by `GATEWAY_CONFIG`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    /// Reader names in slot order; slot 0 is the proxy slot and is not listed.
    pub readers: Vec<String>,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
}

/// Timing of the ack/result protocol.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long one ack poll waits before the liveness check runs
    pub ack_poll_interval: Duration,
    /// Upper bound for the whole ack stage, replacements included
    pub ack_deadline: Duration,
    /// Result bound for full command execution
    pub command_timeout: Duration,
    /// Result bound for lightweight metadata queries
    pub query_timeout: Duration,
    /// How long shutdown waits for workers to drain
    pub shutdown_grace: Duration,
}

/// Self-retirement limits of a worker generation.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_uptime: Duration,
    pub max_runs: u64,
    /// How often an idle worker re-checks its retirement limits
    pub reaction_time: Duration,
}

/// Longest bound accepted for any protocol timeout.
pub const MAX_BOUND: Duration = Duration::from_secs(7 * 24 * 3600);

impl DispatchConfig {
    /// Reject timings that would busy-poll or push deadlines past any useful horizon.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_poll_interval.is_zero() {
            return Err(anyhow::anyhow!("GATEWAY_ACK_POLL_MS must be at least 1"));
        }
        for (key, value) in [
            ("GATEWAY_ACK_DEADLINE_SECS", self.ack_deadline),
            ("GATEWAY_COMMAND_TIMEOUT_SECS", self.command_timeout),
            ("GATEWAY_QUERY_TIMEOUT_SECS", self.query_timeout),
            ("GATEWAY_SHUTDOWN_GRACE_MS", self.shutdown_grace),
            ("GATEWAY_ACK_POLL_MS", self.ack_poll_interval),
        ] {
            if value > MAX_BOUND {
                return Err(anyhow::anyhow!(
                    "{key} is {value:?}, above the {MAX_BOUND:?} limit"
                ));
            }
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_poll_interval: Duration::from_millis(100),
            ack_deadline: Duration::from_secs(200),
            command_timeout: Duration::from_secs(200),
            query_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(2000),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_uptime: Duration::from_secs(600),
            max_runs: 800,
            reaction_time: Duration::from_millis(5000),
        }
    }
}

/// Reader list as read from a `GATEWAY_CONFIG` TOML file.
#[derive(Debug, Deserialize)]
struct ReaderFile {
    readers: Vec<String>,
}

impl Config {
    pub fn new(readers: Vec<String>) -> Self {
        Self {
            readers,
            dispatch: DispatchConfig::default(),
            worker: WorkerConfig::default(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let readers = match std::env::var("GATEWAY_CONFIG") {
            Ok(path) => readers_from_file(Path::new(&path))?,
            Err(_) => env_csv("GATEWAY_READERS", &[]),
        };

        let command_timeout =
            Duration::from_secs(env_parse("GATEWAY_COMMAND_TIMEOUT_SECS", 200)?);

        let dispatch = DispatchConfig {
            ack_poll_interval: Duration::from_millis(env_parse("GATEWAY_ACK_POLL_MS", 100)?),
            ack_deadline: Duration::from_secs(env_parse(
                "GATEWAY_ACK_DEADLINE_SECS",
                command_timeout.as_secs(),
            )?),
            command_timeout,
            query_timeout: Duration::from_secs(env_parse("GATEWAY_QUERY_TIMEOUT_SECS", 10)?),
            shutdown_grace: Duration::from_millis(env_parse(
                "GATEWAY_SHUTDOWN_GRACE_MS",
                2000,
            )?),
        };
        dispatch.validate()?;

        let worker = WorkerConfig {
            max_uptime: Duration::from_secs(env_parse("WORKER_MAX_UPTIME_SECS", 600)?),
            max_runs: env_parse("WORKER_MAX_RUNS", 800)?,
            reaction_time: Duration::from_millis(env_parse("WORKER_REACTION_MS", 5000)?),
        };
        if worker.reaction_time.is_zero() {
            return Err(anyhow::anyhow!("WORKER_REACTION_MS must be at least 1"));
        }

        Ok(Self {
            readers,
            dispatch,
            worker,
        })
    }

    /// Number of slots, proxy slot included.
    pub fn slot_count(&self) -> usize {
        self.readers.len() + 1
    }
}

pub fn readers_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read reader config {}: {e}", path.display()))?;
    let file: ReaderFile = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Failed to parse reader config {}: {e}", path.display()))?;

    let mut readers = Vec::with_capacity(file.readers.len());
    for name in file.readers {
        let name = name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        if readers.contains(&name) {
            return Err(anyhow::anyhow!("Duplicate reader name '{name}' in {}", path.display()));
        }
        readers.push(name);
    }
    Ok(readers)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
