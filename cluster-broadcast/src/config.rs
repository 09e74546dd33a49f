use std::env;
use std::fmt;
use std::time::Duration;

use crate::Error;

pub const DEFAULT_CHANNEL: &str = "ws_broadcast";
const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Which broadcaster a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    /// One worker process owns every connection; no coordination needed.
    Single,
    /// Several worker processes coordinate through Redis.
    Cluster,
}

impl BroadcastMode {
    pub fn for_workers(workers: usize) -> Self {
        if workers > 1 {
            Self::Cluster
        } else {
            Self::Single
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for BroadcastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settings consumed by the broadcasters and the drain coordinator.
///
/// Values are read once at process start. Every duration has a default
/// matching the production cadence (1s scan, 5s heartbeat, 10s leadership
/// cycle, 15s lease, 60s drain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Number of worker processes sharing the listening port.
    pub workers: usize,
    pub redis_url: String,
    /// Pub/Sub channel carrying the broadcast text.
    pub channel: String,
    /// Optional namespace for every Redis key and the channel.
    pub key_prefix: Option<String>,
    pub heartbeat_interval: Duration,
    pub leader_interval: Duration,
    /// TTL of both the leadership lease and the heartbeat keys.
    pub lease_ttl: Duration,
    /// Delay between scheduled broadcasts for one connection (single mode).
    pub broadcast_period: Duration,
    pub scan_interval: Duration,
    pub drain_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            redis_url: format!("redis://{}:{}", DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT),
            channel: DEFAULT_CHANNEL.to_string(),
            key_prefix: None,
            heartbeat_interval: Duration::from_secs(5),
            leader_interval: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(15),
            broadcast_period: Duration::from_secs(10),
            scan_interval: Duration::from_secs(1),
            drain_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

impl BroadcastConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup. Missing or unparseable values
    /// fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| {
            let host = lookup("REDIS_HOST").unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string());
            let port = parse_or(&lookup, &["REDIS_PORT"], DEFAULT_REDIS_PORT);
            format!("redis://{}:{}", host, port)
        });

        Self {
            workers: parse_or(&lookup, &["WORKERS", "UVICORN_WORKERS"], defaults.workers),
            redis_url,
            channel: lookup("BROADCAST_CHANNEL").unwrap_or(defaults.channel),
            key_prefix: lookup("REDIS_KEY_PREFIX").filter(|p| !p.is_empty()),
            heartbeat_interval: secs_or(
                &lookup,
                &["HEARTBEAT_INTERVAL_SECS"],
                defaults.heartbeat_interval,
            ),
            leader_interval: secs_or(&lookup, &["LEADER_INTERVAL_SECS"], defaults.leader_interval),
            lease_ttl: secs_or(&lookup, &["LEASE_TTL_SECS"], defaults.lease_ttl),
            broadcast_period: secs_or(
                &lookup,
                &["BROADCAST_PERIOD_SECS"],
                defaults.broadcast_period,
            ),
            scan_interval: Duration::from_millis(parse_or(
                &lookup,
                &["SCAN_INTERVAL_MS"],
                defaults.scan_interval.as_millis() as u64,
            )),
            drain_interval: secs_or(
                &lookup,
                &["DRAIN_INTERVAL_SECS", "INTERVAL"],
                defaults.drain_interval,
            ),
            drain_timeout: secs_or(
                &lookup,
                &["DRAIN_TIMEOUT_SECS", "TIMEOUT"],
                defaults.drain_timeout,
            ),
        }
    }

    pub fn mode(&self) -> BroadcastMode {
        BroadcastMode::for_workers(self.workers)
    }

    /// Reject settings the coordination loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<(), Error> {
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("leader_interval", self.leader_interval),
            ("broadcast_period", self.broadcast_period),
            ("scan_interval", self.scan_interval),
            ("drain_interval", self.drain_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        // Redis expiries have one-second resolution.
        if self.lease_ttl.as_secs() == 0 {
            return Err(Error::Config("lease_ttl must be at least 1 second".into()));
        }
        if self.lease_ttl <= self.leader_interval {
            return Err(Error::Config(format!(
                "lease_ttl ({:?}) must exceed leader_interval ({:?}) or the lease lapses between renewals",
                self.lease_ttl, self.leader_interval
            )));
        }
        if self.lease_ttl <= self.heartbeat_interval {
            return Err(Error::Config(format!(
                "lease_ttl ({:?}) must exceed heartbeat_interval ({:?}) or heartbeat keys expire between refreshes",
                self.lease_ttl, self.heartbeat_interval
            )));
        }
        if self.channel.is_empty() {
            return Err(Error::Config("channel must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, names: &[&str], default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    for name in names {
        if let Some(raw) = lookup(name) {
            match raw.trim().parse() {
                Ok(value) => return value,
                Err(_) => {
                    tracing::warn!(variable = %name, value = %raw, "Unparseable value, using default");
                    return default;
                }
            }
        }
    }
    default
}

fn secs_or<F>(lookup: &F, names: &[&str], default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parse_or(lookup, names, default.as_secs()))
}
