//! Orchestrator configuration.
//!
//! Values come from `REELFORGE_*` environment variables (a `.env` file is
//! honoured) and fall back to the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::TaskKind;
use crate::{Error, Result};

const ENV_PREFIX: &str = "REELFORGE_";

/// Maximum concurrent executions per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub generate: usize,
    pub poll: usize,
    pub download: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            generate: 20,
            poll: 20,
            download: 5,
        }
    }
}

impl ConcurrencyConfig {
    pub fn for_kind(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::Generate => self.generate,
            TaskKind::Poll => self.poll,
            TaskKind::Download => self.download,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent: ConcurrencyConfig,
    /// Jobs not updated for this long are considered stale.
    pub stale_cutoff: Duration,
    pub stale_check_interval: Duration,
    pub default_max_retries: u32,
    /// Delay between polls of a render that is not ready yet.
    pub poll_delay: Duration,
    /// Base delay for account waits and retry backoff.
    pub generate_retry_delay: Duration,
    pub max_backoff: Duration,
    pub account_lease_ttl: Duration,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    /// Upper bound on a single queue pull before the loop re-checks its stop signal.
    pub worker_pull_timeout: Duration,
    pub shutdown_grace: Duration,
    pub download_dir: PathBuf,
    pub min_artifact_bytes: u64,
    pub require_mp4_signature: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: ConcurrencyConfig::default(),
            stale_cutoff: Duration::from_secs(15 * 60),
            stale_check_interval: Duration::from_secs(60),
            default_max_retries: 3,
            poll_delay: Duration::from_secs(15),
            generate_retry_delay: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            account_lease_ttl: Duration::from_secs(600),
            queue_capacity: 1000,
            enqueue_timeout: Duration::from_secs(5),
            worker_pull_timeout: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(30),
            download_dir: PathBuf::from("data/downloads"),
            min_artifact_bytes: 10_000,
            require_mp4_signature: true,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let config = Self {
            max_concurrent: ConcurrencyConfig {
                generate: parse_or(&get, "MAX_CONCURRENT_GENERATE", defaults.max_concurrent.generate)?,
                poll: parse_or(&get, "MAX_CONCURRENT_POLL", defaults.max_concurrent.poll)?,
                download: parse_or(&get, "MAX_CONCURRENT_DOWNLOAD", defaults.max_concurrent.download)?,
            },
            stale_cutoff: Duration::from_secs(
                60 * parse_or(&get, "STALE_CUTOFF_MINUTES", defaults.stale_cutoff.as_secs() / 60)?,
            ),
            stale_check_interval: secs_or(
                &get,
                "STALE_CHECK_INTERVAL_SECONDS",
                defaults.stale_check_interval,
            )?,
            default_max_retries: parse_or(&get, "DEFAULT_MAX_RETRIES", defaults.default_max_retries)?,
            poll_delay: secs_or(&get, "POLL_DELAY_SECONDS", defaults.poll_delay)?,
            generate_retry_delay: secs_or(
                &get,
                "GENERATE_RETRY_DELAY_SECONDS",
                defaults.generate_retry_delay,
            )?,
            max_backoff: secs_or(&get, "MAX_BACKOFF_SECONDS", defaults.max_backoff)?,
            account_lease_ttl: secs_or(&get, "ACCOUNT_LEASE_TTL_SECONDS", defaults.account_lease_ttl)?,
            queue_capacity: parse_or(&get, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            enqueue_timeout: secs_or(&get, "ENQUEUE_TIMEOUT_SECONDS", defaults.enqueue_timeout)?,
            worker_pull_timeout: Duration::from_millis(parse_or(
                &get,
                "WORKER_PULL_TIMEOUT_MILLIS",
                defaults.worker_pull_timeout.as_millis() as u64,
            )?),
            shutdown_grace: secs_or(&get, "SHUTDOWN_GRACE_SECONDS", defaults.shutdown_grace)?,
            download_dir: get("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            min_artifact_bytes: parse_or(&get, "MIN_ARTIFACT_BYTES", defaults.min_artifact_bytes)?,
            require_mp4_signature: parse_or(
                &get,
                "REQUIRE_MP4_SIGNATURE",
                defaults.require_mp4_signature,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for kind in TaskKind::ALL {
            if self.max_concurrent.for_kind(kind) == 0 {
                return Err(Error::config(format!(
                    "max concurrency for the {kind} queue must be at least 1"
                )));
            }
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }
        if self.stale_cutoff.is_zero() {
            return Err(Error::config("stale cutoff must be positive"));
        }
        if self.account_lease_ttl.is_zero() {
            return Err(Error::config("account lease TTL must be positive"));
        }
        if self.worker_pull_timeout.is_zero() {
            return Err(Error::config("worker pull timeout must be positive"));
        }
        Ok(())
    }

    pub fn stale_cutoff_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_cutoff).unwrap_or(chrono::Duration::MAX)
    }

    pub fn account_lease_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.account_lease_ttl).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            Error::config(format!("invalid value '{raw}' for {ENV_PREFIX}{name}: {e}"))
        }),
        _ => Ok(default),
    }
}

fn secs_or<G>(get: &G, name: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, name, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent.generate, 20);
        assert_eq!(config.max_concurrent.poll, 20);
        assert_eq!(config.max_concurrent.download, 5);
        assert_eq!(config.stale_cutoff, Duration::from_secs(900));
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.poll_delay, Duration::from_secs(15));
        assert_eq!(config.generate_retry_delay, Duration::from_secs(10));
        assert_eq!(config.queue_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("REELFORGE_MAX_CONCURRENT_DOWNLOAD", "2"),
            ("REELFORGE_STALE_CUTOFF_MINUTES", "30"),
            ("REELFORGE_ACCOUNT_LEASE_TTL_SECONDS", "120"),
            ("REELFORGE_DOWNLOAD_DIR", "/var/lib/reelforge"),
            ("REELFORGE_REQUIRE_MP4_SIGNATURE", "false"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent.download, 2);
        assert_eq!(config.max_concurrent.generate, 20);
        assert_eq!(config.stale_cutoff, Duration::from_secs(1800));
        assert_eq!(config.account_lease_ttl, Duration::from_secs(120));
        assert_eq!(config.download_dir, PathBuf::from("/var/lib/reelforge"));
        assert!(!config.require_mp4_signature);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "REELFORGE_POLL_DELAY_SECONDS",
            "soon",
        )]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "REELFORGE_MAX_CONCURRENT_GENERATE",
            "0",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("generate"));
    }
}
