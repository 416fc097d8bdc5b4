//! Engine configuration
//!
//! Defines all configurable parameters of the engine: retry policy, external
//! call limits, polling cadence, staleness and reconciliation timing.

use anyhow::Context;
use batchwire_core::domain::handle::BackendKind;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
///
/// Every timing knob is configurable so slow clusters and fast test setups
/// can share one code path.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backends to instantiate
    pub backends: Vec<BackendKind>,

    /// Total submission (and cancellation) attempts, first one included
    pub submit_attempts: u32,

    /// Delay before the first retry, doubled on each further retry
    pub retry_initial_backoff: Duration,

    /// Upper bound of the retry delay
    pub retry_max_backoff: Duration,

    /// Timeout for one external scheduler call
    pub call_timeout: Duration,

    /// How often the tracker loop polls every backend
    pub poll_interval: Duration,

    /// Minimum spacing between two polls of the same backend
    pub min_poll_interval: Duration,

    /// Maximum concurrent external calls per backend
    pub max_concurrent_calls: usize,

    /// Time without fresh status after which a job becomes Unknown
    pub staleness_window: Duration,

    /// How long the reconciler waits for exit-code artifacts
    pub reconcile_deadline: Duration,

    /// Delay between artifact reads, doubled up to `retry_max_backoff`
    pub reconcile_initial_backoff: Duration,

    /// Wall-clock limit for jobs run by the direct backend
    pub direct_job_timeout: Duration,

    /// Where the tracker persists registry snapshots
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::Direct],
            submit_attempts: 3,
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(30),
            min_poll_interval: Duration::from_secs(1),
            max_concurrent_calls: 4,
            staleness_window: Duration::from_secs(600),
            reconcile_deadline: Duration::from_secs(120),
            reconcile_initial_backoff: Duration::from_secs(1),
            direct_job_timeout: Duration::from_secs(3600),
            checkpoint_path: None,
        }
    }
}

impl EngineConfig {
    /// Creates configuration from environment variables
    ///
    /// Every variable is optional and falls back to the default:
    /// - BATCHWIRE_BACKENDS (comma list, default: direct)
    /// - BATCHWIRE_SUBMIT_ATTEMPTS (default: 3)
    /// - BATCHWIRE_RETRY_INITIAL_MS / BATCHWIRE_RETRY_MAX_MS (default: 500 / 30000)
    /// - BATCHWIRE_CALL_TIMEOUT (seconds, default: 60)
    /// - BATCHWIRE_POLL_INTERVAL (seconds, default: 30)
    /// - BATCHWIRE_MIN_POLL_INTERVAL_MS (default: 1000)
    /// - BATCHWIRE_MAX_CONCURRENT_CALLS (default: 4)
    /// - BATCHWIRE_STALENESS_WINDOW (seconds, default: 600)
    /// - BATCHWIRE_RECONCILE_DEADLINE (seconds, default: 120)
    /// - BATCHWIRE_RECONCILE_INITIAL_MS (default: 1000)
    /// - BATCHWIRE_DIRECT_JOB_TIMEOUT (seconds, default: 3600)
    /// - BATCHWIRE_CHECKPOINT_PATH (default: unset)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let parse_u64 = |key: &str| -> anyhow::Result<Option<u64>> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, raw)),
                None => Ok(None),
            }
        };
        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            Ok(parse_u64(key)?.map(Duration::from_secs).unwrap_or(default))
        };
        let millis = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            Ok(parse_u64(key)?.map(Duration::from_millis).unwrap_or(default))
        };

        let backends = match lookup("BATCHWIRE_BACKENDS") {
            Some(list) => list
                .split(',')
                .filter(|name| !name.trim().is_empty())
                .map(BackendKind::from_name)
                .collect(),
            None => defaults.backends.clone(),
        };

        let submit_attempts = match parse_u64("BATCHWIRE_SUBMIT_ATTEMPTS")? {
            Some(n) => u32::try_from(n)
                .map_err(|_| anyhow::anyhow!("BATCHWIRE_SUBMIT_ATTEMPTS is out of range: {}", n))?,
            None => defaults.submit_attempts,
        };

        let max_concurrent_calls = match parse_u64("BATCHWIRE_MAX_CONCURRENT_CALLS")? {
            Some(n) => usize::try_from(n).map_err(|_| {
                anyhow::anyhow!("BATCHWIRE_MAX_CONCURRENT_CALLS is out of range: {}", n)
            })?,
            None => defaults.max_concurrent_calls,
        };

        Ok(Self {
            backends,
            submit_attempts,
            retry_initial_backoff: millis("BATCHWIRE_RETRY_INITIAL_MS", defaults.retry_initial_backoff)?,
            retry_max_backoff: millis("BATCHWIRE_RETRY_MAX_MS", defaults.retry_max_backoff)?,
            call_timeout: secs("BATCHWIRE_CALL_TIMEOUT", defaults.call_timeout)?,
            poll_interval: secs("BATCHWIRE_POLL_INTERVAL", defaults.poll_interval)?,
            min_poll_interval: millis("BATCHWIRE_MIN_POLL_INTERVAL_MS", defaults.min_poll_interval)?,
            max_concurrent_calls,
            staleness_window: secs("BATCHWIRE_STALENESS_WINDOW", defaults.staleness_window)?,
            reconcile_deadline: secs("BATCHWIRE_RECONCILE_DEADLINE", defaults.reconcile_deadline)?,
            reconcile_initial_backoff: millis(
                "BATCHWIRE_RECONCILE_INITIAL_MS",
                defaults.reconcile_initial_backoff,
            )?,
            direct_job_timeout: secs("BATCHWIRE_DIRECT_JOB_TIMEOUT", defaults.direct_job_timeout)?,
            checkpoint_path: lookup("BATCHWIRE_CHECKPOINT_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// Reads and validates configuration
    ///
    /// Unset keys take their defaults; a malformed key is an error rather
    /// than a reason to drop the rest of the configuration.
    pub fn load<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::from_lookup(lookup).context("Invalid configuration")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("at least one backend must be enabled");
        }

        if let Some(custom) = self.backends.iter().find(|b| matches!(b, BackendKind::Custom(_))) {
            anyhow::bail!("backend '{}' is not built in and cannot be enabled from configuration", custom);
        }

        if self.submit_attempts == 0 {
            anyhow::bail!("submit_attempts must be at least 1");
        }

        if self.retry_initial_backoff > self.retry_max_backoff {
            anyhow::bail!("retry_initial_backoff cannot exceed retry_max_backoff");
        }

        if self.call_timeout.is_zero() {
            anyhow::bail!("call_timeout must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.max_concurrent_calls == 0 {
            anyhow::bail!("max_concurrent_calls must be greater than 0");
        }

        if self.staleness_window < self.poll_interval {
            anyhow::bail!("staleness_window must be at least one poll_interval");
        }

        if self.direct_job_timeout.is_zero() {
            anyhow::bail!("direct_job_timeout must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.submit_attempts, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.backends, vec![BackendKind::Direct]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("BATCHWIRE_BACKENDS", "slurm, pbs"),
            ("BATCHWIRE_SUBMIT_ATTEMPTS", "5"),
            ("BATCHWIRE_RETRY_INITIAL_MS", "100"),
            ("BATCHWIRE_STALENESS_WINDOW", "900"),
            ("BATCHWIRE_CHECKPOINT_PATH", "/var/lib/batchwire/state.json"),
        ]))
        .unwrap();

        assert_eq!(config.backends, vec![BackendKind::Slurm, BackendKind::Pbs]);
        assert_eq!(config.submit_attempts, 5);
        assert_eq!(config.retry_initial_backoff, Duration::from_millis(100));
        assert_eq!(config.staleness_window, Duration::from_secs(900));
        assert_eq!(
            config.checkpoint_path,
            Some(PathBuf::from("/var/lib/batchwire/state.json"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = EngineConfig::from_lookup(lookup_from(&[("BATCHWIRE_POLL_INTERVAL", "soon")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_lookup_rejects_out_of_range_counts() {
        let result = EngineConfig::from_lookup(lookup_from(&[(
            "BATCHWIRE_SUBMIT_ATTEMPTS",
            "4294967297",
        )]));
        assert!(result.is_err());
    }

    #[test]
    fn test_reconcile_backoff_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[(
            "BATCHWIRE_RECONCILE_INITIAL_MS",
            "250",
        )]))
        .unwrap();
        assert_eq!(config.reconcile_initial_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_load_rejects_malformed_key() {
        let result = EngineConfig::load(lookup_from(&[
            ("BATCHWIRE_BACKENDS", "slurm"),
            ("BATCHWIRE_CHECKPOINT_PATH", "/var/lib/batchwire/state.json"),
            ("BATCHWIRE_POLL_INTERVAL", "soon"),
        ]));
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("BATCHWIRE_POLL_INTERVAL"));

        let config = EngineConfig::load(lookup_from(&[("BATCHWIRE_BACKENDS", "slurm")])).unwrap();
        assert_eq!(config.backends, vec![BackendKind::Slurm]);
        assert_eq!(config.checkpoint_path, None);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.submit_attempts = 0;
        assert!(config.validate().is_err());
        config.submit_attempts = 3;

        config.staleness_window = Duration::from_secs(1);
        assert!(config.validate().is_err());
        config.staleness_window = Duration::from_secs(600);

        config.backends = vec![BackendKind::Custom("condor".to_string())];
        assert!(config.validate().is_err());

        config.backends = vec![BackendKind::Sge];
        assert!(config.validate().is_ok());
    }
}
