use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which role(s) this process runs. Non-standalone deployments talk
/// through Redis so the roles can live on different hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Mode {
    #[default]
    Standalone,
    Matchmaker,
    Director,
}

/// Service configuration, loaded from a JSON file.
///
/// Field names match the keys the config file uses. Out-of-range scalar
/// values are clamped with a warning; contradictory timing values are a
/// load error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    pub listen_endpoint: String,

    /// TLS material; termination is delegated, both paths are only
    /// reported at startup
    pub certificate_path: Option<String>,
    pub private_key_path: Option<String>,

    pub mode: Mode,

    /// Worker tasks per matchmaker, 1..=128
    pub matchmaker_threads: usize,

    pub use_redis: bool,
    pub redis_configuration_options: String,

    /// Seconds before a silent matchmaker (or director lease) is
    /// considered offline
    pub max_downtime_before_offline: f64,

    pub matchmaker_update_delay: f64,
    pub director_update_delay: f64,

    /// How long a worker withholds matching to let tickets accumulate
    pub matchmaker_min_gather_time: f64,

    pub matchmaker_pool_capacity: usize,

    pub max_match_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_endpoint: "0.0.0.0:5000".into(),
            certificate_path: None,
            private_key_path: None,
            mode: Mode::Standalone,
            matchmaker_threads: 2.min(num_cpus::get()),
            use_redis: false,
            redis_configuration_options: "redis://127.0.0.1:6379".into(),
            max_downtime_before_offline: 5.0,
            matchmaker_update_delay: 0.5,
            director_update_delay: 0.5,
            matchmaker_min_gather_time: 2.0,
            matchmaker_pool_capacity: 200,
            max_match_failures: 10,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let mut config: Config = serde_json::from_str(&raw).context("parsing config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Clamp what can be clamped, reject what cannot
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if !(1..=128).contains(&self.matchmaker_threads) {
            warn!(
                threads = self.matchmaker_threads,
                "MatchmakerThreads out of 1..=128, using 1"
            );
            self.matchmaker_threads = 1;
        }
        if self.max_downtime_before_offline < 0.1 {
            warn!("MaxDowntimeBeforeOffline below 0.1s, clamping");
            self.max_downtime_before_offline = 0.1;
        }
        if self.matchmaker_update_delay < 0.01 {
            warn!("MatchmakerUpdateDelay below 0.01s, clamping");
            self.matchmaker_update_delay = 0.01;
        }
        if self.director_update_delay < 0.01 {
            warn!("DirectorUpdateDelay below 0.01s, clamping");
            self.director_update_delay = 0.01;
        }
        if self.matchmaker_min_gather_time < 0.0 {
            warn!("MatchmakerMinGatherTime negative, clamping to 0");
            self.matchmaker_min_gather_time = 0.0;
        }
        if self.matchmaker_pool_capacity < 10 {
            warn!(
                capacity = self.matchmaker_pool_capacity,
                "MatchmakerPoolCapacity below 10, clamping"
            );
            self.matchmaker_pool_capacity = 10;
        }
        if self.max_match_failures == 0 {
            warn!("MaxMatchFailures must be positive, using 1");
            self.max_match_failures = 1;
        }

        // The downtime window has to outlive both update cadences or
        // healthy peers flap offline
        if self.max_downtime_before_offline <= self.matchmaker_update_delay
            || self.max_downtime_before_offline <= self.director_update_delay
        {
            anyhow::bail!("MaxDowntimeBeforeOffline must exceed both update delays");
        }

        if self.mode != Mode::Standalone && !self.use_redis {
            warn!("non-standalone mode requires Redis, enabling UseRedis");
            self.use_redis = true;
        }
        Ok(())
    }

    pub fn matchmaker_update_delay(&self) -> Duration {
        Duration::from_secs_f64(self.matchmaker_update_delay)
    }

    pub fn director_update_delay(&self) -> Duration {
        Duration::from_secs_f64(self.director_update_delay)
    }

    pub fn max_downtime(&self) -> Duration {
        Duration::from_secs_f64(self.max_downtime_before_offline)
    }

    pub fn min_gather_time(&self) -> Duration {
        Duration::from_secs_f64(self.matchmaker_min_gather_time)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn clamps_out_of_range_scalars() {
        let mut config = Config {
            matchmaker_threads: 500,
            matchmaker_pool_capacity: 3,
            max_match_failures: 0,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.matchmaker_threads, 1);
        assert_eq!(config.matchmaker_pool_capacity, 10);
        assert_eq!(config.max_match_failures, 1);
    }

    #[test]
    fn downtime_must_exceed_update_delays() {
        let mut config = Config {
            max_downtime_before_offline: 0.5,
            director_update_delay: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_pascal_case_json() {
        let mut config: Config = serde_json::from_str(
            r#"{
                "ListenEndpoint": "0.0.0.0:6000",
                "Mode": "Director",
                "UseRedis": true,
                "MatchmakerThreads": 8,
                "MaxDowntimeBeforeOffline": 10.0
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen_endpoint, "0.0.0.0:6000");
        assert_eq!(config.mode, Mode::Director);
        assert_eq!(config.matchmaker_threads, 8);
    }

    #[test]
    fn non_standalone_forces_redis() {
        let mut config = Config {
            mode: Mode::Matchmaker,
            use_redis: false,
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(config.use_redis);
    }
}
