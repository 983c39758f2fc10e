//! Fleet orchestrator - runs one or many pairs and collects every outcome.
//!
//! Pairs run strictly one after another: a pair's channel is only created
//! once the previous pair's workers have both been reaped. Pair `i` of a
//! multi-pair run owns the range `[i*n + 1, i*n + n]`, so ranges are disjoint
//! and contiguous.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::channel::Record;
use crate::coordinator::{PairConfig, PairError, run_pair};
use crate::outcome::{PairResult, TerminationOutcome};
use crate::spawner::{TaskSpawner, WorkerSpawner};
use crate::worker::{DEFAULT_RECORD_DELAY, NUM_VALUES};

pub const DEFAULT_MAX_PAIRS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetMode {
    /// One pair: values `1..=n`, pair id 0.
    Basic,
    /// `pairs` pairs with ids starting at 1.
    MultiPair { pairs: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("pair count must be at least 1")]
    NoPairs,
    #[error("requested {requested} pairs but at most {max} are supported")]
    TooManyPairs { requested: usize, max: usize },
    #[error("value range of pair {pair_id} does not fit in a record")]
    RangeOverflow { pair_id: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("pair {} aborted after {} completed pair(s)", .source.pair_id(), .completed.len())]
    PairAborted {
        #[source]
        source: PairError,
        /// Pairs that finished before the failing one. They are not rolled back.
        completed: Vec<PairResult>,
    },
}

pub struct FleetConfig {
    pub mode: FleetMode,
    pub max_pairs: usize,
    pub num_values: usize,
    pub record_delay: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl FleetConfig {
    /// Defaults run workers as in-process tasks ([`TaskSpawner`]). Use
    /// [`FleetConfig::with_spawner`] with an [`ExecSpawner`](crate::spawner::ExecSpawner)
    /// to run them as separate processes, as the `pairflow` binary does.
    pub fn new(mode: FleetMode) -> Self {
        Self {
            mode,
            max_pairs: DEFAULT_MAX_PAIRS,
            num_values: NUM_VALUES,
            record_delay: DEFAULT_RECORD_DELAY,
            spawner: Arc::new(TaskSpawner),
        }
    }

    pub fn with_max_pairs(mut self, max: usize) -> Self {
        self.max_pairs = max;
        self
    }

    pub fn with_num_values(mut self, n: usize) -> Self {
        self.num_values = n;
        self
    }

    pub fn with_record_delay(mut self, delay: Duration) -> Self {
        self.record_delay = delay;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Validate the configuration and lay out every pair, in creation order.
    pub fn pair_configs(&self) -> Result<Vec<PairConfig>, ConfigError> {
        let pairs = match self.mode {
            FleetMode::Basic => return Ok(vec![self.pair_config(0, 1)?]),
            FleetMode::MultiPair { pairs } => pairs,
        };

        if pairs == 0 {
            return Err(ConfigError::NoPairs);
        }
        if pairs > self.max_pairs {
            return Err(ConfigError::TooManyPairs {
                requested: pairs,
                max: self.max_pairs,
            });
        }

        (0..pairs)
            .map(|i| {
                let pair_id = u32::try_from(i + 1).map_err(|_| ConfigError::TooManyPairs {
                    requested: pairs,
                    max: self.max_pairs,
                })?;
                let start = i
                    .checked_mul(self.num_values)
                    .and_then(|v| v.checked_add(1))
                    .and_then(|v| Record::try_from(v).ok())
                    .ok_or(ConfigError::RangeOverflow { pair_id })?;
                self.pair_config(pair_id, start)
            })
            .collect()
    }

    fn pair_config(&self, pair_id: u32, start_value: Record) -> Result<PairConfig, ConfigError> {
        let span = self.num_values.saturating_sub(1);
        let fits = Record::try_from(span)
            .ok()
            .and_then(|span| start_value.checked_add(span))
            .is_some();
        if !fits {
            return Err(ConfigError::RangeOverflow { pair_id });
        }

        Ok(PairConfig::new(pair_id, start_value)
            .with_num_values(self.num_values)
            .with_record_delay(self.record_delay))
    }
}

/// Every pair's outcomes, in pair creation order.
#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub mode: FleetMode,
    pub pairs: Vec<PairResult>,
}

impl FleetReport {
    /// Worker outcomes in creation order: producer1, consumer1, producer2, ...
    pub fn outcomes(&self) -> impl Iterator<Item = &TerminationOutcome> {
        self.pairs.iter().flat_map(|pair| pair.outcomes())
    }

    pub fn all_succeeded(&self) -> bool {
        self.pairs.iter().all(PairResult::succeeded)
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all_succeeded() {
            writeln!(f, "All pairs completed successfully!")?;
        } else {
            writeln!(f, "All pairs completed, some workers failed:")?;
        }
        for outcome in self.outcomes() {
            writeln!(f, "{outcome}")?;
        }
        Ok(())
    }
}

/// Run every pair of the fleet, one at a time.
///
/// Configuration is validated before the first channel is created. The first
/// pair to abort stops the fleet; no later pair is started.
pub async fn run_fleet(config: &FleetConfig) -> Result<FleetReport, FleetError> {
    let pairs = config.pair_configs()?;

    tracing::info!(
        parent_pid = std::process::id(),
        mode = ?config.mode,
        pairs = pairs.len(),
        "Parent creating producer-consumer pairs"
    );

    let mut completed = Vec::with_capacity(pairs.len());
    for pair in pairs {
        tracing::info!(pair_id = pair.pair_id, "=== Pair {} ===", pair.pair_id);
        match run_pair(pair, config.spawner.as_ref()).await {
            Ok(result) => completed.push(result),
            Err(source) => return Err(FleetError::PairAborted { source, completed }),
        }
    }

    tracing::info!(pairs = completed.len(), "All pairs completed");

    Ok(FleetReport {
        mode: config.mode,
        pairs: completed,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::outcome::{WorkerExit, WorkerRole};
    use crate::spawner::{SpawnError, WorkerProcess, WorkerSpec};

    fn multi(pairs: usize) -> FleetConfig {
        FleetConfig::new(FleetMode::MultiPair { pairs }).with_record_delay(Duration::ZERO)
    }

    /// TaskSpawner that refuses to spawn anything for one pair and logs the rest.
    struct PairFailingSpawner {
        fail_pair: u32,
        spawned: Mutex<Vec<u32>>,
    }

    impl WorkerSpawner for PairFailingSpawner {
        fn spawn(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerProcess>, SpawnError> {
            if spec.pair_id() == self.fail_pair {
                return Err(SpawnError::Other("out of processes".to_string()));
            }
            self.spawned.lock().unwrap().push(spec.pair_id());
            TaskSpawner.spawn(spec)
        }
    }

    #[test]
    fn basic_mode_layout() {
        let configs = FleetConfig::new(FleetMode::Basic).pair_configs().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].pair_id, 0);
        assert_eq!(configs[0].start_value, 1);
    }

    #[test]
    fn multi_pair_ranges_are_disjoint_and_contiguous() {
        let configs = multi(10).pair_configs().unwrap();
        for (i, config) in configs.iter().enumerate() {
            assert_eq!(config.pair_id as usize, i + 1);
            assert_eq!(config.start_value as usize, i * NUM_VALUES + 1);
        }
        for window in configs.windows(2) {
            let end = window[0].start_value + NUM_VALUES as Record - 1;
            assert_eq!(window[1].start_value, end + 1);
        }
    }

    #[test]
    fn rejects_pair_counts_out_of_bounds() {
        assert_eq!(multi(0).pair_configs().unwrap_err(), ConfigError::NoPairs);
        assert_eq!(
            multi(11).pair_configs().unwrap_err(),
            ConfigError::TooManyPairs {
                requested: 11,
                max: 10
            }
        );
        assert!(multi(11).with_max_pairs(11).pair_configs().is_ok());
    }

    #[test]
    fn rejects_ranges_beyond_record() {
        let config = multi(3)
            .with_max_pairs(3)
            .with_num_values(Record::MAX as usize);
        assert_eq!(
            config.pair_configs().unwrap_err(),
            ConfigError::RangeOverflow { pair_id: 2 }
        );
    }

    #[tokio::test]
    async fn invalid_config_starts_no_pair() {
        let spawner = Arc::new(PairFailingSpawner {
            fail_pair: u32::MAX,
            spawned: Mutex::new(Vec::new()),
        });
        let config = multi(50).with_spawner(spawner.clone());

        let err = run_fleet(&config).await.unwrap_err();
        assert!(matches!(err, FleetError::Config(ConfigError::TooManyPairs { .. })));
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn two_pairs_report_in_creation_order() {
        let report = run_fleet(&multi(2)).await.unwrap();

        assert!(report.all_succeeded());
        let order: Vec<_> = report.outcomes().map(|o| (o.pair_id, o.role)).collect();
        assert_eq!(
            order,
            vec![
                (1, WorkerRole::Producer),
                (1, WorkerRole::Consumer),
                (2, WorkerRole::Producer),
                (2, WorkerRole::Consumer),
            ]
        );
    }

    #[tokio::test]
    async fn aborted_pair_stops_the_fleet() {
        let spawner = Arc::new(PairFailingSpawner {
            fail_pair: 2,
            spawned: Mutex::new(Vec::new()),
        });
        let config = multi(4).with_spawner(spawner.clone());

        let err = run_fleet(&config).await.unwrap_err();
        match err {
            FleetError::PairAborted { source, completed } => {
                assert_eq!(source.pair_id(), 2);
                assert_eq!(completed.len(), 1);
                assert_eq!(completed[0].pair_id, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*spawner.spawned.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn report_display() {
        let outcome = |pair_id, role, pid, exit| {
            TerminationOutcome::new(pair_id, role, Some(pid), exit)
        };
        let report = FleetReport {
            mode: FleetMode::MultiPair { pairs: 2 },
            pairs: vec![
                PairResult {
                    pair_id: 1,
                    producer: outcome(1, WorkerRole::Producer, 101, WorkerExit::success()),
                    consumer: outcome(1, WorkerRole::Consumer, 102, WorkerExit::success()),
                },
                PairResult {
                    pair_id: 2,
                    producer: outcome(
                        2,
                        WorkerRole::Producer,
                        103,
                        WorkerExit::Signaled { signal: 9 },
                    ),
                    consumer: outcome(2, WorkerRole::Consumer, 104, WorkerExit::success()),
                },
            ],
        };

        insta::assert_snapshot!(report.to_string(), @r"
        All pairs completed, some workers failed:
        Child (PID: 101) [pair 1 producer] exited with status 0
        Child (PID: 102) [pair 1 consumer] exited with status 0
        Child (PID: 103) [pair 2 producer] terminated by signal 9 (SIGKILL)
        Child (PID: 104) [pair 2 consumer] exited with status 0
        ");
    }

    #[test]
    fn report_serializes_with_mode() {
        let report = FleetReport {
            mode: FleetMode::Basic,
            pairs: vec![],
        };
        insta::assert_json_snapshot!(report, @r#"
        {
          "mode": "basic",
          "pairs": []
        }
        "#);
    }
}
