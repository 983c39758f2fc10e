//! Pair coordinator - one channel, one producer, one consumer.
//!
//! Flow:
//! 1. Create the channel
//! 2. Spawn the producer, moving the write end into it
//! 3. Spawn the consumer, moving the read end into it
//! 4. Wait for the producer, then the consumer
//!
//! Once step 3 succeeds the coordinator holds no endpoint at all. That is what
//! lets the consumer observe end-of-stream when the producer closes: a write
//! end retained here would keep the channel open forever.

use std::fmt;
use std::time::Duration;

use crate::channel::{Channel, ChannelError, Record};
use crate::outcome::{PairResult, TerminationOutcome, WorkerRole};
use crate::spawner::{SpawnError, WaitError, WorkerProcess, WorkerSpawner, WorkerSpec};
use crate::worker::{DEFAULT_RECORD_DELAY, NUM_VALUES, ProducerConfig};

/// Lifecycle of one pair. `Aborted` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Init,
    ChannelCreated,
    ProducerSpawned,
    ConsumerSpawned,
    BothAwaited,
    Done,
    Aborted,
}

impl PairState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::ChannelCreated => "channel_created",
            Self::ProducerSpawned => "producer_spawned",
            Self::ConsumerSpawned => "consumer_spawned",
            Self::BothAwaited => "both_awaited",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PairError {
    #[error("pair {pair_id}: {source}")]
    ResourceExhausted {
        pair_id: u32,
        #[source]
        source: ChannelError,
    },
    #[error("pair {pair_id}: failed to spawn {role}: {source}")]
    SpawnFailure {
        pair_id: u32,
        role: WorkerRole,
        #[source]
        source: SpawnError,
    },
    #[error("pair {pair_id}: failed to wait for {role}: {source}")]
    WaitFailure {
        pair_id: u32,
        role: WorkerRole,
        #[source]
        source: WaitError,
    },
}

impl PairError {
    pub fn pair_id(&self) -> u32 {
        match self {
            Self::ResourceExhausted { pair_id, .. }
            | Self::SpawnFailure { pair_id, .. }
            | Self::WaitFailure { pair_id, .. } => *pair_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairConfig {
    pub pair_id: u32,
    pub start_value: Record,
    pub num_values: usize,
    pub record_delay: Duration,
    pub producer_abort_after: Option<usize>,
}

impl PairConfig {
    pub fn new(pair_id: u32, start_value: Record) -> Self {
        Self {
            pair_id,
            start_value,
            num_values: NUM_VALUES,
            record_delay: DEFAULT_RECORD_DELAY,
            producer_abort_after: None,
        }
    }

    pub fn with_num_values(mut self, n: usize) -> Self {
        self.num_values = n;
        self
    }

    pub fn with_record_delay(mut self, delay: Duration) -> Self {
        self.record_delay = delay;
        self
    }

    /// Kill the producer after `sent` records (fault injection).
    pub fn with_producer_abort_after(mut self, sent: usize) -> Self {
        self.producer_abort_after = Some(sent);
        self
    }

    fn producer_config(&self) -> ProducerConfig {
        ProducerConfig::new(self.start_value)
            .with_num_values(self.num_values)
            .with_delay(self.record_delay)
            .with_abort_after(self.producer_abort_after)
    }
}

/// Drives one pair through its lifecycle.
pub struct PairCoordinator<'a> {
    config: PairConfig,
    spawner: &'a dyn WorkerSpawner,
    state: PairState,
}

impl<'a> PairCoordinator<'a> {
    pub fn new(config: PairConfig, spawner: &'a dyn WorkerSpawner) -> Self {
        Self {
            config,
            spawner,
            state: PairState::Init,
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Run the pair to completion. Any failure leaves the coordinator `Aborted`.
    pub async fn run(&mut self) -> Result<PairResult, PairError> {
        match self.drive().await {
            Ok(result) => {
                self.transition(PairState::Done);
                Ok(result)
            }
            Err(e) => {
                tracing::error!(pair_id = self.config.pair_id, error = %e, "Pair aborted");
                self.transition(PairState::Aborted);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<PairResult, PairError> {
        let pair_id = self.config.pair_id;
        tracing::info!(
            pair_id,
            parent_pid = std::process::id(),
            start_value = self.config.start_value,
            "Creating pair"
        );

        let channel = Channel::create()
            .map_err(|source| PairError::ResourceExhausted { pair_id, source })?;
        self.transition(PairState::ChannelCreated);

        let (read_end, write_end) = channel.into_split();

        // On failure `read_end` drops with this frame; `write_end` was consumed
        // by the spawner. No endpoint survives an aborted spawn.
        let mut producer = self
            .spawner
            .spawn(WorkerSpec::Producer {
                pair_id,
                write_end,
                config: self.config.producer_config(),
            })
            .map_err(|source| PairError::SpawnFailure {
                pair_id,
                role: WorkerRole::Producer,
                source,
            })?;
        self.transition(PairState::ProducerSpawned);

        let consumer = self.spawner.spawn(WorkerSpec::Consumer { pair_id, read_end });
        let mut consumer = match consumer {
            Ok(consumer) => consumer,
            Err(source) => {
                // The producer now writes into a channel with no reader and fails
                // fast; reap it so it does not linger as a zombie.
                match producer.wait().await {
                    Ok(exit) => tracing::warn!(pair_id, %exit, "Reaped orphaned producer"),
                    Err(e) => tracing::warn!(pair_id, error = %e, "Failed to reap orphaned producer"),
                }
                return Err(PairError::SpawnFailure {
                    pair_id,
                    role: WorkerRole::Consumer,
                    source,
                });
            }
        };
        self.transition(PairState::ConsumerSpawned);

        let producer = self.await_worker(producer.as_mut(), WorkerRole::Producer).await?;
        let consumer = self.await_worker(consumer.as_mut(), WorkerRole::Consumer).await?;
        self.transition(PairState::BothAwaited);

        tracing::info!(pair_id, "Pair completed");
        Ok(PairResult {
            pair_id,
            producer,
            consumer,
        })
    }

    async fn await_worker(
        &self,
        worker: &mut dyn WorkerProcess,
        role: WorkerRole,
    ) -> Result<TerminationOutcome, PairError> {
        let pair_id = self.config.pair_id;
        let pid = worker.pid();

        let exit = worker
            .wait()
            .await
            .map_err(|source| PairError::WaitFailure {
                pair_id,
                role,
                source,
            })?;

        if exit.is_success() {
            tracing::info!(pair_id, ?pid, %role, %exit, "Worker finished");
        } else {
            tracing::warn!(pair_id, ?pid, %role, %exit, "Worker finished abnormally");
        }

        Ok(TerminationOutcome::new(pair_id, role, pid, exit))
    }

    fn transition(&mut self, next: PairState) {
        tracing::debug!(
            pair_id = self.config.pair_id,
            from = %self.state,
            to = %next,
            "Pair state transition"
        );
        self.state = next;
    }
}

/// Convenience wrapper: run a single pair with the given spawner.
pub async fn run_pair(
    config: PairConfig,
    spawner: &dyn WorkerSpawner,
) -> Result<PairResult, PairError> {
    PairCoordinator::new(config, spawner).run().await
}
