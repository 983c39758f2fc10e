//! pairflow: producer/consumer worker pairs over pipes.
//!
//! A fleet runs one or more pairs in sequence. Each pair is a pipe, a producer
//! writing a short integer sequence into it and a consumer summing what it
//! reads, plus a coordinator that reaps both and records how they ended.

#[cfg(not(unix))]
compile_error!("pairflow relies on unix pipes and process semantics");

pub mod channel;
pub mod coordinator;
pub mod fleet;
pub mod logging;
pub mod outcome;
pub mod spawner;
pub mod worker;

pub use channel::{Channel, ChannelError, ReadEnd, Record, WriteEnd};
pub use coordinator::{PairConfig, PairCoordinator, PairError, PairState, run_pair};
pub use fleet::{ConfigError, FleetConfig, FleetError, FleetMode, FleetReport, run_fleet};
pub use outcome::{PairResult, TerminationOutcome, WorkerExit, WorkerRole};
pub use spawner::{ExecSpawner, SpawnError, TaskSpawner, WaitError, WorkerSpawner, WorkerSpec};
pub use worker::{ConsumerReport, NUM_VALUES, ProducerConfig, ProducerReport, WorkerError};
