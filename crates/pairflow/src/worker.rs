//! Producer and consumer workers.
//!
//! Each worker is an async function that owns exactly one channel endpoint
//! and returns a report or a [`WorkerError`]. Turning that result into an
//! actual process exit happens only at the process boundary
//! ([`run_producer_process`] / [`run_consumer_process`]), which the exec
//! spawner reaches through the hidden `worker` subcommand.
//!
//! Process layout inside a spawned worker:
//! - Producer: fd 1 (stdout) is the channel write end
//! - Consumer: fd 0 (stdin) is the channel read end
//! - fd 2 (stderr) carries tracing output for both

use std::os::fd::{FromRawFd, RawFd};
use std::time::Duration;

use serde::Serialize;

use crate::channel::{ChannelError, ReadEnd, Record, RecordReader, RecordWriter, WriteEnd};
use crate::outcome::WorkerExit;

/// Records emitted by one producer unless configured otherwise.
pub const NUM_VALUES: usize = 5;

/// Pause between two records. Only affects how output interleaves.
pub const DEFAULT_RECORD_DELAY: Duration = Duration::from_millis(100);

pub const EXIT_BROKEN_CHANNEL: i32 = 3;
pub const EXIT_IO_FAILURE: i32 = 4;
pub const EXIT_SEQUENCE_OVERFLOW: i32 = 5;

const STDIN_FD: RawFd = 0;
const STDOUT_FD: RawFd = 1;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("sequence starting at {start} cannot hold {count} values")]
    SequenceOverflow { start: Record, count: usize },

    /// Fault injection: the producer stopped on purpose mid-sequence.
    #[error("producer aborted after {sent} records")]
    Aborted { sent: usize },
}

impl WorkerError {
    /// How a worker failing with this error terminates.
    pub fn exit(&self) -> WorkerExit {
        match self {
            Self::Channel(ChannelError::BrokenChannel(_)) => WorkerExit::Exited {
                code: EXIT_BROKEN_CHANNEL,
            },
            Self::Channel(_) => WorkerExit::Exited {
                code: EXIT_IO_FAILURE,
            },
            Self::SequenceOverflow { .. } => WorkerExit::Exited {
                code: EXIT_SEQUENCE_OVERFLOW,
            },
            Self::Aborted { .. } => WorkerExit::Signaled {
                signal: nix::sys::signal::Signal::SIGKILL as i32,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub start_value: Record,
    pub num_values: usize,
    pub delay: Duration,
    /// Kill the producer after this many records have been sent.
    pub abort_after: Option<usize>,
}

impl ProducerConfig {
    pub fn new(start_value: Record) -> Self {
        Self {
            start_value,
            num_values: NUM_VALUES,
            delay: DEFAULT_RECORD_DELAY,
            abort_after: None,
        }
    }

    pub fn with_num_values(mut self, n: usize) -> Self {
        self.num_values = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_abort_after(mut self, sent: Option<usize>) -> Self {
        self.abort_after = sent;
        self
    }

    /// Last value of the sequence, or `None` if it does not fit in a record.
    pub fn last_value(&self) -> Option<Record> {
        let span = Record::try_from(self.num_values.saturating_sub(1)).ok()?;
        self.start_value.checked_add(span)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    pub sent: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub pair_id: u32,
    pub count: usize,
    pub sum: i64,
}

/// Emit `start_value..start_value+num_values` in order, then close the write end.
///
/// Any write failure is returned immediately; there is no retry. Returning
/// early drops the writer, which closes the endpoint just as process teardown
/// would.
pub async fn run_producer(
    write_end: WriteEnd,
    config: &ProducerConfig,
) -> Result<ProducerReport, WorkerError> {
    let pid = std::process::id();
    tracing::info!(pid, start_value = config.start_value, "Producer starting");

    if config.num_values > 0 && config.last_value().is_none() {
        return Err(WorkerError::SequenceOverflow {
            start: config.start_value,
            count: config.num_values,
        });
    }

    let mut writer = RecordWriter::new(write_end)?;
    let mut value = config.start_value;

    for sent in 0..config.num_values {
        if config.abort_after == Some(sent) {
            tracing::warn!(pid, sent, "Producer aborting mid-sequence");
            return Err(WorkerError::Aborted { sent });
        }

        writer.write_record(value).await?;
        tracing::info!(value, "Producer sent number");

        if !config.delay.is_zero() {
            tokio::time::sleep(config.delay).await;
        }
        // Overflow ruled out by last_value() above
        value = value.wrapping_add(1);
    }

    writer.close().await?;
    tracing::info!(pid, sent = config.num_values, "Producer finished sending");

    Ok(ProducerReport {
        sent: config.num_values,
    })
}

/// Drain records until end-of-stream, accumulating count and sum.
pub async fn run_consumer(read_end: ReadEnd, pair_id: u32) -> Result<ConsumerReport, WorkerError> {
    let pid = std::process::id();
    tracing::info!(pid, pair_id, "Consumer starting");

    let mut reader = RecordReader::new(read_end)?;
    let mut report = ConsumerReport {
        pair_id,
        count: 0,
        sum: 0,
    };

    while let Some(value) = reader.read_record().await? {
        report.count += 1;
        report.sum += i64::from(value);
        tracing::info!(pair_id, value, sum = report.sum, "Consumer received number");
    }

    reader.close();
    tracing::info!(
        pid,
        pair_id,
        count = report.count,
        sum = report.sum,
        "Consumer finished"
    );

    Ok(report)
}

/// Producer entry point inside a spawned worker process. Returns the exit code.
pub async fn run_producer_process(config: ProducerConfig) -> i32 {
    // Safety: the spawner installs the channel write end as fd 1 and nothing in
    // this process writes to stdout (tracing goes to stderr). We take sole
    // ownership so closing the endpoint really closes the descriptor.
    let write_end = unsafe { WriteEnd::from_raw_fd(STDOUT_FD) };

    match run_producer(write_end, &config).await {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!(error = %e, "Producer failed");
            exit_process(e.exit())
        }
    }
}

/// Consumer entry point inside a spawned worker process. Returns the exit code.
pub async fn run_consumer_process(pair_id: u32) -> i32 {
    // Safety: the spawner installs the channel read end as fd 0 and nothing else
    // in this process reads stdin.
    let read_end = unsafe { ReadEnd::from_raw_fd(STDIN_FD) };

    match run_consumer(read_end, pair_id).await {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!(pair_id, error = %e, "Consumer failed");
            exit_process(e.exit())
        }
    }
}

fn exit_process(exit: WorkerExit) -> i32 {
    match exit {
        WorkerExit::Exited { code } => code,
        WorkerExit::Signaled { signal } => {
            let signal = nix::sys::signal::Signal::try_from(signal)
                .unwrap_or(nix::sys::signal::Signal::SIGKILL);
            let _ = nix::sys::signal::raise(signal);
            std::process::abort()
        }
    }
}
