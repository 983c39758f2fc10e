//! Termination outcome types for workers and pairs.

use std::fmt;
use std::process::ExitStatus;

use serde::Serialize;

/// Role a worker plays within its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Producer,
    Consumer,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerExit {
    /// Returned from its entry point with an exit code.
    Exited { code: i32 },
    /// Killed by a signal before it could exit.
    Signaled { signal: i32 },
}

impl WorkerExit {
    pub fn success() -> Self {
        Self::Exited { code: 0 }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// Status as the classic report prints it: the exit code, or `1` for any
    /// abnormal termination.
    pub fn legacy_status(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            Self::Signaled { .. } => 1,
        }
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match status.code() {
            Some(code) => Self::Exited { code },
            None => Self::Signaled {
                signal: status.signal().unwrap_or_default(),
            },
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with status {code}"),
            Self::Signaled { signal } => match nix::sys::signal::Signal::try_from(*signal) {
                Ok(sig) => write!(f, "terminated by signal {signal} ({sig})"),
                Err(_) => write!(f, "terminated by signal {signal}"),
            },
        }
    }
}

/// Final status of one worker as observed by its coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationOutcome {
    pub pair_id: u32,
    pub role: WorkerRole,
    /// OS process id, absent for in-process workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub exit: WorkerExit,
}

impl TerminationOutcome {
    pub fn new(pair_id: u32, role: WorkerRole, pid: Option<u32>, exit: WorkerExit) -> Self {
        Self {
            pair_id,
            role,
            pid,
            exit,
        }
    }
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "Child (PID: {pid})")?,
            None => f.write_str("Child (in-process)")?,
        }
        write!(f, " [pair {} {}] {}", self.pair_id, self.role, self.exit)
    }
}

/// Both outcomes of one producer/consumer pair.
///
/// The consumer's sum is not part of this: it is reported by the consumer
/// itself and never travels back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairResult {
    pub pair_id: u32,
    pub producer: TerminationOutcome,
    pub consumer: TerminationOutcome,
}

impl PairResult {
    /// Outcomes in reporting order: producer first.
    pub fn outcomes(&self) -> [&TerminationOutcome; 2] {
        [&self.producer, &self.consumer]
    }

    pub fn succeeded(&self) -> bool {
        self.producer.exit.is_success() && self.consumer.exit.is_success()
    }
}
