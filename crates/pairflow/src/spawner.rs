//! Worker spawn strategies.
//!
//! Spawning consumes a [`WorkerSpec`], and with it the one endpoint the worker
//! will own. Whatever the strategy does internally, the caller is left without
//! a copy of that endpoint once `spawn` returns, successful or not.
//!
//! - **ExecSpawner**: re-executes the `pairflow` binary as a worker process
//! - **TaskSpawner**: runs the worker as a tokio task in this process

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::channel::{ReadEnd, WriteEnd};
use crate::outcome::{WorkerExit, WorkerRole};
use crate::worker::{ProducerConfig, WorkerError, run_consumer, run_producer};

/// Everything a worker needs to start: its role, its endpoint and its parameters.
#[derive(Debug)]
pub enum WorkerSpec {
    Producer {
        pair_id: u32,
        write_end: WriteEnd,
        config: ProducerConfig,
    },
    Consumer {
        pair_id: u32,
        read_end: ReadEnd,
    },
}

impl WorkerSpec {
    pub fn role(&self) -> WorkerRole {
        match self {
            Self::Producer { .. } => WorkerRole::Producer,
            Self::Consumer { .. } => WorkerRole::Consumer,
        }
    }

    pub fn pair_id(&self) -> u32 {
        match self {
            Self::Producer { pair_id, .. } | Self::Consumer { pair_id, .. } => *pair_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("failed to wait for worker: {0}")]
    Wait(#[from] io::Error),
    #[error("worker task failed: {0}")]
    Task(String),
}

/// A running worker that can be waited on exactly once.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if the worker is a separate process.
    fn pid(&self) -> Option<u32>;

    /// Block until the worker terminates.
    async fn wait(&mut self) -> Result<WorkerExit, WaitError>;
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

/// Spawns workers by re-executing the `pairflow` binary with the hidden
/// `worker` subcommand.
///
/// The producer gets its write end as stdout, the consumer its read end as
/// stdin. Endpoints are close-on-exec, so nothing else leaks into the child.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    envs: Vec<(String, String)>,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            envs: Vec::new(),
        }
    }

    /// Spawner that re-executes the running binary.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Set an environment variable on every spawned worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn command(&self, spec: WorkerSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stderr(Stdio::inherit());

        match spec {
            WorkerSpec::Producer {
                pair_id,
                write_end,
                config,
            } => {
                command
                    .arg("producer")
                    .args(["--pair-id", &pair_id.to_string()])
                    .args(["--start", &config.start_value.to_string()])
                    .args(["--count", &config.num_values.to_string()])
                    .args(["--delay-ms", &config.delay.as_millis().to_string()]);
                if let Some(sent) = config.abort_after {
                    command.args(["--abort-after", &sent.to_string()]);
                }
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::from(write_end.into_owned_fd()));
            }
            WorkerSpec::Consumer { pair_id, read_end } => {
                command
                    .arg("consumer")
                    .args(["--pair-id", &pair_id.to_string()]);
                command
                    .stdin(Stdio::from(read_end.into_owned_fd()))
                    .stdout(Stdio::null());
            }
        }

        command
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let role = spec.role();
        let pair_id = spec.pair_id();

        let mut command = self.command(spec);
        let spawned = command.spawn();
        // The command holds our copy of the endpoint; dropping it closes that copy
        // whether or not the spawn went through.
        drop(command);

        let child = spawned?;
        let pid = child.id();
        tracing::info!(?pid, %role, pair_id, "Created {} child", role);

        Ok(Box::new(ChildProcess { child, pid }))
    }
}

struct ChildProcess {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<WorkerExit, WaitError> {
        let status = self.child.wait().await?;
        Ok(WorkerExit::from(status))
    }
}

/// Runs workers as tokio tasks inside the current runtime.
///
/// Failures map to the same [`WorkerExit`] a worker process would produce.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskSpawner;

impl WorkerSpawner for TaskSpawner {
    fn spawn(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpawnError::Other(format!("no tokio runtime: {}", e)))?;

        let role = spec.role();
        let pair_id = spec.pair_id();

        let task = match spec {
            WorkerSpec::Producer {
                write_end, config, ..
            } => runtime.spawn(async move { run_producer(write_end, &config).await.map(|_| ()) }),
            WorkerSpec::Consumer { pair_id, read_end } => {
                runtime.spawn(async move { run_consumer(read_end, pair_id).await.map(|_| ()) })
            }
        };

        tracing::debug!(%role, pair_id, "Spawned in-process worker");
        Ok(Box::new(TaskProcess { task }))
    }
}

struct TaskProcess {
    task: JoinHandle<Result<(), WorkerError>>,
}

#[async_trait]
impl WorkerProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<WorkerExit, WaitError> {
        match (&mut self.task).await {
            Ok(Ok(())) => Ok(WorkerExit::success()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "In-process worker failed");
                Ok(e.exit())
            }
            Err(e) => Err(WaitError::Task(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::Channel;

    #[test]
    fn spec_reports_role_and_pair() {
        let (read_end, _write_end) = Channel::create().unwrap().into_split();
        let spec = WorkerSpec::Consumer {
            pair_id: 7,
            read_end,
        };
        assert_eq!(spec.role(), WorkerRole::Consumer);
        assert_eq!(spec.pair_id(), 7);
    }

    #[test]
    fn producer_command_line() {
        let (_read_end, write_end) = Channel::create().unwrap().into_split();
        let spawner = ExecSpawner::new("/usr/bin/pairflow");
        let command = spawner.command(WorkerSpec::Producer {
            pair_id: 2,
            write_end,
            config: ProducerConfig::new(6)
                .with_delay(Duration::from_millis(25))
                .with_abort_after(Some(2)),
        });

        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "worker",
                "producer",
                "--pair-id",
                "2",
                "--start",
                "6",
                "--count",
                "5",
                "--delay-ms",
                "25",
                "--abort-after",
                "2",
            ]
        );
    }

    #[test]
    fn configured_env_reaches_workers() {
        let (read_end, _write_end) = Channel::create().unwrap().into_split();
        let spawner = ExecSpawner::new("/usr/bin/pairflow").with_env("PAIRFLOW_LOG", "off");
        let command = spawner.command(WorkerSpec::Consumer {
            pair_id: 1,
            read_end,
        });

        let envs: Vec<_> = command
            .as_std()
            .get_envs()
            .map(|(k, v)| (k.to_owned(), v.map(|v| v.to_owned())))
            .collect();
        assert_eq!(envs, vec![("PAIRFLOW_LOG".into(), Some("off".into()))]);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let (read_end, _write_end) = Channel::create().unwrap().into_split();
        let spawner = ExecSpawner::new("/nonexistent/pairflow-worker");
        let result = spawner.spawn(WorkerSpec::Consumer {
            pair_id: 1,
            read_end,
        });
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }

    #[tokio::test]
    async fn task_spawner_runs_both_roles() {
        let (read_end, write_end) = Channel::create().unwrap().into_split();

        let mut producer = TaskSpawner
            .spawn(WorkerSpec::Producer {
                pair_id: 1,
                write_end,
                config: ProducerConfig::new(1).with_delay(Duration::ZERO),
            })
            .unwrap();
        let mut consumer = TaskSpawner
            .spawn(WorkerSpec::Consumer {
                pair_id: 1,
                read_end,
            })
            .unwrap();

        assert_eq!(producer.pid(), None);
        assert_eq!(producer.wait().await.unwrap(), WorkerExit::success());
        assert_eq!(consumer.wait().await.unwrap(), WorkerExit::success());
    }

    #[tokio::test]
    async fn task_spawner_reports_abort_as_signal() {
        let (read_end, write_end) = Channel::create().unwrap().into_split();

        let mut producer = TaskSpawner
            .spawn(WorkerSpec::Producer {
                pair_id: 1,
                write_end,
                config: ProducerConfig::new(1)
                    .with_delay(Duration::ZERO)
                    .with_abort_after(Some(1)),
            })
            .unwrap();
        let mut consumer = TaskSpawner
            .spawn(WorkerSpec::Consumer {
                pair_id: 1,
                read_end,
            })
            .unwrap();

        assert_eq!(
            producer.wait().await.unwrap(),
            WorkerExit::Signaled { signal: 9 }
        );
        assert_eq!(consumer.wait().await.unwrap(), WorkerExit::success());
    }
}
