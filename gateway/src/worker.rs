//! In-process reader workers.
//!
//! [`TaskWorkerFactory`] runs each worker generation as a tokio task. The task
//! acknowledges a command the moment it takes it off the work queue, runs it
//! through the [`CommandHandler`], and delivers exactly one result. A worker
//! retires once it is older than `max_uptime` or has processed `max_runs`
//! commands: it closes its work queue, finishes what is already queued, and
//! exits, after which the dispatcher starts the next generation on demand.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{AckSignal, Command, CommandKind, PriorityReport, ResourceIndex, ResultMessage};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info};

use crate::channel::{self, WorkerEnds};
use crate::config::WorkerConfig;
use crate::supervisor::{ExecutionHandle, StartedWorker, WorkerFactory, WorkerSpec};

/// Executes commands against the reader hardware.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn execute(
        &self,
        index: ResourceIndex,
        command: &Command,
    ) -> anyhow::Result<serde_json::Value>;

    /// Rank the terminals matching `name`, at most `limit` of them.
    async fn prioritize(&self, name: &str, limit: u32) -> anyhow::Result<PriorityReport>;

    /// Current ranking without changes.
    async fn select_info(&self) -> anyhow::Result<PriorityReport> {
        self.prioritize("", 0).await
    }
}

pub struct TaskWorkerFactory<H> {
    handler: Arc<H>,
    config: WorkerConfig,
}

impl<H: CommandHandler> TaskWorkerFactory<H> {
    pub fn new(handler: Arc<H>, config: WorkerConfig) -> Self {
        Self { handler, config }
    }
}

#[async_trait]
impl<H: CommandHandler> WorkerFactory for TaskWorkerFactory<H> {
    async fn start_worker(&self, spec: WorkerSpec) -> anyhow::Result<StartedWorker> {
        let (dispatcher, ends) = channel::triple();
        let runtime = WorkerRuntime {
            name: spec.display_name(),
            index: spec.index,
            generation: spec.generation,
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            ends,
            started: Instant::now(),
            runs: 0,
        };
        let join = tokio::spawn(runtime.run());

        Ok(StartedWorker {
            handle: Box::new(TaskHandle { join }),
            channels: dispatcher,
        })
    }
}

/// Liveness of a worker task.
#[derive(Debug)]
pub struct TaskHandle {
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(join: JoinHandle<()>) -> Self {
        Self { join }
    }
}

impl ExecutionHandle for TaskHandle {
    fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    fn terminate(&self) {
        self.join.abort();
    }
}

struct WorkerRuntime<H> {
    name: String,
    index: ResourceIndex,
    generation: u64,
    handler: Arc<H>,
    config: WorkerConfig,
    ends: WorkerEnds,
    started: Instant,
    runs: u64,
}

enum Flow {
    Continue,
    Stop,
}

impl<H: CommandHandler> WorkerRuntime<H> {
    async fn run(mut self) {
        debug!(worker = %self.name, generation = self.generation, "worker running");

        loop {
            if self.time_is_up() {
                info!(
                    worker = %self.name,
                    generation = self.generation,
                    uptime_secs = self.started.elapsed().as_secs(),
                    runs = self.runs,
                    "worker retiring"
                );
                break;
            }
            let next = timeout(self.config.reaction_time, self.ends.work.recv()).await;
            match next {
                Ok(Some(command)) => {
                    if let Flow::Stop = self.accept(command).await {
                        break;
                    }
                }
                Ok(None) => break,
                // Idle; re-check the retirement limits.
                Err(_) => continue,
            }
        }

        // Anything pushed before the queue closed still gets an answer.
        self.ends.work.close();
        while let Ok(command) = self.ends.work.try_recv() {
            debug!(worker = %self.name, command_id = %command.id, "processing queued command after stop");
            self.accept(command).await;
        }
        info!(worker = %self.name, generation = self.generation, runs = self.runs, "worker terminated");
    }

    fn time_is_up(&self) -> bool {
        self.started.elapsed() >= self.config.max_uptime || self.runs >= self.config.max_runs
    }

    async fn accept(&mut self, command: Command) -> Flow {
        let _ = self.ends.ack.send(AckSignal::ack(command.id.clone()));
        self.runs += 1;

        let (result, flow) = self.process(command).await;
        let _ = self.ends.result.send(result);
        debug!(
            worker = %self.name,
            runs = self.runs,
            uptime_secs = self.started.elapsed().as_secs(),
            "worker completed a request"
        );
        flow
    }

    async fn process(&self, command: Command) -> (ResultMessage, Flow) {
        let id = command.id.clone();
        let (index, generation) = (self.index, self.generation);

        match &command.kind {
            CommandKind::Shutdown => {
                info!(worker = %self.name, "shutdown command received");
                let value = serde_json::json!({ "stopped": true, "runs": self.runs });
                (
                    ResultMessage::response(id, index, generation, value),
                    Flow::Stop,
                )
            }
            CommandKind::Execute => {
                let result = match self.handler.execute(index, &command).await {
                    Ok(value) => ResultMessage::response(id, index, generation, value),
                    Err(e) => {
                        error!(worker = %self.name, command_id = %command.id, "command failed: {e}");
                        ResultMessage::failed(id, index, generation, e.to_string())
                    }
                };
                (result, Flow::Continue)
            }
            CommandKind::SelectTerminal { name, limit } => {
                let result = match self.handler.prioritize(name, *limit).await {
                    Ok(report) => ResultMessage::priority(id, index, generation, report),
                    Err(e) => {
                        error!(worker = %self.name, terminal = %name, "terminal selection failed: {e}");
                        ResultMessage::failed(id, index, generation, e.to_string())
                    }
                };
                (result, Flow::Continue)
            }
            CommandKind::SelectInfo => {
                let result = match self.handler.select_info().await {
                    Ok(report) => ResultMessage::priority(id, index, generation, report),
                    Err(e) => {
                        error!(worker = %self.name, "terminal listing failed: {e}");
                        ResultMessage::failed(id, index, generation, e.to_string())
                    }
                };
                (result, Flow::Continue)
            }
        }
    }
}
