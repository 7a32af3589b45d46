//! Test doubles shared by the gateway integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway::channel::{self, WorkerEnds};
use gateway::{
    CommandHandler, Config, DispatchConfig, StartedWorker, TaskHandle, TaskWorkerFactory,
    WorkerConfig, WorkerFactory, WorkerSpec,
};
use shared_types::{
    AckSignal, Command, CommandKind, MessageType, PriorityReport, ResourceIndex, ResultMessage,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Short bounds so failure paths resolve quickly.
pub fn fast_config(readers: &[&str]) -> Config {
    Config {
        readers: readers.iter().map(|r| r.to_string()).collect(),
        dispatch: DispatchConfig {
            ack_poll_interval: Duration::from_millis(10),
            ack_deadline: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(500),
        },
        worker: WorkerConfig {
            max_uptime: Duration::from_secs(60),
            max_runs: 1000,
            reaction_time: Duration::from_millis(20),
        },
    }
}

/// Answers `<payload>-processed` and tracks how many commands run at once per slot.
#[derive(Default)]
pub struct ReaderHandler {
    pub delay: Duration,
    pub report: Mutex<PriorityReport>,
    in_flight: Mutex<HashMap<ResourceIndex, usize>>,
    pub max_in_flight: AtomicUsize,
    pub executed: AtomicUsize,
}

impl ReaderHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn with_report(report: PriorityReport) -> Self {
        Self {
            report: Mutex::new(report),
            ..Self::default()
        }
    }

    fn enter(&self, index: ResourceIndex) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let n = in_flight.entry(index).or_insert(0);
        *n += 1;
        self.max_in_flight.fetch_max(*n, Ordering::SeqCst);
    }

    fn leave(&self, index: ResourceIndex) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(n) = in_flight.get_mut(&index) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl CommandHandler for ReaderHandler {
    async fn execute(
        &self,
        index: ResourceIndex,
        command: &Command,
    ) -> anyhow::Result<serde_json::Value> {
        self.enter(index);
        let delay = command
            .payload
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.leave(index);

        let text = match &command.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        };
        Ok(serde_json::json!(format!("{text}-processed")))
    }

    async fn prioritize(&self, _name: &str, _limit: u32) -> anyhow::Result<PriorityReport> {
        Ok(self.report.lock().unwrap().clone())
    }
}

/// How one worker generation behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Delegate to the real task runtime.
    Normal,
    /// Take one command off the queue and exit without acking.
    DieBeforeAck,
    /// Ack everything, never answer.
    Silent,
    /// Never ack, never exit.
    Mute,
    /// Ack with the wrong type tag, then answer normally.
    WrongAck,
    /// Ack normally, then answer with a swapped result type tag.
    Mistagged,
    /// Fail to start.
    Broken,
}

/// Factory whose generations follow a per-generation script.
pub struct ScriptedFactory {
    inner: TaskWorkerFactory<ReaderHandler>,
    handler: Arc<ReaderHandler>,
    script: Mutex<HashMap<u64, Behavior>>,
    fallback: Behavior,
    starts: Mutex<HashMap<ResourceIndex, usize>>,
    pub total_starts: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(handler: Arc<ReaderHandler>, config: WorkerConfig, fallback: Behavior) -> Self {
        Self {
            inner: TaskWorkerFactory::new(handler.clone(), config),
            handler,
            script: Mutex::new(HashMap::new()),
            fallback,
            starts: Mutex::new(HashMap::new()),
            total_starts: AtomicUsize::new(0),
        }
    }

    pub fn normal(handler: Arc<ReaderHandler>, config: WorkerConfig) -> Self {
        Self::new(handler, config, Behavior::Normal)
    }

    /// Generation `generation` (of any slot) behaves as `behavior`.
    pub fn on_generation(self, generation: u64, behavior: Behavior) -> Self {
        self.script.lock().unwrap().insert(generation, behavior);
        self
    }

    pub fn starts(&self, index: ResourceIndex) -> usize {
        self.starts.lock().unwrap().get(&index).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WorkerFactory for ScriptedFactory {
    async fn start_worker(&self, spec: WorkerSpec) -> anyhow::Result<StartedWorker> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .get(&spec.generation)
            .copied()
            .unwrap_or(self.fallback);

        if behavior == Behavior::Broken {
            return Err(anyhow::anyhow!("reader {} unplugged", spec.index));
        }

        // Slow the start down so racing callers overlap inside the critical section.
        tokio::time::sleep(Duration::from_millis(5)).await;
        *self.starts.lock().unwrap().entry(spec.index).or_insert(0) += 1;
        self.total_starts.fetch_add(1, Ordering::SeqCst);

        if behavior == Behavior::Normal {
            return self.inner.start_worker(spec).await;
        }

        let (dispatcher, ends) = channel::triple();
        let join = tokio::spawn(scripted_worker(behavior, spec, ends, self.handler.clone()));
        Ok(StartedWorker {
            handle: Box::new(TaskHandle::new(join)),
            channels: dispatcher,
        })
    }
}

async fn scripted_worker(
    behavior: Behavior,
    spec: WorkerSpec,
    mut ends: WorkerEnds,
    handler: Arc<ReaderHandler>,
) {
    match behavior {
        Behavior::DieBeforeAck => {
            let _ = ends.work.recv().await;
        }
        Behavior::Silent => {
            while let Some(command) = ends.work.recv().await {
                let _ = ends.ack.send(AckSignal::ack(command.id));
            }
        }
        Behavior::Mute => {
            while ends.work.recv().await.is_some() {}
        }
        Behavior::WrongAck => {
            while let Some(command) = ends.work.recv().await {
                let _ = ends.ack.send(AckSignal {
                    command_id: command.id.clone(),
                    message_type: MessageType::Response,
                });
                let _ = ends.result.send(ResultMessage::response(
                    command.id,
                    spec.index,
                    spec.generation,
                    serde_json::json!("late-ack"),
                ));
            }
        }
        Behavior::Mistagged => {
            while let Some(command) = ends.work.recv().await {
                let _ = ends.ack.send(AckSignal::ack(command.id.clone()));
                let mut result = match command.kind {
                    CommandKind::SelectTerminal { .. } | CommandKind::SelectInfo => {
                        let report = handler.report.lock().unwrap().clone();
                        ResultMessage::priority(command.id, spec.index, spec.generation, report)
                    }
                    _ => ResultMessage::response(
                        command.id,
                        spec.index,
                        spec.generation,
                        serde_json::json!("mistagged"),
                    ),
                };
                result.message_type = match result.message_type {
                    MessageType::Priority => MessageType::Response,
                    _ => MessageType::Priority,
                };
                let _ = ends.result.send(result);
            }
        }
        Behavior::Normal | Behavior::Broken => {}
    }
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
