//! Worker start and replacement.
//!
//! Starting an execution unit is delegated to a [`WorkerFactory`]; the
//! [`Supervisor`] owns the discipline around it: a slot's record is only ever
//! created or swapped while that slot's record lock is held, and a dead
//! generation is re-checked under the lock before a replacement is started.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared_types::ResourceIndex;
use tracing::{error, info, warn};

use crate::channel::DispatcherEnds;
use crate::error::DispatchError;
use crate::registry::{Slot, WorkerRecord};

/// Liveness view of one running execution unit.
pub trait ExecutionHandle: Send + Sync + fmt::Debug {
    /// Once this returns false it never returns true again.
    fn is_alive(&self) -> bool;

    /// Stop the unit without waiting for queued work.
    fn terminate(&self);
}

/// What the factory needs to know about the unit it starts.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub index: ResourceIndex,
    /// Reader bound to the slot; `None` for the proxy slot.
    pub reader: Option<String>,
    pub generation: u64,
}

impl WorkerSpec {
    pub fn display_name(&self) -> String {
        format!(
            "reader_worker_{}",
            self.reader.as_deref().unwrap_or("proxy")
        )
    }
}

/// A freshly started unit plus the dispatcher ends of the triple it owns.
#[derive(Debug)]
pub struct StartedWorker {
    pub handle: Box<dyn ExecutionHandle>,
    pub channels: DispatcherEnds,
}

#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Start a new execution unit with its own Channel Triple.
    async fn start_worker(&self, spec: WorkerSpec) -> anyhow::Result<StartedWorker>;
}

pub struct Supervisor {
    factory: Arc<dyn WorkerFactory>,
    /// Once set, no slot gets a new record.
    closed: AtomicBool,
}

impl Supervisor {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop starting workers. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Install a record if the slot has never been started.
    pub(crate) async fn ensure_started(
        &self,
        slot: &Slot,
    ) -> Result<Arc<WorkerRecord>, DispatchError> {
        let mut current = slot.record.lock().await;
        if self.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }
        if let Some(record) = current.as_ref() {
            return Ok(Arc::clone(record));
        }

        let record = self.start(slot).await?;
        *current = Some(Arc::clone(&record));
        Ok(record)
    }

    /// Replace `observed_generation` if it is still the installed record and still dead.
    ///
    /// Returns whatever record is installed afterwards; a caller that lost the
    /// race gets the replacement somebody else started.
    pub(crate) async fn replace_if_dead(
        &self,
        slot: &Slot,
        observed_generation: u64,
    ) -> Result<Arc<WorkerRecord>, DispatchError> {
        let mut current = slot.record.lock().await;
        // Shutdown may have emptied the slot while we waited for the lock.
        if self.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }

        if let Some(record) = current.as_ref() {
            if record.generation != observed_generation {
                info!(
                    index = %slot.index,
                    generation = record.generation,
                    "worker already replaced by another caller"
                );
                return Ok(Arc::clone(record));
            }
            if record.is_alive() {
                return Ok(Arc::clone(record));
            }
            record.terminate();
        }

        let record = self.start(slot).await?;
        slot.restarts.fetch_add(1, Ordering::SeqCst);
        *current = Some(Arc::clone(&record));
        info!(
            index = %slot.index,
            reader = slot.reader.as_deref().unwrap_or("proxy"),
            generation = record.generation,
            "replacement worker started"
        );
        Ok(record)
    }

    async fn start(&self, slot: &Slot) -> Result<Arc<WorkerRecord>, DispatchError> {
        let generation = slot.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let spec = WorkerSpec {
            index: slot.index,
            reader: slot.reader.clone(),
            generation,
        };
        let name = spec.display_name();

        let started = self.factory.start_worker(spec).await.map_err(|source| {
            error!(index = %slot.index, worker = %name, "failed to start worker: {source}");
            DispatchError::WorkerStart {
                index: slot.index,
                source,
            }
        })?;

        if !started.handle.is_alive() {
            warn!(index = %slot.index, worker = %name, generation, "worker exited during start");
        }
        info!(index = %slot.index, worker = %name, generation, "worker started");

        Ok(Arc::new(WorkerRecord {
            index: slot.index,
            generation,
            started_at: Utc::now(),
            handle: started.handle,
            channels: started.channels,
        }))
    }
}
