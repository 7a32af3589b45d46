//! Worker slots: one per resource index, slot 0 being the proxy.
//!
//! The [`Registry`] owns the fixed slot table and the reader catalog. Records
//! are created lazily on first dispatch (or all at once via `start_all`) and
//! swapped only by the [`Supervisor`](crate::supervisor::Supervisor).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared_types::{Command, ResourceIndex, WorkerSnapshot};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::channel::{deadline_after, DispatcherEnds};
use crate::config::{Config, DispatchConfig};
use crate::error::DispatchError;
use crate::supervisor::{ExecutionHandle, Supervisor, WorkerFactory};

/// The current execution unit of one slot and its Channel Triple.
///
/// Records are never mutated after installation; a dead unit is replaced by a
/// new record with a higher generation.
#[derive(Debug)]
pub struct WorkerRecord {
    pub index: ResourceIndex,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub(crate) handle: Box<dyn ExecutionHandle>,
    pub(crate) channels: DispatcherEnds,
}

impl WorkerRecord {
    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    pub fn channels(&self) -> &DispatcherEnds {
        &self.channels
    }

    /// Kill the unit; the next dispatch to this slot starts a replacement.
    pub fn terminate(&self) {
        self.handle.terminate();
    }
}

/// Static reader name -> slot map. Slot 0 is the proxy slot.
#[derive(Debug, Clone)]
pub struct ReaderCatalog {
    readers: Vec<String>,
}

impl ReaderCatalog {
    pub fn new(readers: Vec<String>) -> Self {
        Self { readers }
    }

    pub fn slot_count(&self) -> usize {
        self.readers.len() + 1
    }

    /// No reader means the proxy slot.
    pub fn resolve(&self, reader: Option<&str>) -> Result<ResourceIndex, DispatchError> {
        let Some(name) = reader else {
            return Ok(ResourceIndex::PROXY);
        };
        self.readers
            .iter()
            .position(|r| r == name)
            .map(|pos| ResourceIndex(pos + 1))
            .ok_or_else(|| DispatchError::UnknownReader(name.to_string()))
    }

    pub fn reader_at(&self, index: ResourceIndex) -> Option<&str> {
        match index.get() {
            0 => None,
            i => self.readers.get(i - 1).map(String::as_str),
        }
    }

    pub fn readers(&self) -> &[String] {
        &self.readers
    }
}

pub(crate) struct Slot {
    pub(crate) index: ResourceIndex,
    pub(crate) reader: Option<String>,
    /// Guards creation and replacement of the record.
    pub(crate) record: Mutex<Option<Arc<WorkerRecord>>>,
    /// Held for the full push -> ack -> result cycle of one dispatch.
    dispatch: Mutex<()>,
    pub(crate) generations: AtomicU64,
    pub(crate) restarts: AtomicU64,
}

impl Slot {
    pub(crate) fn new(index: ResourceIndex, reader: Option<String>) -> Self {
        Self {
            index,
            reader,
            record: Mutex::new(None),
            dispatch: Mutex::new(()),
            generations: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }
}

/// Fixed table of worker slots, one per resource index.
pub struct Registry {
    catalog: ReaderCatalog,
    slots: Vec<Slot>,
    supervisor: Supervisor,
    config: DispatchConfig,
}

impl Registry {
    pub fn new(config: &Config, factory: Arc<dyn WorkerFactory>) -> Arc<Self> {
        let catalog = ReaderCatalog::new(config.readers.clone());
        let slots = (0..catalog.slot_count())
            .map(|i| {
                let index = ResourceIndex(i);
                Slot::new(index, catalog.reader_at(index).map(ToString::to_string))
            })
            .collect();

        Arc::new(Self {
            catalog,
            slots,
            supervisor: Supervisor::new(factory),
            config: config.dispatch.clone(),
        })
    }

    pub fn catalog(&self) -> &ReaderCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn resolve(&self, reader: Option<&str>) -> Result<ResourceIndex, DispatchError> {
        self.catalog.resolve(reader)
    }

    pub(crate) fn slot(&self, index: ResourceIndex) -> Result<&Slot, DispatchError> {
        if self.supervisor.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }
        self.slots
            .get(index.get())
            .ok_or(DispatchError::UnknownResource {
                index,
                slots: self.slots.len(),
            })
    }

    /// Serialize a full dispatch cycle on one slot.
    pub(crate) async fn lock_dispatch<'a>(&self, slot: &'a Slot) -> MutexGuard<'a, ()> {
        slot.dispatch.lock().await
    }

    /// Start the slot's worker if it has never been started.
    pub async fn ensure_started(
        &self,
        index: ResourceIndex,
    ) -> Result<Arc<WorkerRecord>, DispatchError> {
        let slot = self.slot(index)?;
        self.supervisor.ensure_started(slot).await
    }

    /// Current record without starting anything.
    pub async fn get(&self, index: ResourceIndex) -> Result<Option<Arc<WorkerRecord>>, DispatchError> {
        let slot = self.slot(index)?;
        let current = slot.record.lock().await;
        Ok(current.clone())
    }

    pub(crate) async fn replace_if_dead(
        &self,
        index: ResourceIndex,
        observed_generation: u64,
    ) -> Result<Arc<WorkerRecord>, DispatchError> {
        let slot = self.slot(index)?;
        self.supervisor
            .replace_if_dead(slot, observed_generation)
            .await
    }

    /// Warm up every slot.
    pub async fn start_all(&self) -> Result<(), DispatchError> {
        for slot in &self.slots {
            self.supervisor.ensure_started(slot).await?;
        }
        info!(slots = self.slots.len(), "all reader workers started");
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let current = slot.record.lock().await;
            out.push(WorkerSnapshot {
                index: slot.index,
                reader: slot.reader.clone(),
                generation: current.as_ref().map_or(0, |r| r.generation),
                started_at: current.as_ref().map(|r| r.started_at),
                alive: current.as_ref().is_some_and(|r| r.is_alive()),
                restarts: slot.restarts.load(Ordering::SeqCst),
            });
        }
        out
    }

    /// Ask every worker to stop, then terminate whatever is still running after the grace period.
    ///
    /// Dispatches already in flight finish against their record; new ones fail with
    /// [`DispatchError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if !self.supervisor.close() {
            return;
        }

        let mut stopping = Vec::new();
        for slot in &self.slots {
            let Some(record) = slot.record.lock().await.take() else {
                continue;
            };
            if record.is_alive() && record.channels().push_work(Command::shutdown()).is_ok() {
                debug!(index = %slot.index, generation = record.generation, "shutdown queued");
            }
            stopping.push(record);
        }

        let deadline = deadline_after(self.config.shutdown_grace);
        while stopping.iter().any(|r| r.is_alive()) && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }

        for record in stopping.iter().filter(|r| r.is_alive()) {
            warn!(
                index = %record.index,
                generation = record.generation,
                "worker did not stop within grace period, terminating"
            );
            record.terminate();
        }
        info!(workers = stopping.len(), "reader workers stopped");
    }
}
