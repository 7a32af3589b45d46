//! Reader gateway core
//!
//! Routes every inbound command to the long-lived worker that owns its reader,
//! replaces workers that died before acknowledging, and returns one bounded-time
//! result per command.
//!
//! The request-handling layer builds one [`Registry`] and one [`Dispatcher`] at
//! startup and shares them by `Arc`/clone; there is no global state.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use config::{Config, DispatchConfig, WorkerConfig};
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use metadata::{MetadataStore, ReaderMetadataStore};
pub use registry::{ReaderCatalog, Registry, WorkerRecord};
pub use supervisor::{ExecutionHandle, StartedWorker, WorkerFactory, WorkerSpec};
pub use worker::{CommandHandler, TaskHandle, TaskWorkerFactory};
