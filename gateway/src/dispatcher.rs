//! Command lifecycle: ensure worker -> push work -> await ack -> await result.
//!
//! A dispatch holds its slot's dispatch lock for the whole cycle, so commands
//! to one reader never interleave while commands to different readers run in
//! parallel. Worker death is only acted on in the ack stage; once a worker has
//! acknowledged a command the dispatcher never resubmits it, because the
//! reader may already have executed it.

use std::sync::Arc;
use std::time::Duration;

use shared_types::{
    Command, CommandKind, MessageType, ResourceIndex, ResultConvention, ResultMessage,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::channel::{deadline_after, Recv};
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::metadata::{apply_priority_report, MetadataStore};
use crate::registry::{Registry, WorkerRecord};

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    metadata: Arc<dyn MetadataStore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { registry, metadata }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn config(&self) -> &DispatchConfig {
        self.registry.config()
    }

    /// Default result bound for a kind of command.
    pub fn result_bound(&self, kind: &CommandKind) -> Duration {
        if kind.is_lightweight() {
            self.config().query_timeout
        } else {
            self.config().command_timeout
        }
    }

    /// Run `command` on the worker of `index` and return its result.
    ///
    /// `timeout` overrides the result bound of the command's class.
    pub async fn dispatch(
        &self,
        index: ResourceIndex,
        mut command: Command,
        timeout: Option<Duration>,
    ) -> Result<ResultMessage, DispatchError> {
        let slot = self.registry.slot(index)?;
        let _serial = self.registry.lock_dispatch(slot).await;

        let record = self.registry.ensure_started(index).await?;
        let stale = record.channels().drain_stale().await;
        if stale > 0 {
            debug!(%index, stale, "discarded leftover worker messages");
        }

        let convention = command.kind.convention();
        command.convention = Some(convention);
        let bound = timeout.unwrap_or_else(|| self.result_bound(&command.kind));

        let record = self.push_and_await_ack(index, record, &command).await?;
        let result = self.await_result(&record, &command, bound).await?;

        match convention {
            ResultConvention::Priority => self.apply_priority_convention(&command, &result),
            ResultConvention::Generic => check_generic_tag(&command, &result),
        }
        Ok(result)
    }

    /// Resolve the command's reader to a slot, then dispatch with the default bound.
    pub async fn dispatch_to_reader(&self, command: Command) -> Result<ResultMessage, DispatchError> {
        let index = self.registry.resolve(command.reader.as_deref())?;
        self.dispatch(index, command, None).await
    }

    /// Rank terminals matching `name`; returns the display list.
    pub async fn select_terminal(
        &self,
        name: &str,
        limit: u32,
    ) -> Result<Vec<String>, DispatchError> {
        let command = Command::select_terminal(name.trim(), limit);
        let result = self.dispatch(ResourceIndex::PROXY, command, None).await?;
        Ok(result
            .priority_report()
            .map(|r| r.response.clone())
            .unwrap_or_default())
    }

    /// Current terminal ranking; never updates metadata.
    pub async fn select_info(&self) -> Result<Vec<String>, DispatchError> {
        let result = self
            .dispatch(ResourceIndex::PROXY, Command::select_info(), None)
            .await?;
        Ok(result
            .priority_report()
            .map(|r| r.response.clone())
            .unwrap_or_default())
    }

    async fn push_and_await_ack(
        &self,
        index: ResourceIndex,
        mut record: Arc<WorkerRecord>,
        command: &Command,
    ) -> Result<Arc<WorkerRecord>, DispatchError> {
        let poll = self.config().ack_poll_interval;
        let started = Instant::now();
        let deadline = deadline_after(self.config().ack_deadline);

        push(&record, command);
        loop {
            let now = Instant::now();
            if now >= deadline {
                error!(%index, command_id = %command.id, "worker never acknowledged command");
                return Err(DispatchError::AckTimeout {
                    index,
                    command_id: command.id.clone(),
                    waited: now - started,
                });
            }

            match record.channels().poll_ack(poll.min(deadline - now)).await {
                Recv::Message(signal) if signal.command_id != command.id => {
                    debug!(%index, stale = %signal.command_id, "discarding ack for another command");
                }
                Recv::Message(signal) => {
                    if signal.message_type != MessageType::Ack {
                        let mismatch = DispatchError::ProtocolMismatch {
                            index,
                            command_id: command.id.clone(),
                            expected: MessageType::Ack,
                            got: signal.message_type,
                        };
                        error!(%index, "{mismatch}");
                    }
                    return Ok(record);
                }
                Recv::Empty if record.is_alive() => {}
                Recv::Closed if record.is_alive() => {
                    // Ends already dropped; wait for the unit to finish exiting.
                    sleep(poll.min(deadline - now)).await;
                }
                Recv::Empty | Recv::Closed => {
                    warn!(
                        %index,
                        generation = record.generation,
                        command_id = %command.id,
                        "worker is not alive, restarting"
                    );
                    let observed = record.generation;
                    record = self.registry.replace_if_dead(index, observed).await?;
                    if record.generation != observed {
                        push(&record, command);
                    }
                }
            }
        }
    }

    async fn await_result(
        &self,
        record: &WorkerRecord,
        command: &Command,
        bound: Duration,
    ) -> Result<ResultMessage, DispatchError> {
        let index = record.index;
        let deadline = deadline_after(bound);

        loop {
            match record.channels().recv_result(deadline).await {
                Recv::Message(result) if result.command_id != command.id => {
                    warn!(
                        %index,
                        stale = %result.command_id,
                        command_id = %command.id,
                        "discarding result for another command"
                    );
                }
                Recv::Message(result) => {
                    debug!(
                        %index,
                        generation = result.generation,
                        command_id = %command.id,
                        kind = command.kind.name(),
                        "command completed"
                    );
                    return Ok(result);
                }
                Recv::Empty => {
                    error!(%index, command_id = %command.id, ?bound, "no result within bound");
                    return Err(DispatchError::ResultTimeout {
                        index,
                        command_id: command.id.clone(),
                        waited: bound,
                    });
                }
                Recv::Closed => {
                    error!(%index, command_id = %command.id, "worker exited after acknowledging");
                    return Err(DispatchError::WorkerLost {
                        index,
                        command_id: command.id.clone(),
                    });
                }
            }
        }
    }

    fn apply_priority_convention(&self, command: &Command, result: &ResultMessage) {
        if result.message_type != MessageType::Priority {
            error!(
                command_id = %command.id,
                got = %result.message_type,
                "reader select result has incorrect type"
            );
        }
        let Some(report) = result.priority_report() else {
            return;
        };

        match command.kind {
            CommandKind::SelectInfo => {
                if !report.priorities.is_empty() {
                    error!(
                        returned = report.priorities.len(),
                        "reader select info returned priority updates, ignoring"
                    );
                }
                debug!(response = %report.response.join(","), "reader select info returned");
            }
            _ => {
                let merge = apply_priority_report(self.metadata.as_ref(), report);
                info!(
                    updated = merge.matched.len(),
                    returned = merge.returned,
                    "reader select update done"
                );
            }
        }
    }
}

/// Generic results are forwarded as-is; a priority or ack tag is only logged.
fn check_generic_tag(command: &Command, result: &ResultMessage) {
    if matches!(result.message_type, MessageType::Priority | MessageType::Ack) {
        let mismatch = DispatchError::ProtocolMismatch {
            index: result.process_id,
            command_id: command.id.clone(),
            expected: MessageType::Response,
            got: result.message_type,
        };
        error!(kind = command.kind.name(), "{mismatch}");
    }
}

fn push(record: &WorkerRecord, command: &Command) {
    if record.channels().push_work(command.clone()).is_err() {
        debug!(
            index = %record.index,
            generation = record.generation,
            command_id = %command.id,
            "work queue closed, awaiting liveness check"
        );
    }
}
