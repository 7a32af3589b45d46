//! Shared types between the gateway dispatcher and reader workers
//!
//! These types travel over the per-worker channels:
//! - `Command` on the work queue (dispatcher -> worker)
//! - `AckSignal` on the ack queue (worker -> dispatcher)
//! - `ResultMessage` on the result queue (worker -> dispatcher)
//!
//! Serializable with serde so they can be logged or exposed as JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Index of one resource slot (a reader) in the gateway's fixed universe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIndex(pub usize);

impl ResourceIndex {
    /// Slot serving commands that are not bound to a specific reader.
    pub const PROXY: ResourceIndex = ResourceIndex(0);

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for ResourceIndex {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Unique identifier for a command (ULID)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Which operation the worker should perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// Run the request payload against the reader.
    Execute,
    /// Rank terminals matching `name`, returning at most `limit` entries.
    SelectTerminal { name: String, limit: u32 },
    /// Read-only listing of the current terminal ranking.
    SelectInfo,
    /// Drain queued work and stop the worker.
    Shutdown,
}

impl CommandKind {
    /// Result convention a dispatcher expects for this kind of command.
    pub fn convention(&self) -> ResultConvention {
        match self {
            CommandKind::SelectTerminal { .. } | CommandKind::SelectInfo => {
                ResultConvention::Priority
            }
            CommandKind::Execute | CommandKind::Shutdown => ResultConvention::Generic,
        }
    }

    /// Metadata queries get the short result bound.
    pub fn is_lightweight(&self) -> bool {
        matches!(self, CommandKind::SelectInfo)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Execute => "execute",
            CommandKind::SelectTerminal { .. } => "select_terminal",
            CommandKind::SelectInfo => "select_info",
            CommandKind::Shutdown => "shutdown",
        }
    }
}

/// How the result of a command is shaped and consumed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultConvention {
    /// Payload forwarded to the caller verbatim.
    Generic,
    /// Ranked reader priorities plus the two scalar counters.
    Priority,
}

/// A request routed to exactly one reader worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    /// Reader the request names, if any.
    pub reader: Option<String>,
    pub payload: serde_json::Value,
    /// Set by the dispatcher right before the command is enqueued.
    pub convention: Option<ResultConvention>,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(kind: CommandKind, payload: serde_json::Value) -> Self {
        Self {
            id: CommandId::new(),
            kind,
            reader: None,
            payload,
            convention: None,
            issued_at: Utc::now(),
        }
    }

    pub fn execute(payload: serde_json::Value) -> Self {
        Self::new(CommandKind::Execute, payload)
    }

    pub fn select_terminal(name: impl Into<String>, limit: u32) -> Self {
        Self::new(
            CommandKind::SelectTerminal {
                name: name.into(),
                limit,
            },
            serde_json::Value::Null,
        )
    }

    pub fn select_info() -> Self {
        Self::new(CommandKind::SelectInfo, serde_json::Value::Null)
    }

    pub fn shutdown() -> Self {
        Self::new(CommandKind::Shutdown, serde_json::Value::Null)
    }

    pub fn with_reader(mut self, reader: impl Into<String>) -> Self {
        self.reader = Some(reader.into());
        self
    }
}

// ============================================================================
// Worker replies
// ============================================================================

/// Type tag carried by acks and results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ack,
    Response,
    Priority,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self {
            MessageType::Ack => "ack",
            MessageType::Response => "response",
            MessageType::Priority => "priority",
            MessageType::Error => "error",
        };
        f.write_str(v)
    }
}

/// Sent by a worker as soon as it accepts a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckSignal {
    pub command_id: CommandId,
    pub message_type: MessageType,
}

impl AckSignal {
    pub fn ack(command_id: CommandId) -> Self {
        Self {
            command_id,
            message_type: MessageType::Ack,
        }
    }
}

/// Outcome of a terminal-selection command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriorityReport {
    /// reader name -> priority
    pub priorities: BTreeMap<String, i64>,
    pub last_priority: i64,
    pub max_readers: i64,
    /// Display-friendly ranked list.
    pub response: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResultPayload {
    Response(serde_json::Value),
    Priority(PriorityReport),
    Failed { reason: String },
}

/// Final outcome of one command, delivered exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMessage {
    pub command_id: CommandId,
    /// Slot of the worker that produced the result.
    pub process_id: ResourceIndex,
    /// Worker generation within the slot.
    pub generation: u64,
    pub message_type: MessageType,
    pub payload: ResultPayload,
}

impl ResultMessage {
    pub fn response(
        command_id: CommandId,
        process_id: ResourceIndex,
        generation: u64,
        value: serde_json::Value,
    ) -> Self {
        Self {
            command_id,
            process_id,
            generation,
            message_type: MessageType::Response,
            payload: ResultPayload::Response(value),
        }
    }

    pub fn priority(
        command_id: CommandId,
        process_id: ResourceIndex,
        generation: u64,
        report: PriorityReport,
    ) -> Self {
        Self {
            command_id,
            process_id,
            generation,
            message_type: MessageType::Priority,
            payload: ResultPayload::Priority(report),
        }
    }

    pub fn failed(
        command_id: CommandId,
        process_id: ResourceIndex,
        generation: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            process_id,
            generation,
            message_type: MessageType::Error,
            payload: ResultPayload::Failed {
                reason: reason.into(),
            },
        }
    }

    /// Priority data, regardless of the declared message type.
    pub fn priority_report(&self) -> Option<&PriorityReport> {
        match &self.payload {
            ResultPayload::Priority(report) => Some(report),
            _ => None,
        }
    }

    pub fn response_value(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            ResultPayload::Response(value) => Some(value),
            _ => None,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// One row of the worker status listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub index: ResourceIndex,
    pub reader: Option<String>,
    /// 0 when the slot was never started.
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub alive: bool,
    pub restarts: u64,
}
