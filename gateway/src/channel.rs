//! Channel Triple: the work, ack and result queues of one worker generation.
//!
//! Each direction is single-producer/single-consumer: the dispatcher writes
//! work and reads acks and results, the worker does the opposite. The
//! dispatcher-side receivers sit behind async mutexes only so the ends can be
//! shared through an `Arc<WorkerRecord>`; per-slot dispatch serialization
//! means they are never contended.

use std::time::Duration;

use shared_types::{AckSignal, Command, ResultMessage};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, timeout_at, Instant};

/// Bounds past this are treated as "no bound".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + bound`, capped at [`FAR_FUTURE`] so huge bounds never overflow.
pub fn deadline_after(bound: Duration) -> Instant {
    Instant::now() + bound.min(FAR_FUTURE)
}

/// Outcome of one receive attempt with a bound.
#[derive(Debug)]
pub enum Recv<T> {
    Message(T),
    /// Nothing arrived before the bound.
    Empty,
    /// The worker side hung up.
    Closed,
}

/// Dispatcher-side ends.
#[derive(Debug)]
pub struct DispatcherEnds {
    work: mpsc::UnboundedSender<Command>,
    ack: Mutex<mpsc::UnboundedReceiver<AckSignal>>,
    result: Mutex<mpsc::UnboundedReceiver<ResultMessage>>,
}

/// Worker-side ends, moved into the execution unit.
#[derive(Debug)]
pub struct WorkerEnds {
    pub work: mpsc::UnboundedReceiver<Command>,
    pub ack: mpsc::UnboundedSender<AckSignal>,
    pub result: mpsc::UnboundedSender<ResultMessage>,
}

/// Create a fresh triple for a new worker generation.
pub fn triple() -> (DispatcherEnds, WorkerEnds) {
    let (work_tx, work_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = mpsc::unbounded_channel();

    (
        DispatcherEnds {
            work: work_tx,
            ack: Mutex::new(ack_rx),
            result: Mutex::new(result_rx),
        },
        WorkerEnds {
            work: work_rx,
            ack: ack_tx,
            result: result_tx,
        },
    )
}

impl DispatcherEnds {
    /// Never blocks. Hands the command back if the worker's queue is gone.
    pub fn push_work(&self, command: Command) -> Result<(), Command> {
        self.work.send(command).map_err(|e| e.0)
    }

    /// Wait up to `poll` for the next ack.
    pub async fn poll_ack(&self, poll: Duration) -> Recv<AckSignal> {
        let mut ack = self.ack.lock().await;
        match timeout(poll, ack.recv()).await {
            Ok(Some(signal)) => Recv::Message(signal),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Empty,
        }
    }

    /// Wait until `deadline` for the next result.
    pub async fn recv_result(&self, deadline: Instant) -> Recv<ResultMessage> {
        let mut result = self.result.lock().await;
        match timeout_at(deadline, result.recv()).await {
            Ok(Some(message)) => Recv::Message(message),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Empty,
        }
    }

    /// Discard anything left over from earlier commands.
    pub async fn drain_stale(&self) -> usize {
        let mut drained = 0;
        {
            let mut ack = self.ack.lock().await;
            while ack.try_recv().is_ok() {
                drained += 1;
            }
        }
        let mut result = self.result.lock().await;
        while result.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// True once the worker dropped its work receiver.
    pub fn is_work_closed(&self) -> bool {
        self.work.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{CommandId, ResourceIndex};

    #[test]
    fn test_deadline_after_saturates() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > before + Duration::from_secs(86400 * 365));

        let short = deadline_after(Duration::from_millis(10));
        assert!(short >= before + Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_work_flows_to_worker_in_order() {
        let (dispatcher, mut worker) = triple();
        let first = Command::execute(serde_json::json!(1));
        let second = Command::execute(serde_json::json!(2));
        let first_id = first.id.clone();

        dispatcher.push_work(first).unwrap();
        dispatcher.push_work(second).unwrap();

        assert_eq!(worker.work.recv().await.unwrap().id, first_id);
        assert_eq!(
            worker.work.recv().await.unwrap().payload,
            serde_json::json!(2)
        );
    }

    #[tokio::test]
    async fn test_poll_ack_empty_then_message() {
        let (dispatcher, worker) = triple();
        assert!(matches!(
            dispatcher.poll_ack(Duration::from_millis(10)).await,
            Recv::Empty
        ));

        let id = CommandId::new();
        worker.ack.send(AckSignal::ack(id.clone())).unwrap();
        match dispatcher.poll_ack(Duration::from_millis(10)).await {
            Recv::Message(signal) => assert_eq!(signal.command_id, id),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_when_worker_drops() {
        let (dispatcher, worker) = triple();
        drop(worker);

        assert!(dispatcher.is_work_closed());
        assert!(matches!(
            dispatcher.poll_ack(Duration::from_millis(10)).await,
            Recv::Closed
        ));
        assert!(matches!(
            dispatcher
                .recv_result(Instant::now() + Duration::from_millis(10))
                .await,
            Recv::Closed
        ));
        assert!(dispatcher
            .push_work(Command::execute(serde_json::Value::Null))
            .is_err());
    }

    #[tokio::test]
    async fn test_drain_stale_discards_leftovers() {
        let (dispatcher, worker) = triple();
        let id = CommandId::new();
        worker.ack.send(AckSignal::ack(id.clone())).unwrap();
        worker
            .result
            .send(ResultMessage::response(
                id,
                ResourceIndex(0),
                1,
                serde_json::Value::Null,
            ))
            .unwrap();

        assert_eq!(dispatcher.drain_stale().await, 2);
        assert!(matches!(
            dispatcher.poll_ack(Duration::from_millis(5)).await,
            Recv::Empty
        ));
    }
}
