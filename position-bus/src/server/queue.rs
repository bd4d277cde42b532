//! Bounded hand-off between connection receive loops and broadcast workers.

use flume::{Receiver, Sender, TryRecvError};

use crate::message::WireMessage;

/// Bounded multi-producer, multi-consumer FIFO.
///
/// A full queue suspends producers instead of dropping updates, which pushes
/// back on the sockets feeding it. The queue keeps both ends alive, so `pop`
/// never reports disconnection while the queue exists.
#[derive(Clone)]
pub(crate) struct BroadcastQueue {
    tx: Sender<WireMessage>,
    rx: Receiver<WireMessage>,
}

impl BroadcastQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    /// Waits for space, then enqueues.
    pub(crate) async fn push(&self, message: WireMessage) {
        // Both ends are owned by `self`, so the send cannot observe a closed channel.
        let _ = self.tx.send_async(message).await;
    }

    /// Waits for the next message.
    pub(crate) async fn pop(&self) -> Option<WireMessage> {
        self.rx.recv_async().await.ok()
    }

    /// Returns immediately with `None` when empty.
    pub(crate) fn try_pop(&self) -> Option<WireMessage> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn message(position: f64) -> WireMessage {
        WireMessage::new("AAPL", position, "ts").expect("valid message")
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = BroadcastQueue::new(4);
        for position in [1.0, 2.0, 3.0] {
            queue.push(message(position)).await;
        }

        let drained: Vec<f64> = std::iter::from_fn(|| queue.try_pop())
            .map(|m| m.position())
            .collect();
        assert_eq!(drained, vec![1.0, 2.0, 3.0]);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn full_queue_suspends_producer_until_space() {
        let queue = BroadcastQueue::new(1);
        queue.push(message(1.0)).await;

        let blocked = timeout(Duration::from_millis(50), queue.push(message(2.0))).await;
        assert!(blocked.is_err(), "push into a full queue should wait");
        assert_eq!(queue.len(), 1);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(message(3.0)).await })
        };
        assert_eq!(queue.pop().await.map(|m| m.position()), Some(1.0));
        producer.await.expect("producer task");
        assert_eq!(queue.pop().await.map(|m| m.position()), Some(3.0));
    }
}
