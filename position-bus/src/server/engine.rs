//! Worker pool fanning queued updates out to every registered connection.

use std::sync::Arc;

use tokio::{select, sync::watch, task::JoinSet};
use tracing::debug;

use crate::server::{hub::Hub, queue::BroadcastQueue, stopped};

/// Spawns `workers` broadcast workers into `tasks`.
///
/// Workers exit once `running` flips to `false` and the queue is drained.
pub(crate) fn spawn_workers(
    tasks: &mut JoinSet<()>,
    workers: usize,
    queue: &BroadcastQueue,
    hub: &Arc<Hub>,
    running: &watch::Receiver<bool>,
) {
    for worker in 0..workers {
        let queue = queue.clone();
        let hub = Arc::clone(hub);
        let running = running.clone();
        tasks.spawn(run_worker(worker, queue, hub, running));
    }
}

async fn run_worker(
    worker: usize,
    queue: BroadcastQueue,
    hub: Arc<Hub>,
    mut running: watch::Receiver<bool>,
) {
    debug!(worker, "broadcast worker started");

    loop {
        select! {
            biased;
            message = queue.pop() => match message {
                Some(message) => {
                    hub.broadcast(&message).await;
                }
                None => break,
            },
            _ = stopped(&mut running) => {
                drain(&queue, &hub).await;
                break;
            }
        }
    }

    debug!(worker, "broadcast worker stopped");
}

async fn drain(queue: &BroadcastQueue, hub: &Hub) {
    while let Some(message) = queue.try_pop() {
        hub.broadcast(&message).await;
    }
}
