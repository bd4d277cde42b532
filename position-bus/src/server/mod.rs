//! Broadcast server: accepts publishers, caches their latest positions, and
//! fans every update out to all registered connections.
//!
//! - [`hub`] keeps the connection registry and position cache under one lock.
//! - [`queue`] is the bounded hand-off from receive loops to workers.
//! - [`engine`] runs the fixed broadcast worker pool.
//! - [`listener`] accepts connections and runs one receive loop per client.
//!
//! Broadcasts go to every registered connection, the sender included. Clients
//! drop their own echo.

mod engine;
mod hub;
mod listener;
mod queue;

use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpListener,
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    error::{BusError, Result},
    message::WireMessage,
};

use self::{
    hub::Hub,
    listener::{ConnectionContext, run_accept_loop},
    queue::BroadcastQueue,
};

/// Resolves once `running` reads `false`, or its sender is gone.
async fn stopped(running: &mut watch::Receiver<bool>) {
    let _ = running.wait_for(|running| !*running).await;
}

pub struct PositionServer {
    config: ServerConfig,
    active: Option<ActiveServer>,
}

/// Background tasks and shared state of a started server.
struct ActiveServer {
    addr: SocketAddr,
    running: watch::Sender<bool>,
    hub: Arc<Hub>,
    queue: BroadcastQueue,
    accept_task: JoinHandle<()>,
    workers: JoinSet<()>,
}

impl PositionServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    /// Binds the listener and spawns the accept loop and broadcast workers.
    ///
    /// Returns the bound address. Starting a running server returns its
    /// current address without side effects.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(active) = &self.active {
            return Ok(active.addr);
        }

        self.config.validate()?;
        let listen_addr = self.config.listen_addr();
        let listener = TcpListener::bind(listen_addr).await.map_err(|err| {
            BusError::configuration(format!("failed to bind {listen_addr}: {err}"))
        })?;
        let addr = listener.local_addr()?;

        let hub = Arc::new(Hub::new(self.config.debug_logs));
        let queue = BroadcastQueue::new(self.config.queue_capacity);
        let (running, running_rx) = watch::channel(true);

        let mut workers = JoinSet::new();
        engine::spawn_workers(
            &mut workers,
            self.config.workers,
            &queue,
            &hub,
            &running_rx,
        );

        let context = Arc::new(ConnectionContext {
            hub: Arc::clone(&hub),
            queue: queue.clone(),
            running: running_rx,
            handshake_timeout: self.config.handshake_timeout,
            debug_logs: self.config.debug_logs,
        });
        let accept_task = tokio::spawn(run_accept_loop(listener, context));

        info!(
            %addr,
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "position server started"
        );

        self.active = Some(ActiveServer {
            addr,
            running,
            hub,
            queue,
            accept_task,
            workers,
        });
        Ok(addr)
    }

    /// Stops accepting, closes every connection, drains the queue, and joins
    /// all background tasks. A no-op when the server is not running.
    pub async fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        info!(addr = %active.addr, "position server stopping");
        active.running.send_replace(false);

        let closed = active.hub.close_all().await;
        if let Err(err) = active.accept_task.await {
            warn!(error = ?err, "accept loop ended abnormally");
        }

        info!(pending = active.queue.len(), "draining broadcast queue");
        while let Some(finished) = active.workers.join_next().await {
            if let Err(err) = finished {
                warn!(error = ?err, "broadcast worker ended abnormally");
            }
        }

        active.hub.clear().await;
        info!(closed, "position server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|active| active.addr)
    }

    /// Identities currently holding a registered connection, sorted.
    pub async fn registered_identities(&self) -> Vec<String> {
        match &self.active {
            Some(active) => active.hub.identities().await,
            None => Vec::new(),
        }
    }

    /// Last-known position of every identity seen since start.
    pub async fn positions(&self) -> HashMap<String, WireMessage> {
        match &self.active {
            Some(active) => active.hub.positions().await,
            None => HashMap::new(),
        }
    }

    /// Starts the server, runs until `shutdown` resolves, then stops it.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.start().await?;
        info!("position server listening on {}", addr);
        shutdown.await;
        self.stop().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let mut server = PositionServer::new(ServerConfig::local());
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn start_twice_keeps_one_listener() {
        let mut server = PositionServer::new(ServerConfig::local());
        let first = server.start().await.expect("start");
        let second = server.start().await.expect("second start");
        assert_eq!(first, second);

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn invalid_config_aborts_start() {
        let mut server = PositionServer::new(ServerConfig {
            queue_capacity: 0,
            ..ServerConfig::local()
        });
        let err = server.start().await.expect_err("zero capacity");
        assert!(matches!(err, BusError::Configuration { .. }));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn bind_conflict_is_a_configuration_error() {
        let mut first = PositionServer::new(ServerConfig::local());
        let addr = first.start().await.expect("start");

        let mut second = PositionServer::new(ServerConfig {
            host: addr.ip(),
            port: addr.port(),
            ..ServerConfig::local()
        });
        let err = second.start().await.expect_err("port in use");
        assert!(matches!(err, BusError::Configuration { .. }));

        first.stop().await;
    }
}
