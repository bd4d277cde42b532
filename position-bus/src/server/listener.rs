//! Accept loop, handshake, and per-connection receive loops.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    message::{Frame, WireMessage, read_message, write_frame},
    server::{
        hub::{ConnectionId, Hub},
        queue::BroadcastQueue,
        stopped,
    },
};

/// Everything a connection task needs from the server.
pub(crate) struct ConnectionContext {
    pub(crate) hub: Arc<Hub>,
    pub(crate) queue: BroadcastQueue,
    pub(crate) running: watch::Receiver<bool>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) debug_logs: bool,
}

/// Why a receive loop ended.
#[derive(Debug)]
enum Disconnect {
    PeerClosed,
    ReadFailed(io::Error),
    WriterClosed,
    Shutdown,
}

/// Accepts until `running` clears, then waits for every connection task.
pub(crate) async fn run_accept_loop(listener: TcpListener, context: Arc<ConnectionContext>) {
    let mut running = context.running.clone();
    let mut connections = JoinSet::new();

    loop {
        select! {
            _ = stopped(&mut running) => break,
            accepted = listener.accept() => {
                handle_accept_result(accepted, &context, &mut connections);
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                log_task_exit(finished);
            }
        }
    }

    drop(listener);
    info!(pending = connections.len(), "listener closed, waiting for connections");
    while let Some(finished) = connections.join_next().await {
        log_task_exit(finished);
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    context: &Arc<ConnectionContext>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let context = Arc::clone(context);
            connections.spawn(handle_connection(stream, peer, context));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn log_task_exit(result: Result<(), JoinError>) {
    if let Err(err) = result {
        warn!(error = ?err, "connection task ended abnormally");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: Arc<ConnectionContext>) {
    let (mut reader, writer) = stream.into_split();

    let mut running = context.running.clone();
    let handshake = select! {
        handshake = perform_handshake(&mut reader, context.handshake_timeout) => handshake,
        _ = stopped(&mut running) => {
            debug!(%peer, "server stopping, dropping connection before handshake");
            return;
        }
    };

    let identity = match handshake {
        Ok(identity) => identity,
        Err(err) => {
            warn!(%peer, error = %err, "handshake failed");
            return;
        }
    };

    let id = context.hub.next_id();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    match context
        .hub
        .register(&identity, id, Some(peer), outbound_tx)
        .await
    {
        Ok(replayed) => info!(%peer, %identity, replayed, "client registered"),
        Err(err) => {
            // Dropping both halves closes the rejected transport.
            warn!(%peer, %identity, error = %err, "rejecting connection");
            return;
        }
    }

    let mut writer_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        Arc::clone(&context.hub),
        identity.clone(),
        id,
    ));

    let reason = receive_loop(&mut reader, &identity, &context, &mut writer_task).await;
    cleanup_disconnect(&context.hub, &identity, id, peer, &reason).await;

    if !matches!(reason, Disconnect::WriterClosed) {
        if let Err(err) = writer_task.await {
            warn!(%identity, error = ?err, "writer task ended abnormally");
        }
    }
}

/// Reads the registration record and returns the identity it names.
async fn perform_handshake(reader: &mut OwnedReadHalf, limit: Duration) -> Result<String> {
    let hello = match timeout(limit, read_message(reader)).await {
        Ok(read) => read?,
        Err(_) => bail!("no handshake within {limit:?}"),
    };

    let Some(hello) = hello else {
        bail!("connection closed before handshake");
    };

    if hello.identity().is_empty() {
        bail!("handshake carried an empty identity");
    }
    Ok(hello.identity().to_string())
}

async fn receive_loop(
    reader: &mut OwnedReadHalf,
    identity: &str,
    context: &ConnectionContext,
    writer_task: &mut JoinHandle<()>,
) -> Disconnect {
    let mut running = context.running.clone();

    loop {
        select! {
            read = read_message(reader) => match read {
                Ok(Some(message)) => accept_update(message, identity, context).await,
                Ok(None) => return Disconnect::PeerClosed,
                Err(err) => return Disconnect::ReadFailed(err),
            },
            _ = &mut *writer_task => return Disconnect::WriterClosed,
            _ = stopped(&mut running) => return Disconnect::Shutdown,
        }
    }
}

/// Caches an inbound update under the connection's identity, then enqueues it.
async fn accept_update(message: WireMessage, identity: &str, context: &ConnectionContext) {
    let message = if message.identity() == identity {
        message
    } else {
        debug!(%identity, claimed = message.identity(), "relabelling update to registered identity");
        message.with_identity(identity)
    };

    if context.debug_logs {
        debug!(
            %identity,
            position = message.position(),
            timestamp = message.timestamp(),
            "update received"
        );
    }

    context.hub.record_position(identity, &message).await;
    context.queue.push(message).await;
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    hub: Arc<Hub>,
    identity: String,
    id: ConnectionId,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!(%identity, error = ?err, "failed to deliver frame");
            hub.remove(&identity, id).await;
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(%identity, error = ?err, "failed to shut down writer cleanly");
    }
}

async fn cleanup_disconnect(
    hub: &Hub,
    identity: &str,
    id: ConnectionId,
    peer: SocketAddr,
    reason: &Disconnect,
) {
    let removed = hub.remove(identity, id).await;
    match reason {
        Disconnect::ReadFailed(err) => {
            warn!(%peer, %identity, removed, error = %err, "client read failed")
        }
        _ => info!(%peer, %identity, removed, ?reason, "client disconnected"),
    }
}
