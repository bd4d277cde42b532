//! Client side of the bus: one outbound connection with a bounded-retry
//! reconnect machine.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                       │                  │ read failure
//!       └───────failure─────────┘                  ▼
//!                                 Connected ◀──ok── Reconnecting ──3 failures──▶ Stopped
//! ```
//!
//! A single supervisor task owns the read half. It surfaces foreign updates,
//! and when a read fails it runs the reconnect loop in place. Write failures
//! are reported to the caller and never trigger a reconnect.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, oneshot, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ClientConfig, MAX_RECONNECT_ATTEMPTS},
    error::{BusError, Result},
    message::{WireMessage, current_timestamp, read_message, write_message},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal. Create a new session to resume.
    Stopped,
}

/// One outbound connection to a position server.
///
/// The identity must be unique among live clients. A duplicate is accepted at
/// the TCP level and then closed by the server, so the session keeps cycling
/// through reconnects every reconnect delay instead of reaching
/// [`SessionState::Stopped`]. Call [`ClientSession::stop`] to end it.
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ClientConfig,
    state: watch::Sender<SessionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    attempts: AtomicU32,
    updates: mpsc::UnboundedSender<WireMessage>,
}

impl ClientSession {
    /// Creates a disconnected session and the channel its foreign updates are
    /// delivered on.
    pub fn new(config: ClientConfig) -> Result<(Self, mpsc::UnboundedReceiver<WireMessage>)> {
        config.validate()?;
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Disconnected);

        let inner = SessionInner {
            config,
            state,
            writer: Mutex::new(None),
            supervisor: Mutex::new(None),
            attempts: AtomicU32::new(0),
            updates,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            updates_rx,
        ))
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Failed reconnect attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Opens the transport, registers this session's identity, and starts the
    /// background receive loop.
    ///
    /// Does nothing while a link is up or being re-established.
    pub async fn connect(&self) -> Result<()> {
        let mut supervisor = self.inner.supervisor.lock().await;
        match self.state() {
            SessionState::Stopped => return Err(BusError::SessionStopped),
            SessionState::Connected | SessionState::Reconnecting if supervisor.is_some() => {
                return Ok(());
            }
            _ => {}
        }

        self.inner.set_state(SessionState::Connecting);
        match self.inner.establish().await {
            Ok(reader) => {
                replace_supervisor(&mut supervisor, spawn_supervisor(&self.inner, reader));
                Ok(())
            }
            Err(err) => {
                self.inner.set_state(SessionState::Disconnected);
                warn!(identity = %self.identity(), error = %err, "connect failed");
                Err(err)
            }
        }
    }

    /// Publishes a position stamped with `timestamp`, or the current local
    /// time when `None`.
    pub async fn send(&self, position: f64, timestamp: Option<&str>) -> Result<()> {
        let timestamp = timestamp.map_or_else(current_timestamp, str::to_string);
        let message = WireMessage::new(self.identity(), position, timestamp)?;
        self.send_message(&message).await
    }

    pub async fn send_message(&self, message: &WireMessage) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(match self.state() {
                SessionState::Stopped => BusError::SessionStopped,
                _ => BusError::NotConnected,
            });
        };

        write_message(writer, message).await.map_err(|err| {
            warn!(identity = %self.identity(), error = %err, "failed to send position");
            BusError::Transport(err)
        })
    }

    /// Closes the transport without scheduling a reconnect.
    pub async fn disconnect(&self) {
        if self.state() == SessionState::Stopped {
            return;
        }
        self.inner.abort_supervisor().await;
        self.inner.close_writer().await;
        self.inner.set_state(SessionState::Disconnected);
        info!(identity = %self.identity(), "disconnected");
    }

    /// Disconnects, waits the reconnect delay, then runs the bounded
    /// connect-or-retry loop. Exhausting the attempts stops the session.
    ///
    /// The loop runs on the supervisor task, so [`ClientSession::stop`]
    /// interrupts it and this call returns [`BusError::SessionStopped`].
    pub async fn reconnect(&self) -> Result<()> {
        if self.state() == SessionState::Stopped {
            return Err(BusError::SessionStopped);
        }
        self.disconnect().await;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        {
            let mut supervisor = self.inner.supervisor.lock().await;
            if !self.inner.set_state(SessionState::Reconnecting) {
                return Err(BusError::SessionStopped);
            }
            let handle = tokio::spawn(reconnect_then_supervise(
                Arc::clone(&self.inner),
                outcome_tx,
            ));
            replace_supervisor(&mut supervisor, handle);
        }

        outcome_rx.await.unwrap_or(Err(BusError::SessionStopped))
    }

    /// Terminal shutdown: closes the transport and joins the background task.
    pub async fn stop(&self) {
        self.inner.abort_supervisor().await;
        self.inner.halt().await;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Ok(mut supervisor) = self.inner.supervisor.try_lock() {
            if let Some(handle) = supervisor.take() {
                handle.abort();
            }
        }
    }
}

fn spawn_supervisor(inner: &Arc<SessionInner>, reader: OwnedReadHalf) -> JoinHandle<()> {
    tokio::spawn(supervise(Arc::clone(inner), reader))
}

/// Stores `next`, aborting whatever supervisor it displaces.
fn replace_supervisor(slot: &mut Option<JoinHandle<()>>, next: JoinHandle<()>) {
    if let Some(previous) = slot.replace(next) {
        previous.abort();
    }
}

/// Explicit reconnect: reports the outcome of the retry loop, then keeps
/// supervising the new link.
async fn reconnect_then_supervise(
    inner: Arc<SessionInner>,
    outcome: oneshot::Sender<Result<()>>,
) {
    match inner.reconnect_with_retry().await {
        Ok(reader) => {
            let _ = outcome.send(Ok(()));
            supervise(inner, reader).await;
        }
        Err(err) => {
            inner.halt().await;
            let _ = outcome.send(Err(err));
        }
    }
}

/// Runs receive loops back to back, reconnecting in between, until the
/// attempts run out or the task is aborted.
async fn supervise(inner: Arc<SessionInner>, mut reader: OwnedReadHalf) {
    loop {
        let err = inner.receive_loop(&mut reader).await;
        warn!(identity = %inner.config.identity, error = %err, "lost connection to server");

        inner.close_writer().await;
        if !inner.set_state(SessionState::Reconnecting) {
            return;
        }

        match inner.reconnect_with_retry().await {
            Ok(next) => reader = next,
            Err(err) => {
                warn!(identity = %inner.config.identity, error = %err, "stopping session");
                inner.halt().await;
                return;
            }
        }
    }
}

impl SessionInner {
    /// Moves to `next` unless the session already stopped.
    fn set_state(&self, next: SessionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Stopped {
                return false;
            }
            applied = true;
            let changed = *state != next;
            *state = next;
            changed
        });
        applied
    }

    async fn establish(&self) -> Result<OwnedReadHalf> {
        let stream = self.open_transport().await?;
        let peer = stream.peer_addr().ok();
        let (reader, mut writer) = stream.into_split();

        let hello = WireMessage::now(&self.config.identity, 0.0)?;
        write_message(&mut writer, &hello).await?;

        let mut slot = self.writer.lock().await;
        if !self.set_state(SessionState::Connected) {
            return Err(BusError::SessionStopped);
        }
        *slot = Some(writer);
        self.attempts.store(0, Ordering::SeqCst);

        info!(identity = %self.config.identity, ?peer, "connected to server");
        Ok(reader)
    }

    async fn open_transport(&self) -> Result<TcpStream> {
        let remote = (self.config.host.as_str(), self.config.port);
        let mut last_err = None;
        for addr in tokio::net::lookup_host(remote).await? {
            match connect_from(addr, self.config.local_port).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(%addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.config.host),
            )
        });
        Err(err.into())
    }

    /// Reads until the link fails, surfacing every foreign update.
    async fn receive_loop(&self, reader: &mut OwnedReadHalf) -> io::Error {
        loop {
            match read_message(reader).await {
                Ok(Some(message)) => self.surface(message),
                Ok(None) => {
                    return io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "server closed the connection",
                    );
                }
                Err(err) => return err,
            }
        }
    }

    fn surface(&self, message: WireMessage) {
        // The server echoes our own updates back.
        if message.identity() == self.config.identity {
            return;
        }
        if self.config.debug_logs {
            debug!(
                identity = %self.config.identity,
                from = message.identity(),
                position = message.position(),
                timestamp = message.timestamp(),
                "update received"
            );
        }
        let _ = self.updates.send(message);
    }

    async fn reconnect_with_retry(&self) -> Result<OwnedReadHalf> {
        sleep(self.config.reconnect_delay).await;

        loop {
            match self.establish().await {
                Ok(reader) => return Ok(reader),
                Err(BusError::SessionStopped) => return Err(BusError::SessionStopped),
                Err(err) => {
                    let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        identity = %self.config.identity,
                        attempts,
                        max = MAX_RECONNECT_ATTEMPTS,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        return Err(BusError::ReconnectExhausted { attempts });
                    }
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn abort_supervisor(&self) {
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = ?err, "session supervisor ended abnormally");
                }
            }
        }
    }

    async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(error = %err, "failed to shut down writer cleanly");
            }
        }
    }

    /// Enters the terminal state and releases the transport.
    async fn halt(&self) {
        self.close_writer().await;
        let stopped_now = self.state.send_if_modified(|state| {
            let changed = *state != SessionState::Stopped;
            *state = SessionState::Stopped;
            changed
        });
        if stopped_now {
            info!(identity = %self.config.identity, "session stopped");
        }
    }
}

async fn connect_from(remote: SocketAddr, local_port: Option<u16>) -> io::Result<TcpStream> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if let Some(port) = local_port {
        let any: IpAddr = match remote {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::new(any, port))?;
    }

    socket.connect(remote).await
}
