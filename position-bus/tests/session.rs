use std::time::Duration;

use anyhow::{Result, bail};
use position_bus::{
    BusError, ClientConfig, ClientSession, PositionServer, ServerConfig, SessionState,
    WireMessage,
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    time::{Instant, sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(5);

fn session_config(port: u16, identity: &str) -> ClientConfig {
    ClientConfig {
        reconnect_delay: Duration::from_millis(200),
        retry_delay: Duration::from_millis(100),
        ..ClientConfig::new("127.0.0.1", port, identity)
    }
}

async fn start_server(port: u16) -> Result<(PositionServer, u16)> {
    let mut server = PositionServer::new(ServerConfig {
        port,
        ..ServerConfig::local()
    });
    let addr = server.start().await?;
    Ok((server, addr.port()))
}

async fn wait_for_state(
    states: &mut watch::Receiver<SessionState>,
    expected: SessionState,
) -> Result<()> {
    timeout(WAIT, states.wait_for(|state| *state == expected)).await??;
    Ok(())
}

async fn next_update(updates: &mut UnboundedReceiver<WireMessage>) -> Result<WireMessage> {
    match timeout(WAIT, updates.recv()).await? {
        Some(update) => Ok(update),
        None => bail!("update channel closed"),
    }
}

async fn wait_for_position(server: &PositionServer, identity: &str) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while !server.positions().await.contains_key(identity) {
        if Instant::now() > deadline {
            bail!("no cached position for {identity}");
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test]
async fn sessions_see_foreign_updates_but_not_their_own() -> Result<()> {
    let (mut server, port) = start_server(0).await?;

    let (aapl, mut aapl_updates) = ClientSession::new(session_config(port, "AAPL"))?;
    aapl.connect().await?;
    aapl.send(75.0, None).await?;
    wait_for_position(&server, "AAPL").await?;

    let (msft, mut msft_updates) = ClientSession::new(session_config(port, "MSFT"))?;
    msft.connect().await?;

    let snapshot = next_update(&mut msft_updates).await?;
    assert_eq!(snapshot.identity(), "AAPL");
    assert_eq!(snapshot.position(), 75.0);
    assert!(!snapshot.timestamp().is_empty());

    msft.send(80.0, None).await?;
    let update = next_update(&mut aapl_updates).await?;
    assert_eq!(update.identity(), "MSFT");
    assert_eq!(update.position(), 80.0);

    sleep(Duration::from_millis(100)).await;
    assert!(aapl_updates.try_recv().is_err(), "AAPL must not see its own echo");
    while let Ok(extra) = msft_updates.try_recv() {
        assert_ne!(extra.identity(), "MSFT", "MSFT must not see its own echo");
    }

    aapl.stop().await;
    msft.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn session_reconnects_to_restarted_server() -> Result<()> {
    let (mut server, port) = start_server(0).await?;

    let (session, mut updates) = ClientSession::new(session_config(port, "AAPL"))?;
    let mut states = session.watch_state();
    session.connect().await?;

    server.stop().await;
    wait_for_state(&mut states, SessionState::Reconnecting).await?;

    let (mut restarted, _) = start_server(port).await?;
    wait_for_state(&mut states, SessionState::Connected).await?;
    assert_eq!(session.attempts(), 0);

    let (peer, _peer_updates) = ClientSession::new(session_config(port, "MSFT"))?;
    peer.connect().await?;
    peer.send(42.0, Some("after restart")).await?;

    let update = next_update(&mut updates).await?;
    assert_eq!(update.identity(), "MSFT");
    assert_eq!(update.timestamp(), "after restart");

    peer.stop().await;
    session.stop().await;
    restarted.stop().await;
    Ok(())
}

#[tokio::test]
async fn session_stops_after_three_failed_reconnects() -> Result<()> {
    let (mut server, port) = start_server(0).await?;

    let (session, _updates) = ClientSession::new(session_config(port, "AAPL"))?;
    let mut states = session.watch_state();
    session.connect().await?;

    server.stop().await;
    wait_for_state(&mut states, SessionState::Stopped).await?;
    assert_eq!(session.attempts(), 3);

    assert!(matches!(
        session.send(1.0, None).await,
        Err(BusError::SessionStopped)
    ));
    assert!(matches!(
        session.reconnect().await,
        Err(BusError::SessionStopped)
    ));

    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn explicit_reconnect_restores_the_link() -> Result<()> {
    let (mut server, port) = start_server(0).await?;

    let (session, _updates) = ClientSession::new(session_config(port, "AAPL"))?;
    session.connect().await?;
    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    let deadline = Instant::now() + WAIT;
    while !server.registered_identities().await.is_empty() {
        if Instant::now() > deadline {
            bail!("server kept the disconnected identity");
        }
        sleep(Duration::from_millis(10)).await;
    }

    session.reconnect().await?;
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.attempts(), 0);
    session.send(9.5, None).await?;
    wait_for_position(&server, "AAPL").await?;

    session.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn late_reconnect_success_resets_attempts() -> Result<()> {
    let (mut server, port) = start_server(0).await?;

    let config = ClientConfig {
        reconnect_delay: Duration::from_millis(100),
        retry_delay: Duration::from_millis(600),
        ..ClientConfig::new("127.0.0.1", port, "AAPL")
    };
    let (session, _updates) = ClientSession::new(config)?;
    let mut states = session.watch_state();
    session.connect().await?;

    server.stop().await;
    wait_for_state(&mut states, SessionState::Reconnecting).await?;

    let deadline = Instant::now() + WAIT;
    while session.attempts() < 2 {
        if Instant::now() > deadline {
            bail!("only {} failed attempts", session.attempts());
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.attempts(), 2);
    assert_eq!(session.state(), SessionState::Reconnecting);

    // The third attempt lands on the restarted server.
    let (mut restarted, _) = start_server(port).await?;
    wait_for_state(&mut states, SessionState::Connected).await?;
    assert_eq!(session.attempts(), 0);

    session.stop().await;
    restarted.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_identity_session_keeps_cycling() -> Result<()> {
    let (mut server, port) = start_server(0).await?;

    let (holder, _holder_updates) = ClientSession::new(session_config(port, "AAPL"))?;
    holder.connect().await?;
    let deadline = Instant::now() + WAIT;
    while server.registered_identities().await.is_empty() {
        if Instant::now() > deadline {
            bail!("holder never registered");
        }
        sleep(Duration::from_millis(10)).await;
    }

    let config = ClientConfig {
        reconnect_delay: Duration::from_millis(50),
        retry_delay: Duration::from_millis(50),
        ..ClientConfig::new("127.0.0.1", port, "AAPL")
    };
    let (duplicate, _duplicate_updates) = ClientSession::new(config)?;
    let mut states = duplicate.watch_state();
    duplicate.connect().await?;

    // Each cycle's handshake write succeeds, so the counter never builds up.
    wait_for_state(&mut states, SessionState::Reconnecting).await?;
    sleep(Duration::from_millis(500)).await;
    assert_ne!(duplicate.state(), SessionState::Stopped);
    assert!(duplicate.attempts() < 3);
    assert_eq!(server.registered_identities().await, vec!["AAPL".to_string()]);

    duplicate.stop().await;
    assert_eq!(duplicate.state(), SessionState::Stopped);
    holder.stop().await;
    server.stop().await;
    Ok(())
}
