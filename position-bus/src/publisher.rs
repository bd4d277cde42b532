//! Demo publisher behind `position_bus client`.

use std::ops::Range;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::{io::AsyncWriteExt, select, sync::mpsc, time::sleep};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    client::{ClientSession, SessionState},
    message::WireMessage,
};

const POSITION_RANGE: Range<f64> = 70.0..100.0;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (session, updates) = ClientSession::new(args.session_config())?;
    session
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    let printer = tokio::spawn(print_updates(updates));

    select! {
        _ = demo(&session, &args) => {}
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
        }
    }

    session.disconnect().await;
    session.stop().await;
    // Dropping the session closes the update channel and ends the printer.
    drop(session);
    printer.await?;
    Ok(())
}

/// Publishes a batch, optionally drops the link and reconnects for a second
/// batch, then lingers to print late updates.
async fn demo(session: &ClientSession, args: &ClientArgs) {
    publish(session, args).await;

    if let Some(pause) = args.reconnect_after() {
        session.disconnect().await;
        sleep(pause).await;
        if let Err(error) = session.reconnect().await {
            warn!(%error, "reconnect failed, skipping second batch");
            return;
        }
        publish(session, args).await;
    }

    sleep(args.linger()).await;
}

async fn publish(session: &ClientSession, args: &ClientArgs) {
    for sent in 0..args.count {
        match session.state() {
            SessionState::Stopped => {
                warn!(sent, "session stopped, no more positions will be published");
                return;
            }
            SessionState::Connected => {
                let position = synthetic_position();
                if let Err(error) = session.send(position, None).await {
                    warn!(%error, position, "position not published");
                }
            }
            state => info!(?state, "skipping publish while not connected"),
        }
        sleep(args.interval()).await;
    }
}

fn synthetic_position() -> f64 {
    rand::thread_rng().gen_range(POSITION_RANGE)
}

async fn print_updates(mut updates: mpsc::UnboundedReceiver<WireMessage>) {
    while let Some(update) = updates.recv().await {
        if let Err(error) = write_stdout(&render_update(&update)).await {
            warn!(?error, "failed to print update");
            return;
        }
    }
}

pub fn render_update(update: &WireMessage) -> String {
    format!(
        "{} {:.2} @ {}",
        update.identity(),
        update.position(),
        update.timestamp()
    )
}

async fn write_stdout(line: &str) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
