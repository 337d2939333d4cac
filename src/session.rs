use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::mpsc,
};
use tracing::{debug, info};

use crate::{
    protocol::{self, read_frame},
    registry::{ClientId, Outbox, RegisterError, Registry},
    router,
};

/// Drives one accepted connection through its whole lifecycle: registration
/// handshake, active message loop, and teardown.
///
/// The read half stays here and feeds the state machine; the write half goes
/// to a spawned writer task fed through the session's outbox channel. When a
/// write fails, the writer task exits and drops its receiver, so later sends
/// to this session report `Failed` and the registry reaps it.
///
/// Teardown always runs, also on a transport fault: the session is
/// unregistered (idempotent) and, if it had been registered, the remaining
/// sessions get a presence update.
pub async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (outbox, inbox) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_outgoing(writer, inbox));

    let client_id = registry.next_id();
    let outcome = run_session(&registry, &mut reader, client_id, &outbox, peer).await;

    let removed = registry.unregister(client_id).await;
    // Closing the outbox lets the writer task drain queued lines and exit.
    drop(outbox);
    let _ = writer_task.await;

    if let Some(name) = removed {
        info!(?peer, %name, "session closed");
        registry.broadcast_presence().await;
    }

    outcome
}

async fn run_session<R>(
    registry: &Registry,
    reader: &mut R,
    client_id: ClientId,
    outbox: &Outbox,
    peer: Option<SocketAddr>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let Some(name) = register_session(registry, reader, client_id, outbox).await? else {
        debug!(?peer, "peer closed before registering");
        return Ok(());
    };

    info!(?peer, %name, "user registered");
    registry.broadcast_presence().await;

    active_loop(registry, reader, client_id, &name).await
}

/// Registration loop: each inbound frame is a proposed display name; on a
/// collision the client is told `Taken` and may retry on the same
/// connection. Returns `None` when the peer closes before registering.
async fn register_session<R>(
    registry: &Registry,
    reader: &mut R,
    client_id: ClientId,
    outbox: &Outbox,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let Some(proposed) = read_frame(reader).await? else {
            return Ok(None);
        };

        match registry
            .register(client_id, proposed.clone(), outbox.clone())
            .await
        {
            Ok(()) => {
                send_or_bail(outbox, protocol::REGISTRATION_OK)?;
                return Ok(Some(proposed));
            }
            Err(RegisterError::NameTaken) => {
                debug!(name = %proposed, "rejected duplicate name");
                send_or_bail(outbox, protocol::REGISTRATION_TAKEN)?;
            }
        }
    }
}

async fn active_loop<R>(
    registry: &Registry,
    reader: &mut R,
    client_id: ClientId,
    name: &str,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let Some(message) = read_frame(reader).await? else {
            break;
        };
        if message == protocol::DISCONNECT_SENTINEL {
            debug!(%name, "received disconnect sentinel");
            break;
        }

        router::route(registry, client_id, name, &message).await;
    }

    Ok(())
}

fn send_or_bail(outbox: &Outbox, line: &str) -> Result<()> {
    if outbox.send(line.to_string()).is_err() {
        anyhow::bail!("connection writer closed");
    }
    Ok(())
}

async fn write_outgoing(mut writer: OwnedWriteHalf, mut inbox: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = inbox.recv().await {
        if let Err(error) = protocol::write_line(&mut writer, &line).await {
            debug!(?error, "connection writer stopping after failed send");
            return;
        }
    }
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down connection writer cleanly");
    }
}
