//! Client accept loop.
//!
//! Connections speak the command envelope. Each request becomes a queued
//! command; the socket waits for its response unless the client asked to be
//! forgotten, in which case it gets an immediate `202 Accepted` and the
//! command finishes on its own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

use crate::codec::EnvelopeCodec;
use crate::command::{Command, Envelope, ResponseRoute};
use crate::queue::CommandQueue;

/// Command ids are process-unique; escalated commands keep the leader's ids
/// separate per originating node.
static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_command_id() -> u64 {
    NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)
}

pub async fn run(addr: SocketAddr, queue: Arc<CommandQueue>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind client listener {addr}"))?;
    tracing::info!(%addr, "client listener up");
    loop {
        let (socket, remote) = listener.accept().await?;
        let queue = queue.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, queue).await {
                tracing::debug!(%remote, error = %err, "client connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, queue: Arc<CommandQueue>) -> anyhow::Result<()> {
    socket.set_nodelay(true).ok();
    let mut framed = Framed::new(socket, EnvelopeCodec);
    while let Some(request) = framed.next().await {
        let request = request?;
        let id = next_command_id();
        let forget = request
            .headers
            .get("Connection")
            .map(|v| v.eq_ignore_ascii_case("forget"))
            .unwrap_or(false);

        if forget {
            let cmd = Command::from_request(id, request, ResponseRoute::Forgotten);
            if !queue.enqueue(cmd) {
                // Shutting down; let the client synthesize its failure.
                break;
            }
            let mut accepted = Envelope::new("202 Accepted");
            accepted.headers.set("commandID", id.to_string());
            framed.send(accepted).await?;
            // The socket is not held; the command finishes on its own.
            break;
        }

        let (tx, rx) = oneshot::channel();
        let cmd = Command::from_request(id, request, ResponseRoute::Client(tx));
        if !queue.enqueue(cmd) {
            break;
        }
        // One request at a time per connection; the next read waits for this
        // response to go out.
        match rx.await {
            Ok(response) => framed.send(response).await?,
            Err(_) => break,
        }
    }
    Ok(())
}
