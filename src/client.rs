//! Client side: connect, log in, reconcile, then forward live changes.
//!
//! Each connection runs the same start sequence: login reply and an idle
//! snapshot are both required before reconciliation, and reconciliation is
//! fully sent before the watcher starts. When the connection drops, the
//! watcher is stopped and the sequence starts again with a fresh snapshot.

use crate::codec::{read_message, write_message};
use crate::config::ClientConfig;
use crate::inventory::InventoryEntry;
use crate::logger::Logger;
use crate::operation::{Message, Operation};
use crate::paths;
use crate::protocol::timeouts;
use crate::reconcile::reconcile;
use crate::server::SessionError;
use crate::snapshot::SnapshotTask;
use crate::socket;
use crate::transfer::{self, SendOutcome};
use crate::watcher::Watcher;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

/// How a connected session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    RootDeleted,
}

pub async fn connect(addr: &str) -> Result<TcpStream> {
    let stream = match timeout(
        Duration::from_millis(timeouts::CONNECT_MS),
        TcpStream::connect(addr),
    )
    .await
    {
        Ok(res) => res.with_context(|| format!("connect {}", addr))?,
        Err(_) => bail!("connect {} timed out", addr),
    };
    socket::tune(&stream);
    Ok(stream)
}

/// How long after losing a session an "Already logged in" reply is taken to
/// be our own connection, not yet noticed as dead by the server.
pub fn stale_session_grace() -> Duration {
    let keepalive = timeouts::KEEPALIVE_IDLE_SECS
        + timeouts::KEEPALIVE_INTERVAL_SECS * timeouts::KEEPALIVE_COUNT;
    Duration::from_secs(keepalive as u64) + Duration::from_millis(timeouts::AUTH_REPLY_MS)
}

/// A rejection is final unless a session of ours ended recently enough that
/// the server may still be holding it.
pub fn rejection_is_retryable(last_session_end: Option<Instant>, now: Instant) -> bool {
    last_session_end.is_some_and(|ended| now.saturating_duration_since(ended) < stale_session_grace())
}

/// Run until the watched root is deleted or the server rejects the login.
/// Connection failures are retried after `reconnect_delay`.
pub async fn run(cfg: ClientConfig, journal: Arc<dyn Logger>) -> Result<()> {
    let mut snapshot = SnapshotTask::spawn(cfg.root.clone());
    let mut last_session_end: Option<Instant> = None;
    loop {
        let stream = match connect(&cfg.server).await {
            Ok(s) => s,
            Err(e) => {
                warn!("{:#}; retrying in {:?}", e, cfg.reconnect_delay);
                tokio::time::sleep(cfg.reconnect_delay).await;
                continue;
            }
        };
        info!("connected to {}", cfg.server);

        match run_session(&cfg, stream, snapshot, journal.as_ref()).await {
            Ok(SessionEnd::RootDeleted) => {
                bail!("watched root {} was deleted", cfg.root.display());
            }
            Ok(SessionEnd::Disconnected) => {
                info!("connection to {} lost", cfg.server);
                last_session_end = Some(Instant::now());
            }
            Err(e) => {
                if let Some(SessionError::Rejected { .. }) = e.downcast_ref::<SessionError>() {
                    if !rejection_is_retryable(last_session_end, Instant::now()) {
                        return Err(e);
                    }
                    warn!("{:#}; the server may still hold our previous session, retrying", e);
                } else {
                    warn!("session failed: {:#}", e);
                    // A failed login may have left a session open server side
                    last_session_end = Some(Instant::now());
                }
            }
        }

        snapshot = SnapshotTask::spawn(cfg.root.clone());
        tokio::time::sleep(cfg.reconnect_delay).await;
    }
}

/// Send the login request and wait for the server's verdict.
pub async fn login(stream: &mut TcpStream, username: &str) -> Result<Vec<InventoryEntry>> {
    write_message(
        stream,
        &Message::new(Operation::AuthRequest {
            username: username.to_string(),
        })?,
    )
    .await?;

    let reply = match timeout(
        Duration::from_millis(timeouts::AUTH_REPLY_MS),
        read_message(stream),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => bail!("no login reply within {} ms", timeouts::AUTH_REPLY_MS),
    };
    let Some(reply) = reply else {
        return Err(SessionError::ConnectionLost.into());
    };
    match reply.into_parts().0 {
        Operation::AuthSuccess { inventory, .. } => Ok(inventory),
        Operation::AuthFailed { username, reason } => {
            Err(SessionError::Rejected { username, reason }.into())
        }
        other => bail!("unexpected login reply {}", other),
    }
}

async fn run_session(
    cfg: &ClientConfig,
    mut stream: TcpStream,
    snapshot: SnapshotTask,
    journal: &dyn Logger,
) -> Result<SessionEnd> {
    let inventory = login(&mut stream, &cfg.username).await?;
    info!(
        "logged in as {} ({} file(s) on server)",
        cfg.username,
        inventory.len()
    );

    let tree = snapshot.finish().await?;
    if cfg.print_tree {
        print!("{}", tree.render());
    }

    let (mut rd, mut wr) = stream.into_split();
    let ops = reconcile(&tree, inventory);
    info!("reconciliation: {} operation(s)", ops.len());
    let root = tree.root_path().to_path_buf();
    for op in ops {
        send_operation(&mut wr, &root, op, cfg, journal).await?;
    }

    let (tx, mut batches) = mpsc::unbounded_channel();
    let watcher = Watcher::start(tree, cfg.debounce, tx)?;

    // The server sends nothing after login; reading only detects the close.
    let mut closed = tokio::spawn(async move {
        loop {
            match read_message(&mut rd).await {
                Ok(Some(m)) => debug!("ignoring {} from server", m.operation()),
                Ok(None) => break,
                Err(e) => {
                    debug!("read side closed: {:#}", e);
                    break;
                }
            }
        }
    });

    let end = loop {
        tokio::select! {
            _ = &mut closed => break SessionEnd::Disconnected,
            batch = batches.recv() => {
                let Some(batch) = batch else { break SessionEnd::RootDeleted };
                let mut failed = false;
                for op in batch {
                    if let Err(e) = send_operation(&mut wr, &root, op, cfg, journal).await {
                        warn!("send failed: {:#}", e);
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break SessionEnd::Disconnected;
                }
            }
        }
    };

    closed.abort();
    watcher.shutdown().await;
    Ok(end)
}

/// Send one root-relative operation, with file bytes when it carries any.
pub async fn send_operation<W>(
    stream: &mut W,
    root: &Path,
    op: Operation,
    cfg: &ClientConfig,
    journal: &dyn Logger,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = op.clone().for_user(&cfg.username);
    if op.carries_file_bytes() {
        let rel = op.path().unwrap_or_default();
        let local = root.join(paths::from_wire(rel));
        match transfer::send_file(stream, &local, &wire, cfg.chunk_size).await? {
            SendOutcome::Sent { .. } => journal.sent(&wire),
            SendOutcome::Locked | SendOutcome::Vanished => return Ok(()),
        }
    } else {
        write_message(stream, &Message::new(wire.clone())?).await?;
        journal.sent(&wire);
    }
    debug!("sent {}", wire);
    Ok(())
}
