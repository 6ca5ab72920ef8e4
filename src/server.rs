//! Daemon side: accept loop, login handshake and per-connection apply loop.

use crate::apply::Applier;
use crate::codec::{read_message, write_message};
use crate::config::validate_username;
use crate::inventory;
use crate::logger::Logger;
use crate::operation::{Message, Operation};
use crate::protocol::{timeouts, ALREADY_LOGGED_IN};
use crate::socket;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("user {0} is already logged in")]
    AlreadyLoggedIn(String),
    #[error("login rejected for {username}: {reason}")]
    Rejected { username: String, reason: String },
    #[error("connection lost")]
    ConnectionLost,
}

/// Usernames with a live connection. One session per user at a time.
#[derive(Clone, Default)]
pub struct Sessions {
    inner: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl Sessions {
    pub fn open(&self, username: &str) -> Result<SessionGuard, SessionError> {
        let mut active = self.inner.lock();
        if active.contains_key(username) {
            return Err(SessionError::AlreadyLoggedIn(username.to_string()));
        }
        let id = Uuid::new_v4();
        active.insert(username.to_string(), id);
        Ok(SessionGuard {
            sessions: self.clone(),
            username: username.to_string(),
            id,
        })
    }

    pub fn is_active(&self, username: &str) -> bool {
        self.inner.lock().contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a username's session; dropping it logs the user out.
pub struct SessionGuard {
    sessions: Sessions,
    username: String,
    id: Uuid,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut active = self.sessions.inner.lock();
        if active.get(&self.username) == Some(&self.id) {
            active.remove(&self.username);
        }
    }
}

pub async fn serve(bind: &str, root: &Path, journal: Arc<dyn Logger>) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    serve_listener(listener, root, journal).await
}

/// Accept connections forever on an already bound listener.
pub async fn serve_listener(listener: TcpListener, root: &Path, journal: Arc<dyn Logger>) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("canonicalize root {}", root.display()))?;
    info!(
        "cloudsync daemon listening on {} root={}",
        listener.local_addr()?,
        root.display()
    );
    let sessions = Sessions::default();
    loop {
        let (stream, peer) = listener.accept().await?;
        socket::tune(&stream);
        debug!("connection from {}", peer);
        let root = root.clone();
        let sessions = sessions.clone();
        let journal = journal.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, root, sessions, journal).await {
                warn!("connection {} ended with error: {:#}", peer, e);
            }
        });
    }
}

/// Resolves once the peer has closed its side. Pending forever if it sends
/// data instead.
async fn peer_closed(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}

async fn reply(stream: &mut TcpStream, op: Operation) -> Result<()> {
    write_message(stream, &Message::new(op)?).await
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    root: PathBuf,
    sessions: Sessions,
    journal: Arc<dyn Logger>,
) -> Result<()> {
    let first = match timeout(
        Duration::from_millis(timeouts::AUTH_REPLY_MS),
        read_message(&mut stream),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => bail!("no login within {} ms", timeouts::AUTH_REPLY_MS),
    };
    let Some(first) = first else {
        return Ok(());
    };
    let Operation::AuthRequest { username } = first.operation().clone() else {
        bail!("expected AuthRequest, got {}", first.operation());
    };

    if let Err(e) = validate_username(&username) {
        reply(
            &mut stream,
            Operation::AuthFailed {
                username,
                reason: e.to_string(),
            },
        )
        .await?;
        return Ok(());
    }
    let session = match sessions.open(&username) {
        Ok(guard) => guard,
        Err(e) => {
            info!("rejecting {} from {}: {}", username, peer, e);
            reply(
                &mut stream,
                Operation::AuthFailed {
                    username,
                    reason: ALREADY_LOGGED_IN.to_string(),
                },
            )
            .await?;
            return Ok(());
        }
    };

    let mut applier = Applier::new(&root, &username, journal.clone())?;
    let sandbox = applier.sandbox().to_path_buf();
    let scan = tokio::task::spawn_blocking(move || inventory::scan(&sandbox));
    // A client that gave up waiting must not keep its username locked
    // until a long scan finishes.
    let inventory = tokio::select! {
        res = scan => res.context("inventory scan panicked")?,
        _ = peer_closed(&stream) => {
            info!("{} from {} left during the inventory scan", username, peer);
            return Ok(());
        }
    };
    info!(
        "{} logged in from {} ({} file(s) on server, session {})",
        username,
        peer,
        inventory.len(),
        session.id()
    );
    reply(
        &mut stream,
        Operation::AuthSuccess {
            username: username.clone(),
            inventory,
        },
    )
    .await?;
    journal.session_start(&username, &peer.to_string());

    let started = Instant::now();
    let result = loop {
        let message = match read_message(&mut stream).await {
            Ok(Some(m)) => m,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let what = message.operation().to_string();
        if let Err(e) = applier.apply(message) {
            error!("{}: failed to apply {}: {:#}", username, what, e);
            journal.error("apply", &what, &format!("{:#}", e));
        }
    };

    info!(
        "{} logged out after {:.1?} ({} operation(s), {} byte(s))",
        username,
        started.elapsed(),
        applier.applied(),
        applier.bytes_written()
    );
    journal.session_end(
        &username,
        applier.applied(),
        applier.bytes_written(),
        started.elapsed().as_secs_f64(),
    );
    result
}
