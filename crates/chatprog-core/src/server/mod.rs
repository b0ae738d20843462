//! The chat server: admission, the tick-driven control loop, and
//! broadcast/unicast routing.
//!
//! One accept task blocks on the listener and only enqueues raw
//! connections; the control loop owns all roster state and is the only
//! task that ever touches it, so the roster itself needs no locking. Each
//! tick the loop drains newly accepted connections, polls pending
//! handshakes, and polls every active member for at most one frame.
//!
//! Per-connection state machine:
//! `PENDING -> (key exchange, name validate) -> ACTIVE -> (quit | kick |
//! disconnect) -> CLOSED`.

mod attachments;
mod conn;
mod dispatch;
mod group;

pub use attachments::{AttachmentStore, StoredAttachment};
pub use group::{Group, Member};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::crypto::{PeerKey, SessionKey};
use crate::error::{Error, Result};
use crate::protocol::payload::{Payload, ServerMsg};
use conn::{AdmissionPoll, PendingConn, Polled, SecureConn};

/// Display colors assigned to members at admission.
const COLORS: [&str; 8] = [
    "#aa0000", "#005500", "#00007f", "#aa007f", "#00557f", "#550000", "#b07500", "#00aa00",
];

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind: String,
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// Names that are admitted with manager permissions automatically.
    pub manager_names: Vec<String>,
    /// Control-loop tick interval.
    pub tick: Duration,
    /// How long a pending connection may take to complete admission.
    pub admission_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            manager_names: Vec::new(),
            tick: Duration::from_millis(50),
            admission_timeout: Duration::from_secs(10),
        }
    }
}

/// Signals the server to stop at the next tick.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// The chat server.
pub struct Server {
    config: ServerConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    session_key: SessionKey,
    group: Group,
    pending: Vec<PendingConn>,
    attachments: AttachmentStore,
    first_member_seen: bool,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Bind the listener and generate the process-wide session key.
    ///
    /// Failure to bind is fatal and aborts startup; per-connection errors
    /// later on never do.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(addr = %local_addr, "chat server listening");
        Ok(Self {
            config,
            listener: Some(listener),
            local_addr,
            session_key: SessionKey::generate(),
            group: Group::new(),
            pending: Vec::new(),
            attachments: AttachmentStore::new(),
            first_member_seen: false,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that can stop the server from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Drive the server until shutdown is signalled.
    pub async fn run(mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::Protocol("server already running".into()))?;
        let (pending_tx, mut pending_rx) = mpsc::channel::<TcpStream>(64);
        tokio::spawn(accept_loop(
            listener,
            pending_tx,
            self.shutdown_rx.clone(),
        ));

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if *self.shutdown_rx.borrow() {
                break;
            }
            while let Ok(stream) = pending_rx.try_recv() {
                debug!(
                    pending = self.pending.len() + 1,
                    "connection awaiting admission"
                );
                self.pending.push(PendingConn::new(stream));
            }
            self.admit_pending().await;
            self.poll_members().await;
        }

        info!("chat server stopped");
        Ok(())
    }

    /// Poll every pending connection, admitting completed handshakes.
    async fn admit_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for mut conn in pending {
            if conn.age() > self.config.admission_timeout {
                debug!("pending connection timed out");
                continue;
            }
            match conn.poll() {
                AdmissionPoll::Waiting => self.pending.push(conn),
                AdmissionPoll::Failed => debug!("pending connection dropped"),
                AdmissionPoll::Ready { name, key } => self.admit(conn, name, key).await,
            }
        }
    }

    /// Validate and admit one completed handshake.
    async fn admit(&mut self, mut conn: PendingConn, name: String, key: PeerKey) {
        if name.is_empty() || self.group.contains(&name) {
            let notice =
                Payload::Server(ServerMsg::system("Connection Refused: Name is already taken."));
            if let Err(e) = conn.send_plain(&notice).await {
                debug!(error = %e, "rejection notice failed");
            }
            info!(name = %name, "admission rejected");
            return; // dropping the connection closes it
        }

        let encrypted = match key.encrypt_session_key(&self.session_key) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                warn!(name = %name, error = %e, "session key delivery failed");
                return;
            }
        };
        if let Err(e) = conn.send_plain(&Payload::Bytes(encrypted)).await {
            debug!(name = %name, error = %e, "session key delivery failed");
            return;
        }

        let color = COLORS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(COLORS[0]);
        let is_manager =
            self.config.manager_names.iter().any(|m| m == &name) || !self.first_member_seen;
        self.first_member_seen = true;

        let member = Member::new(
            name.clone(),
            color.to_string(),
            is_manager,
            key,
            SecureConn::new(conn.into_stream()),
        );
        let display = member.to_string();
        self.group.add(member);
        info!(name = %name, members = self.group.len(), "member joined");

        self.broadcast(
            &Payload::Server(ServerMsg::system(format!("{display} joined the chat."))),
            &[],
        )
        .await;
        self.unicast(
            &name,
            &Payload::Server(ServerMsg::system(
                "Tip: Type /help to display available commands.",
            )),
        )
        .await;
    }

    /// Poll every active member for at most one frame and dispatch it.
    async fn poll_members(&mut self) {
        for name in self.group.names() {
            let polled = match self.group.get_mut(&name) {
                Some(member) => member.conn.poll(&self.session_key),
                None => continue, // removed earlier this tick
            };
            match polled {
                Polled::Idle => {}
                Polled::Message(payload) => self.handle(&name, payload).await,
                Polled::Closed => {
                    // abrupt disconnect: reap silently, unlike a graceful quit
                    if self.group.remove_by_name(&name).is_ok() {
                        info!(name = %name, members = self.group.len(), "connection lost");
                    }
                }
            }
        }
    }

    /// Send to one member; a failed send reaps the member silently.
    pub(crate) async fn unicast(&mut self, name: &str, payload: &Payload) {
        let result = match self.group.get_mut(name) {
            Some(member) => member.conn.send(&self.session_key, payload).await,
            None => return,
        };
        if let Err(e) = result {
            debug!(name = %name, error = %e, "unicast failed");
            let _ = self.group.remove_by_name(name);
        }
    }

    /// Send to every member except `exclude`, in roster order.
    pub(crate) async fn broadcast(&mut self, payload: &Payload, exclude: &[&str]) {
        let mut dead = Vec::new();
        for member in self.group.iter_mut() {
            if exclude.contains(&member.name()) {
                continue;
            }
            if let Err(e) = member.conn.send(&self.session_key, payload).await {
                debug!(name = %member.name(), error = %e, "broadcast send failed");
                dead.push(member.name().to_string());
            }
        }
        // removal is deferred so the traversal above never invalidates
        for name in dead {
            let _ = self.group.remove_by_name(&name);
        }
    }
}

/// Accept connections and enqueue them for admission.
async fn accept_loop(
    listener: TcpListener,
    pending_tx: mpsc::Sender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "connection accepted");
                    if pending_tx.send(stream).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("accept loop stopped");
}
