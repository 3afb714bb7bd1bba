use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{PeerConnection, PeerHandle, Received},
    matchmaker::{Admission, Matchmaker, Route, dispose_all},
    protocol::{
        self, Action, DEFAULT_BUFFER_SIZE, DISCONNECT_NOTICE, Delivery, END_SENTINEL,
        PLACEHOLDER_ACK,
    },
    registry::PeerId,
};

pub const DEFAULT_PORT: u16 = 8888;
/// Pending connections the kernel queues for the listener.
pub const LISTEN_BACKLOG: u32 = 100;

/// Runtime settings for a relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub buffer_size: usize,
    /// Tear down a connection that stays silent this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Tell the surviving partner when its peer vanishes without `end`.
    pub notify_disconnect: bool,
    /// Announce the second role as a terminal send, so that peer stops reading.
    pub legacy_second_role: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
            notify_disconnect: false,
            legacy_second_role: false,
        }
    }
}

/// Per-connection behaviour shared by every connection task.
#[derive(Debug, Clone, Copy)]
struct SessionPolicy {
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    notify_disconnect: bool,
}

pub struct Relay {
    listener: TcpListener,
    matchmaker: Arc<Matchmaker>,
    policy: SessionPolicy,
}

impl Relay {
    /// Binds a listener for `config.listen` with the relay's backlog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: RelayConfig) -> Result<Self> {
        let socket = if config.listen.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listener socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(config.listen)
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .with_context(|| format!("failed to listen on {}", config.listen))?;

        Self::new(listener, config)
    }

    /// Wraps an existing listener. `config.listen` is ignored.
    pub fn new(listener: TcpListener, config: RelayConfig) -> Result<Self> {
        ensure!(config.buffer_size > 0, "buffer size must be at least 1 byte");

        Ok(Self {
            listener,
            matchmaker: Arc::new(Matchmaker::new(config.legacy_second_role)),
            policy: SessionPolicy {
                buffer_size: config.buffer_size,
                idle_timeout: config.idle_timeout,
                notify_disconnect: config.notify_disconnect,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn matchmaker(&self) -> Arc<Matchmaker> {
        Arc::clone(&self.matchmaker)
    }

    /// Accepts connections until `shutdown` resolves, then evicts every live
    /// connection. A failed accept stops the relay with an error.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            matchmaker,
            policy,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    matchmaker.close_all().await;
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => admit_connection(stream, peer, &matchmaker, policy).await,
                    Err(err) => {
                        error!(error = ?err, "failed to accept connection");
                        matchmaker.close_all().await;
                        return Err(err).context("listener failed");
                    }
                },
            }
        }
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

/// Registers the connection (pairing it if possible) before the next accept,
/// then hands its reading side to a dedicated task.
async fn admit_connection(
    stream: TcpStream,
    peer: SocketAddr,
    matchmaker: &Arc<Matchmaker>,
    policy: SessionPolicy,
) {
    let (connection, handle) = PeerConnection::new(stream, peer, policy.buffer_size);

    match matchmaker.admit(handle.clone()).await {
        Admission::Rejected => {
            warn!(peer = %peer, "identity already registered; dropping connection");
            handle.dispose();
            return;
        }
        Admission::Waiting => info!(peer = %peer, "waiting for a partner"),
        Admission::Paired { partner, role } => {
            info!(peer = %peer, partner = %partner, role = role.label(), "joined session")
        }
    }

    let matchmaker = Arc::clone(matchmaker);
    tokio::spawn(async move {
        run_connection(connection, handle, matchmaker, policy).await;
    });
}

/// Receive loop for one connection. Each message is fully relayed before the
/// next read is issued.
async fn run_connection(
    mut connection: PeerConnection,
    handle: PeerHandle,
    matchmaker: Arc<Matchmaker>,
    policy: SessionPolicy,
) {
    let id = connection.id();

    loop {
        match connection.receive(policy.idle_timeout).await {
            Received::Message(text) => {
                debug!(peer = %id, bytes = text.len(), text = %text, "received");
                if !relay_message(id, text, &handle, &matchmaker).await {
                    break;
                }
            }
            Received::Disconnected => {
                info!(peer = %id, "peer disconnected");
                abandon_session(id, &matchmaker, policy).await;
                break;
            }
            Received::Failed(error) => {
                warn!(peer = %id, ?error, "receive failed");
                abandon_session(id, &matchmaker, policy).await;
                break;
            }
            Received::Idle => {
                info!(peer = %id, timeout = ?policy.idle_timeout, "peer idle for too long");
                abandon_session(id, &matchmaker, policy).await;
                break;
            }
            Received::Stopped => {
                debug!(peer = %id, signal = ?handle.signal(), "receive loop stopped");
                break;
            }
        }
    }
}

/// Applies the relay rules to one payload. Returns `false` once this
/// connection should stop reading.
async fn relay_message(
    id: PeerId,
    text: String,
    handle: &PeerHandle,
    matchmaker: &Matchmaker,
) -> bool {
    let partner = match matchmaker.route(&id).await {
        Route::Closed => return false,
        Route::Unpaired => None,
        Route::Paired(partner) => Some(partner),
    };

    match (protocol::dispatch(partner.is_some(), text), partner) {
        (Action::Acknowledge, _) => {
            if let Err(error) = handle.send(PLACEHOLDER_ACK, Delivery::Continue).await {
                warn!(peer = %id, ?error, "failed to acknowledge");
                matchmaker.teardown(id).await;
                return false;
            }
            true
        }
        (Action::Forward(text), Some(partner)) => {
            if let Err(error) = partner.send(&text, Delivery::Continue).await {
                warn!(peer = %id, partner = %partner.id(), ?error, "failed to forward");
                matchmaker.teardown(id).await;
                return false;
            }
            true
        }
        (Action::Terminate, Some(partner)) => {
            // Whoever detaches the session delivers the sentinel; a second
            // `end` racing from the partner finds nothing to detach.
            let removed = matchmaker.detach(id).await;
            if removed.is_empty() {
                return false;
            }
            if let Err(error) = partner.send(END_SENTINEL, Delivery::Final).await {
                debug!(peer = %partner.id(), ?error, "failed to forward end");
            }
            if let Err(error) = handle.send(END_SENTINEL, Delivery::Final).await {
                debug!(peer = %id, ?error, "failed to echo end");
            }
            info!(peer = %id, partner = %partner.id(), "session ended");
            dispose_all(removed);
            false
        }
        (_, None) => false,
    }
}

/// Tears down the session of a connection that can no longer make progress.
async fn abandon_session(id: PeerId, matchmaker: &Matchmaker, policy: SessionPolicy) {
    if policy.notify_disconnect {
        if let Route::Paired(partner) = matchmaker.route(&id).await {
            if let Err(error) = partner.send(DISCONNECT_NOTICE, Delivery::Final).await {
                debug!(peer = %partner.id(), ?error, "failed to send disconnect notice");
            }
        }
    }
    matchmaker.teardown(id).await;
}
