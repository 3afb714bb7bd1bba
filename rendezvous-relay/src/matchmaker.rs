use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    connection::PeerHandle,
    protocol::{Role, announcement_delivery, assign_roles},
    registry::{Lookup, PeerId, Registry, Session},
};

/// How a connection should handle its next inbound payload.
#[derive(Debug)]
pub enum Route {
    Unpaired,
    Paired(PeerHandle),
    Closed,
}

/// Result of admitting a freshly accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Registered; no partner is available yet.
    Waiting,
    /// Registered and paired straight away.
    Paired { partner: PeerId, role: Role },
    /// Another live connection already uses this identity.
    Rejected,
}

/// Owns the registry of live connections and decides who pairs with whom.
///
/// Every mutation and every pairing decision happens under one lock, so two
/// arrivals can never claim the same waiting connection. Role labels are
/// queued on the members' outboxes before the lock is released, which puts
/// them ahead of anything a partner can forward. Nothing under the lock waits
/// on a socket.
#[derive(Debug, Default)]
pub struct Matchmaker {
    registry: Mutex<Registry<PeerHandle>>,
    legacy_second_role: bool,
}

impl Matchmaker {
    pub fn new(legacy_second_role: bool) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            legacy_second_role,
        }
    }

    /// Registers `handle` and pairs it with a waiting connection if there is
    /// one, queuing the role labels for both sides.
    pub async fn admit(&self, handle: PeerHandle) -> Admission {
        let id = handle.id();
        let mut registry = self.registry.lock().await;
        if !registry.insert(id, handle) {
            return Admission::Rejected;
        }

        let Some(session) = registry.pair_first_unpaired(&id) else {
            return Admission::Waiting;
        };
        let (partner, is_later) = if session.later.id == id {
            (session.earlier.id, true)
        } else {
            (session.later.id, false)
        };
        let roles = announce(&mut registry, session, self.legacy_second_role);
        let role = if is_later { roles.1 } else { roles.0 };
        Admission::Paired { partner, role }
    }

    /// Registers `handle` without attempting to pair it.
    pub async fn register(&self, handle: PeerHandle) -> bool {
        let id = handle.id();
        self.registry.lock().await.insert(id, handle)
    }

    /// Pairs an already registered connection with the first waiting one.
    /// Returns `true` if a session was formed.
    pub async fn try_pair(&self, id: PeerId) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.pair_first_unpaired(&id) {
            Some(session) => {
                announce(&mut registry, session, self.legacy_second_role);
                true
            }
            None => false,
        }
    }

    pub async fn route(&self, id: &PeerId) -> Route {
        match self.registry.lock().await.lookup(id) {
            Lookup::Missing => Route::Closed,
            Lookup::Unpaired => Route::Unpaired,
            Lookup::Paired { handle, .. } => Route::Paired(handle.clone()),
        }
    }

    pub async fn partner_of(&self, id: &PeerId) -> Option<PeerId> {
        self.registry.lock().await.partner_of(id)
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.registry.lock().await.contains(id)
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }

    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.session_count()
    }

    /// Removes both connections (and any partners they still have) and
    /// releases their sockets. Evicting an already evicted pair does nothing.
    pub async fn evict(&self, a: PeerId, b: PeerId) {
        let removed = {
            let mut registry = self.registry.lock().await;
            let mut removed = registry.remove_session(&a);
            removed.extend(registry.remove_session(&b));
            removed
        };
        dispose_all(removed);
    }

    /// Removes the session `id` belongs to and hands its members to the
    /// caller without closing them. Only one caller ever receives a given
    /// session; later calls get an empty list.
    pub async fn detach(&self, id: PeerId) -> Vec<PeerHandle> {
        self.registry.lock().await.remove_session(&id)
    }

    /// Evicts the session `id` belongs to, or `id` alone if it is unpaired.
    pub async fn teardown(&self, id: PeerId) {
        let removed = self.detach(id).await;
        if !removed.is_empty() {
            info!(peer = %id, evicted = removed.len(), "session torn down");
        }
        dispose_all(removed);
    }

    /// Evicts every live connection.
    pub async fn close_all(&self) {
        let removed = self.registry.lock().await.drain();
        dispose_all(removed);
    }
}

/// Queues each member of a new session its role label. A member whose
/// connection is already gone takes the session down with it.
fn announce(
    registry: &mut Registry<PeerHandle>,
    session: Session<PeerHandle>,
    legacy_second_role: bool,
) -> (Role, Role) {
    let roles = assign_roles(&session.earlier.id, &session.later.id);
    info!(
        earlier = %session.earlier.id,
        later = %session.later.id,
        earlier_role = roles.0.label(),
        later_role = roles.1.label(),
        "paired connections"
    );

    for (member, role) in [(&session.earlier, roles.0), (&session.later, roles.1)] {
        let delivery = announcement_delivery(role, legacy_second_role);
        if let Err(error) = member.handle.post(role.label(), delivery) {
            warn!(peer = %member.id, ?error, "failed to announce role");
            dispose_all(registry.remove_session(&member.id));
            break;
        }
    }

    roles
}

pub fn dispose_all(handles: Vec<PeerHandle>) {
    for handle in handles {
        handle.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    use super::*;
    use crate::{
        connection::{PeerConnection, Signal},
        protocol::{DEFAULT_BUFFER_SIZE, Delivery},
    };

    struct Client {
        stream: TcpStream,
        handle: PeerHandle,
        _connection: PeerConnection,
    }

    async fn connect(listener: &TcpListener) -> Client {
        let stream = TcpStream::connect(listener.local_addr().expect("addr"))
            .await
            .expect("connect");
        let (accepted, peer) = listener.accept().await.expect("accept");
        let (connection, handle) = PeerConnection::new(accepted, peer, DEFAULT_BUFFER_SIZE);
        Client {
            stream,
            handle,
            _connection: connection,
        }
    }

    async fn read_text(stream: &mut TcpStream) -> String {
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn admit_pairs_second_arrival_and_announces_roles() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let matchmaker = Matchmaker::new(false);

        let mut x = connect(&listener).await;
        assert_eq!(matchmaker.admit(x.handle.clone()).await, Admission::Waiting);

        let mut y = connect(&listener).await;
        let admission = matchmaker.admit(y.handle.clone()).await;
        assert!(matches!(
            admission,
            Admission::Paired { partner, .. } if partner == x.handle.id()
        ));

        assert_eq!(
            matchmaker.partner_of(&x.handle.id()).await,
            Some(y.handle.id())
        );
        assert_eq!(
            matchmaker.partner_of(&y.handle.id()).await,
            Some(x.handle.id())
        );

        let x_label = read_text(&mut x.stream).await;
        let y_label = read_text(&mut y.stream).await;
        assert_ne!(x_label, y_label);
        let mut labels = [x_label, y_label];
        labels.sort();
        assert_eq!(labels, ["black".to_string(), "white".to_string()]);
    }

    #[tokio::test]
    async fn register_then_try_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let matchmaker = Matchmaker::new(false);
        let x = connect(&listener).await;
        let y = connect(&listener).await;

        assert!(matchmaker.register(x.handle.clone()).await);
        assert!(!matchmaker.register(x.handle.clone()).await);
        assert!(!matchmaker.try_pair(x.handle.id()).await);
        assert!(matchmaker.register(y.handle.clone()).await);
        assert!(matchmaker.try_pair(y.handle.id()).await);
        assert!(!matchmaker.try_pair(y.handle.id()).await);
        assert!(matches!(
            matchmaker.route(&x.handle.id()).await,
            Route::Paired(partner) if partner == y.handle
        ));
    }

    #[tokio::test]
    async fn role_label_is_queued_before_the_session_is_routable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let matchmaker = Matchmaker::new(false);
        let x = connect(&listener).await;
        let mut y = connect(&listener).await;
        matchmaker.admit(x.handle.clone()).await;
        matchmaker.admit(y.handle.clone()).await;

        let Route::Paired(partner) = matchmaker.route(&x.handle.id()).await else {
            panic!("x should be paired");
        };
        partner
            .send("move:a2a3", Delivery::Continue)
            .await
            .expect("forward");

        let mut received = String::new();
        while received.len() < "move:a2a3".len() + "black".len() {
            received.push_str(&read_text(&mut y.stream).await);
        }
        assert!(
            received == "whitemove:a2a3" || received == "blackmove:a2a3",
            "label did not come first: {received:?}"
        );
    }

    #[tokio::test]
    async fn detach_hands_a_session_out_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let matchmaker = Matchmaker::new(false);
        let x = connect(&listener).await;
        let y = connect(&listener).await;
        matchmaker.admit(x.handle.clone()).await;
        matchmaker.admit(y.handle.clone()).await;
        assert_eq!(matchmaker.session_count().await, 1);

        let first = matchmaker.detach(x.handle.id()).await;
        let second = matchmaker.detach(y.handle.id()).await;
        assert_eq!(first, vec![x.handle.clone(), y.handle.clone()]);
        assert!(second.is_empty());
        assert_eq!(x.handle.signal(), Signal::Open);
        assert!(matchmaker.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_and_try_pair_never_share_a_partner() {
        const CLIENTS: usize = 15;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let matchmaker = std::sync::Arc::new(Matchmaker::new(false));

        let mut clients = Vec::with_capacity(CLIENTS);
        for _ in 0..CLIENTS {
            clients.push(connect(&listener).await);
        }

        let tasks: Vec<_> = clients
            .iter()
            .map(|client| {
                let matchmaker = std::sync::Arc::clone(&matchmaker);
                let handle = client.handle.clone();
                tokio::spawn(async move {
                    let id = handle.id();
                    assert!(matchmaker.register(handle).await);
                    matchmaker.try_pair(id).await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join");
        }

        assert_eq!(matchmaker.len().await, CLIENTS);
        assert_eq!(matchmaker.session_count().await, CLIENTS / 2);
        let mut unpaired = 0;
        for client in &clients {
            let id = client.handle.id();
            match matchmaker.partner_of(&id).await {
                Some(partner) => {
                    assert_ne!(partner, id);
                    assert_eq!(matchmaker.partner_of(&partner).await, Some(id));
                }
                None => unpaired += 1,
            }
        }
        assert_eq!(unpaired, CLIENTS % 2);
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let matchmaker = Matchmaker::new(false);
        let x = connect(&listener).await;
        let y = connect(&listener).await;
        matchmaker.admit(x.handle.clone()).await;
        matchmaker.admit(y.handle.clone()).await;

        matchmaker.evict(x.handle.id(), y.handle.id()).await;
        matchmaker.evict(x.handle.id(), y.handle.id()).await;
        matchmaker.teardown(y.handle.id()).await;

        assert!(matchmaker.is_empty().await);
        assert!(matches!(
            matchmaker.route(&x.handle.id()).await,
            Route::Closed
        ));
    }

    #[tokio::test]
    async fn teardown_of_unpaired_connection_frees_its_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let matchmaker = Matchmaker::new(false);
        let x = connect(&listener).await;
        matchmaker.admit(x.handle.clone()).await;
        matchmaker.teardown(x.handle.id()).await;

        let y = connect(&listener).await;
        assert_eq!(matchmaker.admit(y.handle.clone()).await, Admission::Waiting);
        assert_eq!(matchmaker.len().await, 1);
        assert!(!matchmaker.contains(&x.handle.id()).await);
    }
}
