//! The mesh: one connection per remote participant, created when the participant shows up and closed when it
//! leaves. The pool routes signaling to the right connection and exposes what each connection looks like.

mod connection;
mod state;

use crate::{
    id::PeerId,
    pipeline::OutgoingMediaState,
    signaling::{
        SignalMessage,
        SignalingClient,
        SignalingEvent,
    },
    transport::TransportFactory,
};
use connection::{
    ConnectionHandle,
    ConnectionParams,
};
use meshcall_config::ConnectionConfig;
pub use state::{
    ConnectionSnapshot,
    ConnectionState,
    NegotiationRole,
    PoolEvent,
    QualityTag,
    RemoteStream,
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::{
        Arc,
        Mutex,
        Weak,
    },
};
use tokio::sync::{
    broadcast,
    watch,
};
use tokio_util::sync::{
    CancellationToken,
    DropGuard,
};

struct PoolInner {
    local: PeerId,
    config: ConnectionConfig,
    signaling: Arc<dyn SignalingClient>,
    transports: Arc<dyn TransportFactory>,
    outgoing: watch::Receiver<Arc<OutgoingMediaState>>,
    connections: Mutex<HashMap<PeerId, ConnectionHandle>>,
    events: broadcast::Sender<PoolEvent>,
    cancel: CancellationToken,
    router: Mutex<Option<DropGuard>>,
}

/// Owns every connection of the local participant. Clones share the same pool.
#[derive(Clone)]
pub struct PeerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("local", &self.inner.local)
            .field("peers", &self.peers())
            .finish_non_exhaustive()
    }
}

impl PeerPool {
    pub fn new(
        signaling: Arc<dyn SignalingClient>,
        transports: Arc<dyn TransportFactory>,
        outgoing: watch::Receiver<Arc<OutgoingMediaState>>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                local: signaling.local_id().clone(),
                config,
                signaling,
                transports,
                outgoing,
                connections: Default::default(),
                events: broadcast::channel(256).0,
                cancel: CancellationToken::new(),
                router: Default::default(),
            }),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    /// Starts following room presence and routing negotiation messages. Participants that join create a
    /// connection, participants that leave close theirs. Idempotent.
    pub fn start(&self) {
        let mut router = self.inner.router.lock().unwrap();
        if router.is_some() {
            return;
        }
        let cancel = self.inner.cancel.child_token();
        *router = Some(cancel.clone().drop_guard());

        let mut signaling_events = self.inner.signaling.subscribe();
        let pool = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = signaling_events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = Weak::upgrade(&pool) else {
                    break;
                };
                PeerPool { inner }.route(event);
            }
            debug!("signaling router stopped");
        });
    }

    /// Stops reacting to room presence. Existing connections stay up.
    pub fn stop(&self) {
        self.inner.router.lock().unwrap().take();
    }

    /// Whether signaling events are currently being followed.
    pub fn is_routing(&self) -> bool {
        self.inner.router.lock().unwrap().is_some()
    }

    fn route(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::PeerJoined(peer_id) => {
                // an offer sent before the peer was present went nowhere
                let unanswered = self
                    .snapshot(&peer_id)
                    .is_some_and(|s| s.state == ConnectionState::Negotiating && s.negotiations == 0);
                if unanswered {
                    debug!(peer = %peer_id, "peer joined before the first negotiation completed, starting over");
                    self.remove_peer(&peer_id);
                }
                self.add_peer(peer_id);
            }
            SignalingEvent::PeerLeft(peer_id) => {
                self.remove_peer(&peer_id);
            }
            SignalingEvent::Disconnected => {
                // media keeps flowing peer to peer; only presence and negotiation stop
                warn!(local = %self.inner.local, peers = self.len(), "signaling relay lost");
                self.stop();
            }
            SignalingEvent::Message(envelope) => {
                if let SignalMessage::Leave { .. } = envelope.message {
                    self.remove_peer(&envelope.from);
                    return;
                }
                let mut connections = self.inner.connections.lock().unwrap();
                let live = connections
                    .get(&envelope.from)
                    .is_some_and(|c| !c.snapshot().state.is_terminal());
                if !live {
                    // the offer can overtake the presence announcement
                    if !matches!(envelope.message, SignalMessage::Offer { .. }) || self.inner.cancel.is_cancelled() {
                        debug!(from = %envelope.from, message = %envelope.message, "dropping message for unknown peer");
                        return;
                    }
                    let handle = self.spawn_connection(envelope.from.clone());
                    connections.insert(envelope.from.clone(), handle);
                }
                if let Some(connection) = connections.get(&envelope.from) {
                    connection.deliver(envelope.message);
                }
            }
        }
    }

    fn spawn_connection(&self, peer: PeerId) -> ConnectionHandle {
        info!(local = %self.inner.local, %peer, "opening connection");
        ConnectionHandle::spawn(ConnectionParams {
            local: self.inner.local.clone(),
            peer,
            config: self.inner.config,
            signaling: self.inner.signaling.clone(),
            transports: self.inner.transports.clone(),
            outgoing: self.inner.outgoing.clone(),
            events: self.inner.events.clone(),
            cancel: self.inner.cancel.child_token(),
        })
    }

    /// Opens a connection to `peer` unless one is already open. A connection that failed or was closed is
    /// replaced. Returns whether a new connection was created.
    pub fn add_peer(&self, peer: impl Into<PeerId>) -> bool {
        let peer = peer.into();
        if peer == self.inner.local || self.inner.cancel.is_cancelled() {
            return false;
        }
        let mut connections = self.inner.connections.lock().unwrap();
        if connections.get(&peer).is_some_and(|c| !c.snapshot().state.is_terminal()) {
            return false;
        }
        let handle = self.spawn_connection(peer.clone());
        // a replaced connection closes on drop
        connections.insert(peer, handle);
        true
    }

    /// Closes and forgets the connection to `peer`. Its transport and timers are released before this returns.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self.inner.connections.lock().unwrap().remove(peer);
        match removed {
            Some(connection) => {
                info!(local = %self.inner.local, %peer, "closing connection");
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Stops routing and closes every connection. The pool can be started again.
    pub fn clear(&self) {
        self.stop();
        let connections: Vec<ConnectionHandle> = self.inner.connections.lock().unwrap().drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.close();
        }
        debug!(local = %self.inner.local, closed = connections.len(), "closed all connections");
    }

    /// Like [`PeerPool::clear`], but the pool accepts no new peers afterwards.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.clear();
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.connections.lock().unwrap().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, peer: &PeerId) -> Option<ConnectionSnapshot> {
        self.inner.connections.lock().unwrap().get(peer).map(|c| c.snapshot())
    }

    pub fn snapshots(&self) -> BTreeMap<PeerId, ConnectionSnapshot> {
        let connections = self.inner.connections.lock().unwrap();
        connections.iter().map(|(id, c)| (id.clone(), c.snapshot())).collect()
    }

    pub fn watch(&self, peer: &PeerId) -> Option<watch::Receiver<ConnectionSnapshot>> {
        self.inner.connections.lock().unwrap().get(peer).map(|c| c.watch())
    }

    /// Read-only view of what `peer` sends us.
    pub fn remote_stream(&self, peer: &PeerId) -> Option<watch::Receiver<RemoteStream>> {
        self.inner.connections.lock().unwrap().get(peer).map(|c| c.remote_stream())
    }

    pub fn quality(&self, peer: &PeerId) -> QualityTag {
        self.snapshot(peer).map(|s| s.quality).unwrap_or_default()
    }

    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signaling::LocalSignalingHub,
        transport::SimulatedNetwork,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn pool(hub: &LocalSignalingHub, network: &SimulatedNetwork, id: &str) -> PeerPool {
        let outgoing = watch::channel(Arc::new(OutgoingMediaState::default())).1;
        let pool = PeerPool::new(
            Arc::new(hub.client(id)),
            Arc::new(network.clone()),
            outgoing,
            ConnectionConfig::default(),
        );
        pool.start();
        pool
    }

    async fn settle(pool: &PeerPool, peer: &str, state: ConnectionState) {
        let mut snapshots = pool.watch(&peer.into()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|s| s.state == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn presence_drives_the_mesh() {
        let (hub, network) = (LocalSignalingHub::new(), SimulatedNetwork::new());
        let alice = pool(&hub, &network, "alice");
        let bob = pool(&hub, &network, "bob");
        hub.client("alice").join("room").unwrap();
        hub.client("bob").join("room").unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        settle(&alice, "bob", ConnectionState::Connected).await;
        settle(&bob, "alice", ConnectionState::Connected).await;
        assert_eq!(alice.peers(), vec![PeerId::from("bob")]);

        let mut events = alice.events();
        hub.client("bob").leave().unwrap();
        loop {
            if let PoolEvent::StateChanged {
                to: ConnectionState::Closed,
                peer_id,
                ..
            } = events.recv().await.unwrap()
            {
                assert_eq!(peer_id, PeerId::from("bob"));
                break;
            }
        }
        assert!(alice.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn peers_added_ahead_of_presence_still_connect() {
        let (hub, network) = (LocalSignalingHub::new(), SimulatedNetwork::new());
        let alice = pool(&hub, &network, "alice");
        hub.client("alice").join("room").unwrap();
        alice.add_peer("bob");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let bob = pool(&hub, &network, "bob");
        hub.client("bob").join("room").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        settle(&alice, "bob", ConnectionState::Connected).await;
        settle(&bob, "alice", ConnectionState::Connected).await;
        assert_eq!(alice.snapshot(&"bob".into()).unwrap().negotiations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_relay_stops_routing_without_closing_connections() {
        let (hub, network) = (LocalSignalingHub::new(), SimulatedNetwork::new());
        let alice = pool(&hub, &network, "alice");
        let _bob = pool(&hub, &network, "bob");
        hub.client("alice").join("room").unwrap();
        hub.client("bob").join("room").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        settle(&alice, "bob", ConnectionState::Connected).await;
        assert!(alice.is_routing());

        hub.disconnect(&"alice".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!alice.is_routing());
        assert_eq!(alice.peers(), vec![PeerId::from("bob")]);

        alice.start();
        assert!(alice.is_routing());
    }

    #[tokio::test(start_paused = true)]
    async fn adding_is_idempotent_and_ignores_ourselves() {
        let (hub, network) = (LocalSignalingHub::new(), SimulatedNetwork::new());
        let alice = pool(&hub, &network, "alice");
        assert!(!alice.add_peer("alice"));
        assert!(alice.add_peer("bob"));
        assert!(!alice.add_peer("bob"));
        assert_eq!(alice.len(), 1);

        assert!(alice.remove_peer(&"bob".into()));
        assert!(!alice.remove_peer(&"bob".into()));
        assert_eq!(network.open_transports(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_everything() {
        let (hub, network) = (LocalSignalingHub::new(), SimulatedNetwork::new());
        let alice = pool(&hub, &network, "alice");
        alice.add_peer("bob");
        alice.add_peer("carol");
        alice.shutdown();
        assert!(alice.is_empty());
        assert!(!alice.add_peer("dave"));
        assert_eq!(network.open_transports(), 0);
    }
}
