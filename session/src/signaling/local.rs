//! An in-process relay. Every client created from the same hub sees the same rooms.

use super::{
    Envelope,
    SignalMessage,
    SignalingClient,
    SignalingEvent,
    Subscribers,
};
use crate::{
    error::SignalingError,
    id::PeerId,
};
use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    pub from: PeerId,
    pub to: PeerId,
    pub message: SignalMessage,
}

#[derive(Debug, Default)]
struct Member {
    room: Option<String>,
    connected: bool,
    subscribers: Subscribers,
}

#[derive(Debug, Default)]
struct HubState {
    members: HashMap<PeerId, Member>,
    rooms: HashMap<String, BTreeSet<PeerId>>,
    log: Vec<RelayedMessage>,
}

impl HubState {
    fn member(&mut self, id: &PeerId) -> &mut Member {
        self.members.entry(id.clone()).or_insert_with(|| Member {
            connected: true,
            ..Default::default()
        })
    }

    fn publish(&mut self, to: &PeerId, event: SignalingEvent) {
        if let Some(member) = self.members.get_mut(to) {
            member.subscribers.publish(event);
        }
    }

    fn remove_from_room(&mut self, id: &PeerId) {
        let Some(room) = self.members.get_mut(id).and_then(|m| m.room.take()) else {
            return;
        };
        let others = match self.rooms.get_mut(&room) {
            Some(members) => {
                members.remove(id);
                members.iter().cloned().collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        for other in others {
            self.publish(&other, SignalingEvent::PeerLeft(id.clone()));
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalSignalingHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalSignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, id: impl Into<PeerId>) -> LocalSignaling {
        let id = id.into();
        self.state.lock().unwrap().member(&id).connected = true;
        LocalSignaling {
            id,
            hub: self.clone(),
        }
    }

    /// Every message relayed so far, in relay order.
    pub fn relayed(&self) -> Vec<RelayedMessage> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn count(&self, predicate: impl Fn(&RelayedMessage) -> bool) -> usize {
        self.state.lock().unwrap().log.iter().filter(|m| predicate(m)).count()
    }

    pub fn members(&self, room_code: &str) -> Vec<PeerId> {
        let state = self.state.lock().unwrap();
        state
            .rooms
            .get(room_code)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops the client's relay connection as if its socket closed; the rest of the room sees it leave.
    pub fn disconnect(&self, id: &PeerId) {
        let mut state = self.state.lock().unwrap();
        state.remove_from_room(id);
        state.member(id).connected = false;
        state.publish(id, SignalingEvent::Disconnected);
    }
}

/// One participant's handle on a [`LocalSignalingHub`].
#[derive(Debug, Clone)]
pub struct LocalSignaling {
    id: PeerId,
    hub: LocalSignalingHub,
}

impl LocalSignaling {
    fn connected(&self, state: &mut HubState) -> Result<(), SignalingError> {
        if state.member(&self.id).connected {
            Ok(())
        } else {
            Err(SignalingError::Disconnected)
        }
    }
}

impl SignalingClient for LocalSignaling {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn join(&self, room_code: &str) -> Result<(), SignalingError> {
        let mut state = self.hub.state.lock().unwrap();
        self.connected(&mut state)?;
        if state.member(&self.id).room.as_deref() == Some(room_code) {
            return Ok(());
        }
        state.remove_from_room(&self.id);

        let existing: Vec<PeerId> = state.rooms.entry(room_code.to_string()).or_default().iter().cloned().collect();
        state
            .rooms
            .entry(room_code.to_string())
            .or_default()
            .insert(self.id.clone());
        state.member(&self.id).room = Some(room_code.to_string());
        debug!(peer = %self.id, room = room_code, existing = existing.len(), "joined room");

        for other in existing {
            state.publish(&other, SignalingEvent::PeerJoined(self.id.clone()));
            state.publish(&self.id, SignalingEvent::PeerJoined(other));
        }
        Ok(())
    }

    fn leave(&self) -> Result<(), SignalingError> {
        let mut state = self.hub.state.lock().unwrap();
        self.connected(&mut state)?;
        state.remove_from_room(&self.id);
        Ok(())
    }

    fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), SignalingError> {
        let mut state = self.hub.state.lock().unwrap();
        self.connected(&mut state)?;
        let room = state.member(&self.id).room.clone().ok_or(SignalingError::NotJoined)?;
        let reachable = state.rooms.get(&room).is_some_and(|members| members.contains(to));
        if !reachable {
            return Err(SignalingError::UnknownPeer(to.clone()));
        }

        trace!(from = %self.id, %to, %message, "relaying");
        state.log.push(RelayedMessage {
            from: self.id.clone(),
            to: to.clone(),
            message: message.clone(),
        });
        state.publish(
            to,
            SignalingEvent::Message(Envelope {
                from: self.id.clone(),
                message,
            }),
        );
        Ok(())
    }

    fn subscribe(&self) -> UnboundedReceiver<SignalingEvent> {
        self.hub.state.lock().unwrap().member(&self.id).subscribers.add()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn offer(to: &str) -> SignalMessage {
        SignalMessage::Offer {
            to_peer_id: to.into(),
            sdp: "v=0".into(),
        }
    }

    #[tokio::test]
    async fn presence_is_announced_both_ways() {
        let hub = LocalSignalingHub::new();
        let alice = hub.client("alice");
        let bob = hub.client("bob");
        let mut alice_events = alice.subscribe();
        let mut bob_events = bob.subscribe();

        alice.join("room").unwrap();
        bob.join("room").unwrap();
        assert_eq!(alice_events.recv().await, Some(SignalingEvent::PeerJoined("bob".into())));
        assert_eq!(bob_events.recv().await, Some(SignalingEvent::PeerJoined("alice".into())));

        bob.leave().unwrap();
        assert_eq!(alice_events.recv().await, Some(SignalingEvent::PeerLeft("bob".into())));
        assert_eq!(hub.members("room"), vec![PeerId::from("alice")]);
    }

    #[tokio::test]
    async fn messages_are_relayed_in_order_and_logged() {
        let hub = LocalSignalingHub::new();
        let alice = hub.client("alice");
        let bob = hub.client("bob");
        let mut bob_events = bob.subscribe();
        alice.join("room").unwrap();
        bob.join("room").unwrap();
        let _ = bob_events.recv().await;

        for _ in 0..3 {
            alice.send(&"bob".into(), offer("bob")).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(
                bob_events.recv().await,
                Some(SignalingEvent::Message(Envelope {
                    from: "alice".into(),
                    message: offer("bob"),
                }))
            );
        }
        assert_eq!(hub.count(|m| matches!(m.message, SignalMessage::Offer { .. })), 3);
    }

    #[tokio::test]
    async fn relay_failures_are_typed() {
        let hub = LocalSignalingHub::new();
        let alice = hub.client("alice");
        assert_eq!(alice.send(&"bob".into(), offer("bob")), Err(SignalingError::NotJoined));
        alice.join("room").unwrap();
        assert_eq!(
            alice.send(&"bob".into(), offer("bob")),
            Err(SignalingError::UnknownPeer("bob".into()))
        );
        hub.disconnect(&"alice".into());
        assert_eq!(alice.join("room"), Err(SignalingError::Disconnected));
    }

    #[tokio::test]
    async fn a_dropped_client_is_told_and_the_room_sees_it_leave() {
        let hub = LocalSignalingHub::new();
        let alice = hub.client("alice");
        let bob = hub.client("bob");
        let mut alice_events = alice.subscribe();
        let mut bob_events = bob.subscribe();
        alice.join("room").unwrap();
        bob.join("room").unwrap();
        let _ = alice_events.recv().await;
        let _ = bob_events.recv().await;

        hub.disconnect(&"alice".into());
        assert_eq!(alice_events.recv().await, Some(SignalingEvent::Disconnected));
        assert_eq!(bob_events.recv().await, Some(SignalingEvent::PeerLeft("alice".into())));
        assert_eq!(hub.members("room"), vec![PeerId::from("bob")]);
    }
}
