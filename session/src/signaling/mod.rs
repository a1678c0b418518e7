//! The signaling boundary: room presence and relay of negotiation messages. Nothing here looks inside an offer
//! or answer; the peer pool alone interprets them.

mod local;
mod websocket;

use crate::{
    error::SignalingError,
    id::PeerId,
};
pub use local::{
    LocalSignaling,
    LocalSignalingHub,
    RelayedMessage,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
};
pub use websocket::WebSocketSignaling;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    #[display("join({room_code})")]
    Join { room_code: String, peer_id: PeerId },
    #[display("leave")]
    Leave { peer_id: PeerId },
    #[display("offer")]
    Offer { to_peer_id: PeerId, sdp: String },
    #[display("answer")]
    Answer { to_peer_id: PeerId, sdp: String },
    #[display("iceCandidate")]
    IceCandidate { to_peer_id: PeerId, candidate: String },
    #[display("renegotiate")]
    Renegotiate { to_peer_id: PeerId, sdp: String },
}

impl SignalMessage {
    /// The peer a relayed message is addressed to; presence messages go to the whole room.
    pub fn recipient(&self) -> Option<&PeerId> {
        match self {
            SignalMessage::Join { .. } | SignalMessage::Leave { .. } => None,
            SignalMessage::Offer { to_peer_id, .. }
            | SignalMessage::Answer { to_peer_id, .. }
            | SignalMessage::IceCandidate { to_peer_id, .. }
            | SignalMessage::Renegotiate { to_peer_id, .. } => Some(to_peer_id),
        }
    }
}

/// A message as delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: PeerId,
    pub message: SignalMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Message(Envelope),
    /// The relay connection is gone. Nothing more arrives on this subscription.
    Disconnected,
}

/// Client side of a signaling relay. Handlers are expressed as subscriptions: every subscriber receives every
/// event after it subscribed, in the order the relay delivered them.
pub trait SignalingClient: Send + Sync + 'static {
    fn local_id(&self) -> &PeerId;

    fn join(&self, room_code: &str) -> Result<(), SignalingError>;

    fn leave(&self) -> Result<(), SignalingError>;

    fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), SignalingError>;

    fn subscribe(&self) -> UnboundedReceiver<SignalingEvent>;
}

/// Fan-out of incoming events to every live subscriber.
#[derive(Debug, Default)]
struct Subscribers(Vec<UnboundedSender<SignalingEvent>>);

impl Subscribers {
    fn add(&mut self) -> UnboundedReceiver<SignalingEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.0.push(tx);
        rx
    }

    fn publish(&mut self, event: SignalingEvent) {
        self.0.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn messages_use_the_camel_case_wire_schema() {
        let message = SignalMessage::IceCandidate {
            to_peer_id: "bob".into(),
            candidate: "candidate:1 host".into(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "iceCandidate", "toPeerId": "bob", "candidate": "candidate:1 host"})
        );

        let join: SignalMessage =
            serde_json::from_str(r#"{"type":"join","roomCode":"ABCD","peerId":"alice"}"#).unwrap();
        assert_eq!(
            join,
            SignalMessage::Join {
                room_code: "ABCD".into(),
                peer_id: "alice".into()
            }
        );
        assert_eq!(join.recipient(), None);
    }
}
