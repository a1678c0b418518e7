//! Client of a JSON-over-websocket signaling relay.
//!
//! Outgoing frames are the [`SignalMessage`] JSON itself. The relay answers with [`RelayFrame`]s announcing
//! presence and forwarding messages addressed to us.

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
use eyre::{
    eyre,
    Result,
};
use futures::{
    SinkExt,
    StreamExt,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::sync::{
    Arc,
    Mutex,
};
use tokio::{
    sync::mpsc::{
        unbounded_channel,
        UnboundedReceiver,
        UnboundedSender,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
};
use tokio_util::sync::{
    CancellationToken,
    DropGuard,
};
use url::Url;

/// What the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    Message { from: PeerId, message: SignalMessage },
}

impl From<RelayFrame> for SignalingEvent {
    fn from(frame: RelayFrame) -> Self {
        match frame {
            RelayFrame::PeerJoined { peer_id } => SignalingEvent::PeerJoined(peer_id),
            RelayFrame::PeerLeft { peer_id } => SignalingEvent::PeerLeft(peer_id),
            RelayFrame::Message { from, message } => SignalingEvent::Message(Envelope { from, message }),
        }
    }
}

pub struct WebSocketSignaling {
    id: PeerId,
    outgoing: UnboundedSender<SignalMessage>,
    subscribers: Arc<Mutex<Subscribers>>,
    _connection_guard: DropGuard,
}

impl std::fmt::Debug for WebSocketSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignaling")
            .field("id", &self.id)
            .field("connected", &!self.outgoing.is_closed())
            .finish_non_exhaustive()
    }
}

impl WebSocketSignaling {
    pub async fn connect(url: &Url, id: PeerId) -> Result<Self> {
        info!("Connecting to signaling relay: {url}");
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| eyre!("Failed to connect to signaling relay {url}: {e}"))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = unbounded_channel::<SignalMessage>();
        let subscribers: Arc<Mutex<Subscribers>> = Default::default();
        let cancel = CancellationToken::new();

        let mut send_task: JoinHandle<()> = tokio::spawn(async move {
            debug!("Starting signaling send task");
            while let Some(message) = outgoing_rx.recv().await {
                trace!("Sending signaling message: {message}");
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            error!("Error sending signaling message: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error serializing signaling message: {e}");
                    }
                }
            }
            let _ = sink.close().await;
            debug!("Signaling send task completed");
        });

        let mut recv_task: JoinHandle<()> = tokio::spawn({
            let subscribers = subscribers.clone();
            async move {
                debug!("Starting signaling receive task");
                while let Some(result) = stream.next().await {
                    match result {
                        Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(frame) => {
                                trace!("Received relay frame: {frame:?}");
                                subscribers.lock().unwrap().publish(frame.into());
                            }
                            Err(e) => {
                                warn!("Ignoring malformed relay frame: {e}");
                            }
                        },
                        Ok(Message::Close(_)) => {
                            debug!("Relay closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Error receiving from relay: {e}");
                            break;
                        }
                    }
                }
                debug!("Signaling receive task completed");
            }
        });

        tokio::spawn({
            let cancel = cancel.clone();
            let subscribers = subscribers.clone();
            async move {
                let lost = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = &mut send_task => true,
                    _ = &mut recv_task => true,
                };
                send_task.abort();
                recv_task.abort();
                if lost {
                    subscribers.lock().unwrap().publish(SignalingEvent::Disconnected);
                }
                debug!("Signaling connection closed");
            }
        });

        Ok(Self {
            id,
            outgoing,
            subscribers,
            _connection_guard: cancel.drop_guard(),
        })
    }

    fn push(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.outgoing.send(message).map_err(|_| SignalingError::Disconnected)
    }
}

impl SignalingClient for WebSocketSignaling {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn join(&self, room_code: &str) -> Result<(), SignalingError> {
        self.push(SignalMessage::Join {
            room_code: room_code.to_string(),
            peer_id: self.id.clone(),
        })
    }

    fn leave(&self) -> Result<(), SignalingError> {
        self.push(SignalMessage::Leave {
            peer_id: self.id.clone(),
        })
    }

    fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), SignalingError> {
        if message.recipient() != Some(to) {
            return Err(SignalingError::Encode(format!("{message} is not addressed to {to}")));
        }
        self.push(message)
    }

    fn subscribe(&self) -> UnboundedReceiver<SignalingEvent> {
        self.subscribers.lock().unwrap().add()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    #[test]
    fn relay_frames_nest_the_message_schema() {
        let frame: RelayFrame = serde_json::from_str(
            r#"{"type":"message","from":"bob","message":{"type":"answer","toPeerId":"alice","sdp":"v=0"}}"#,
        )
        .unwrap();
        assert_eq!(
            SignalingEvent::from(frame),
            SignalingEvent::Message(Envelope {
                from: "bob".into(),
                message: SignalMessage::Answer {
                    to_peer_id: "alice".into(),
                    sdp: "v=0".into(),
                },
            })
        );
    }

    #[tokio::test]
    async fn talks_to_a_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();

        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let Some(Ok(Message::Text(join))) = ws.next().await else {
                panic!("expected a join");
            };
            let join: SignalMessage = serde_json::from_str(&join).unwrap();
            let frame = RelayFrame::PeerJoined { peer_id: "bob".into() };
            ws.send(Message::Text(serde_json::to_string(&frame).unwrap().into()))
                .await
                .unwrap();
            join
        });

        let client = WebSocketSignaling::connect(&url, "alice".into()).await.unwrap();
        let mut events = client.subscribe();
        client.join("ABCD").unwrap();

        assert_eq!(events.recv().await, Some(SignalingEvent::PeerJoined("bob".into())));
        assert_eq!(
            relay.await.unwrap(),
            SignalMessage::Join {
                room_code: "ABCD".into(),
                peer_id: "alice".into()
            }
        );

        let misaddressed = SignalMessage::Offer {
            to_peer_id: "carol".into(),
            sdp: String::new(),
        };
        assert!(matches!(
            client.send(&"bob".into(), misaddressed),
            Err(SignalingError::Encode(_))
        ));
    }

    #[tokio::test]
    async fn a_closed_relay_is_reported_to_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();

        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _join = ws.next().await;
            let _ = ws.close(None).await;
        });

        let client = WebSocketSignaling::connect(&url, "alice".into()).await.unwrap();
        let mut events = client.subscribe();
        client.join("ABCD").unwrap();
        relay.await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SignalingEvent::Disconnected));
    }
}
