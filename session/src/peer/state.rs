use crate::{
    error::ConnectionError,
    id::PeerId,
    media::{
        Track,
        TrackKind,
    },
    transport::PathKind,
};
use serde::Serialize;
use strum::{
    Display,
    EnumString,
};

#[derive(Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Hash, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    /// No further transitions happen out of these, short of removing the peer and adding it again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

impl NegotiationRole {
    /// The lower peer id offers. Both sides compute the same answer from the same pair, so only one ever offers.
    pub fn for_pair(local: &PeerId, remote: &PeerId) -> Self {
        if local < remote {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Hash, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum QualityTag {
    Direct,
    Relayed,
    AudioOnly,
    NoCamera,
    #[default]
    Unavailable,
}

impl QualityTag {
    pub fn classify(state: ConnectionState, path: Option<PathKind>, remote: &RemoteStream) -> Self {
        let Some(path) = path.filter(|_| state == ConnectionState::Connected) else {
            return QualityTag::Unavailable;
        };
        match remote.track(TrackKind::Video) {
            None => QualityTag::NoCamera,
            Some(video) if !video.enabled => QualityTag::AudioOnly,
            Some(_) => match path {
                PathKind::Direct => QualityTag::Direct,
                PathKind::Relayed => QualityTag::Relayed,
            },
        }
    }
}

/// What a remote participant currently sends us. Readers get a view through a watch channel; the connection
/// alone writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub tracks: Vec<Track>,
}

impl RemoteStream {
    pub fn track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some_and(|t| t.enabled)
    }

    pub fn has_audio(&self) -> bool {
        self.track(TrackKind::Audio).is_some_and(|t| t.enabled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub peer_id: PeerId,
    pub state: ConnectionState,
    pub role: NegotiationRole,
    /// Version of the outgoing media state this connection currently sends.
    pub local_track_version: u64,
    pub quality: QualityTag,
    pub path: Option<PathKind>,
    /// Completed offer/answer exchanges.
    pub negotiations: u32,
    pub track_replacements: u32,
    pub restart_attempts: u32,
    pub created: chrono::DateTime<chrono::Utc>,
    pub last_error: Option<ConnectionError>,
}

impl ConnectionSnapshot {
    pub fn new(peer_id: PeerId, role: NegotiationRole, local_track_version: u64) -> Self {
        Self {
            peer_id,
            state: ConnectionState::Idle,
            role,
            local_track_version,
            quality: QualityTag::Unavailable,
            path: None,
            negotiations: 0,
            track_replacements: 0,
            restart_attempts: 0,
            created: chrono::Utc::now(),
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    StateChanged {
        peer_id: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
    QualityChanged {
        peer_id: PeerId,
        quality: QualityTag,
    },
    TrackReplaced {
        peer_id: PeerId,
        kind: TrackKind,
        renegotiated: bool,
    },
    /// The connection gave up for good. Other connections are unaffected.
    PeerLost {
        peer_id: PeerId,
        reason: ConnectionError,
    },
}

impl PoolEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            PoolEvent::StateChanged { peer_id, .. }
            | PoolEvent::QualityChanged { peer_id, .. }
            | PoolEvent::TrackReplaced { peer_id, .. }
            | PoolEvent::PeerLost { peer_id, .. } => peer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackParams;
    use pretty_assertions::assert_eq;

    #[test]
    fn exactly_one_side_initiates() {
        let pairs = [("alice", "bob"), ("B", "a"), ("peer-10", "peer-9"), ("x", "xy")];
        for (a, b) in pairs {
            let (a, b) = (PeerId::from(a), PeerId::from(b));
            let roles = (NegotiationRole::for_pair(&a, &b), NegotiationRole::for_pair(&b, &a));
            assert!(
                matches!(
                    roles,
                    (NegotiationRole::Initiator, NegotiationRole::Responder)
                        | (NegotiationRole::Responder, NegotiationRole::Initiator)
                ),
                "{a} vs {b}: {roles:?}"
            );
            assert_eq!(roles.0 == NegotiationRole::Initiator, a < b);
        }
    }

    #[test]
    fn quality_follows_path_and_remote_media() {
        let camera = Track::new("camera", TrackParams::video(640, 360, 30));
        let mic = Track::new("mic", TrackParams::audio(48_000));
        let mut stream = RemoteStream {
            tracks: vec![camera, mic.clone()],
        };
        let connected = ConnectionState::Connected;

        assert_eq!(
            QualityTag::classify(connected, Some(PathKind::Direct), &stream),
            QualityTag::Direct
        );
        assert_eq!(
            QualityTag::classify(connected, Some(PathKind::Relayed), &stream),
            QualityTag::Relayed
        );
        assert_eq!(
            QualityTag::classify(ConnectionState::Reconnecting, Some(PathKind::Direct), &stream),
            QualityTag::Unavailable
        );

        stream.tracks[0].enabled = false;
        assert_eq!(
            QualityTag::classify(connected, Some(PathKind::Direct), &stream),
            QualityTag::AudioOnly
        );

        stream.tracks = vec![mic];
        assert_eq!(
            QualityTag::classify(connected, Some(PathKind::Direct), &stream),
            QualityTag::NoCamera
        );
        assert_eq!(QualityTag::NoCamera.to_string(), "no-camera");
    }
}
