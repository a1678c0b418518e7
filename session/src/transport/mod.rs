//! The media transport seam. A [`PeerTransport`] owns the session description and ICE machinery for one peer;
//! the connection state machine drives it and reacts to its [`TransportEvent`]s.

mod sdp;
mod simulated;

use crate::{
    error::TransportError,
    id::PeerId,
    media::{
        LocalTrack,
        Track,
        TrackKind,
    },
};
pub use sdp::SessionDescription;
use serde::Serialize;
pub use simulated::SimulatedNetwork;
use strum::Display;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    Direct,
    Relayed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local ICE candidate to hand to the remote side.
    LocalCandidate(String),
    /// Connectivity checks succeeded on at least one media path.
    Connected { path: PathKind },
    /// Connectivity was lost; the transport may still recover on its own.
    Disconnected,
    /// The transport gave up.
    Failed,
    /// The media the remote side currently sends.
    RemoteTracks(Vec<Track>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    /// Gather fresh ICE credentials.
    pub ice_restart: bool,
    /// Only the video section changes; audio stays as negotiated.
    pub video_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Swapped in place; nothing to negotiate.
    Replaced,
    /// The new track does not fit the negotiated media section.
    NeedsRenegotiation,
}

pub trait PeerTransport: Send + 'static {
    fn create_offer(&mut self, options: OfferOptions) -> Result<String, TransportError>;

    /// Applies a remote offer and returns the answer.
    fn accept_offer(&mut self, sdp: &str) -> Result<String, TransportError>;

    fn accept_answer(&mut self, sdp: &str) -> Result<(), TransportError>;

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), TransportError>;

    /// Points the sender of `kind` at a different track. `None` stops sending that kind.
    fn replace_track(&mut self, kind: TrackKind, track: Option<&LocalTrack>) -> Result<ReplaceOutcome, TransportError>;

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<(), TransportError>;

    /// Releases every network resource. Idempotent.
    fn close(&mut self);
}

pub trait TransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        tracks: &[LocalTrack],
    ) -> (Box<dyn PeerTransport>, UnboundedReceiver<TransportEvent>);
}
