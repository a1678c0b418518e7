//! A deterministic in-memory network. Every pair of peers shares a link that can be taken down, brought back or
//! routed through a relay; connectivity is established once both sides hold matching ICE credentials and a
//! candidate from the other side.

use super::{
    sdp::SessionDescription,
    OfferOptions,
    PathKind,
    PeerTransport,
    ReplaceOutcome,
    TransportEvent,
    TransportFactory,
};
use crate::{
    error::TransportError,
    id::PeerId,
    media::{
        LocalTrack,
        Track,
        TrackKind,
    },
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::sync::mpsc::{
    unbounded_channel,
    UnboundedReceiver,
    UnboundedSender,
};

#[derive(Debug, Clone, Copy)]
struct Link {
    up: bool,
    relayed: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            up: true,
            relayed: false,
        }
    }
}

#[derive(Debug)]
struct Endpoint {
    generation: u64,
    local_ufrag: Option<String>,
    remote_ufrag: Option<String>,
    /// Credentials of the last remote candidate received.
    candidate_ufrag: Option<String>,
    remote_tracks: BTreeMap<TrackKind, Track>,
    connected: bool,
    events: UnboundedSender<TransportEvent>,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn announce_remote_tracks(&self) {
        self.emit(TransportEvent::RemoteTracks(self.remote_tracks.values().cloned().collect()));
    }
}

#[derive(Debug, Default)]
struct NetState {
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
    links: HashMap<(PeerId, PeerId), Link>,
    generations: u64,
    ufrags: u64,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl NetState {
    fn link(&self, a: &PeerId, b: &PeerId) -> Link {
        self.links.get(&link_key(a, b)).copied().unwrap_or_default()
    }

    fn endpoint(&mut self, local: &PeerId, remote: &PeerId, generation: u64) -> Result<&mut Endpoint, TransportError> {
        self.endpoints
            .get_mut(&(local.clone(), remote.clone()))
            .filter(|e| e.generation == generation)
            .ok_or(TransportError::Closed)
    }

    fn next_ufrag(&mut self, peer: &PeerId) -> String {
        self.ufrags += 1;
        format!("{peer}-{}", self.ufrags)
    }

    fn disconnect(&mut self, a: &PeerId, b: &PeerId, event: TransportEvent) {
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(endpoint) = self.endpoints.get_mut(&key) {
                if endpoint.connected || event == TransportEvent::Failed {
                    endpoint.connected = false;
                    endpoint.emit(event.clone());
                }
            }
        }
    }

    /// Completes connectivity checks for the pair if both sides are ready and the link is up.
    fn evaluate(&mut self, a: &PeerId, b: &PeerId) {
        let link = self.link(a, b);
        let (ab, ba) = ((a.clone(), b.clone()), (b.clone(), a.clone()));
        let (Some(x), Some(y)) = (self.endpoints.get(&ab), self.endpoints.get(&ba)) else {
            return;
        };
        let ready = |e: &Endpoint, other: &Endpoint| {
            e.local_ufrag.is_some()
                && e.remote_ufrag == other.local_ufrag
                && e.candidate_ufrag.is_some()
                && e.candidate_ufrag == e.remote_ufrag
        };
        if !link.up || !ready(x, y) || !ready(y, x) {
            return;
        }
        let path = if link.relayed { PathKind::Relayed } else { PathKind::Direct };
        for key in [ab, ba] {
            if let Some(endpoint) = self.endpoints.get_mut(&key) {
                if !endpoint.connected {
                    endpoint.connected = true;
                    endpoint.emit(TransportEvent::Connected { path });
                }
            }
        }
    }
}

/// Shared in-memory network; clones refer to the same network.
#[derive(Debug, Clone, Default)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetState>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the link between two peers down or brings it back up. Bringing it back reconnects a pair whose ICE
    /// credentials still match without any renegotiation.
    pub fn set_link(&self, a: &PeerId, b: &PeerId, up: bool) {
        let mut state = self.state.lock().unwrap();
        state.links.entry(link_key(a, b)).or_default().up = up;
        debug!(%a, %b, up, "link changed");
        if up {
            state.evaluate(a, b);
        } else {
            state.disconnect(a, b, TransportEvent::Disconnected);
        }
    }

    /// Routes the pair through a relay from the next successful connectivity check on.
    pub fn set_relayed(&self, a: &PeerId, b: &PeerId, relayed: bool) {
        self.state.lock().unwrap().links.entry(link_key(a, b)).or_default().relayed = relayed;
    }

    /// Takes the link down and reports a hard transport failure to both sides.
    pub fn fail_link(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock().unwrap();
        state.links.entry(link_key(a, b)).or_default().up = false;
        state.disconnect(a, b, TransportEvent::Failed);
    }

    /// Number of live transports, for leak checks.
    pub fn open_transports(&self) -> usize {
        self.state.lock().unwrap().endpoints.len()
    }

    pub fn is_connected(&self, local: &PeerId, remote: &PeerId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|e| e.connected)
    }
}

impl TransportFactory for SimulatedNetwork {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        tracks: &[LocalTrack],
    ) -> (Box<dyn PeerTransport>, UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.generations += 1;
        let generation = state.generations;
        state.endpoints.insert(
            (local.clone(), remote.clone()),
            Endpoint {
                generation,
                local_ufrag: None,
                remote_ufrag: None,
                candidate_ufrag: None,
                remote_tracks: Default::default(),
                connected: false,
                events: tx,
            },
        );
        let transport = SimulatedTransport {
            network: self.clone(),
            local: local.clone(),
            remote: remote.clone(),
            generation,
            version: 0,
            sending: tracks.iter().map(|t| (t.kind(), t.track.clone())).collect(),
            negotiated: Default::default(),
            closed: false,
        };
        (Box::new(transport), rx)
    }
}

#[derive(Debug)]
struct SimulatedTransport {
    network: SimulatedNetwork,
    local: PeerId,
    remote: PeerId,
    generation: u64,
    version: u64,
    sending: BTreeMap<TrackKind, Track>,
    /// Media sections as last described to the remote side.
    negotiated: BTreeMap<TrackKind, Track>,
    closed: bool,
}

impl SimulatedTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Writes a local description and gathers a candidate for it.
    fn describe(&mut self, state: &mut NetState, ice_restart: bool, video_only: bool) -> Result<String, TransportError> {
        let fresh_ufrag = ice_restart || state.endpoint(&self.local, &self.remote, self.generation)?.local_ufrag.is_none();
        if fresh_ufrag {
            let ufrag = state.next_ufrag(&self.local);
            state.endpoint(&self.local, &self.remote, self.generation)?.local_ufrag = Some(ufrag);
        }
        let link = state.link(&self.local, &self.remote);
        let endpoint = state.endpoint(&self.local, &self.remote, self.generation)?;
        let ufrag = endpoint.local_ufrag.clone().unwrap_or_default();

        self.version += 1;
        let tracks: Vec<Track> = self
            .sending
            .values()
            .filter(|t| !video_only || t.kind() == TrackKind::Video)
            .cloned()
            .collect();
        if video_only {
            self.negotiated.remove(&TrackKind::Video);
        } else {
            self.negotiated.clear();
        }
        for track in &tracks {
            self.negotiated.insert(track.kind(), track.clone());
        }

        let candidate_type = if link.relayed { "relay" } else { "host" };
        endpoint.emit(TransportEvent::LocalCandidate(format!(
            "candidate:{ufrag} {candidate_type} {}",
            self.local
        )));

        Ok(SessionDescription {
            origin: self.local.clone(),
            version: self.version,
            ice_ufrag: ufrag,
            ice_restart,
            video_only,
            tracks,
        }
        .to_string())
    }

    fn apply_remote(&self, endpoint: &mut Endpoint, description: SessionDescription) {
        endpoint.remote_ufrag = Some(description.ice_ufrag);
        if description.video_only {
            endpoint.remote_tracks.remove(&TrackKind::Video);
        } else {
            endpoint.remote_tracks.clear();
        }
        for track in description.tracks {
            endpoint.remote_tracks.insert(track.kind(), track);
        }
        endpoint.announce_remote_tracks();
    }

    /// Tells the remote side what it now receives on the negotiated sections.
    fn announce_media(&self, state: &mut NetState) {
        let Some(remote) = state.endpoints.get_mut(&(self.remote.clone(), self.local.clone())) else {
            return;
        };
        for (kind, negotiated) in &self.negotiated {
            if let Some(track) = remote.remote_tracks.get_mut(kind) {
                track.enabled = self.sending.get(kind).is_some_and(|t| t.enabled) && negotiated.enabled;
            }
        }
        remote.announce_remote_tracks();
    }
}

impl PeerTransport for SimulatedTransport {
    fn create_offer(&mut self, options: OfferOptions) -> Result<String, TransportError> {
        self.ensure_open()?;
        let network = self.network.clone();
        let mut state = network.state.lock().unwrap();
        self.describe(&mut state, options.ice_restart, options.video_only)
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<String, TransportError> {
        self.ensure_open()?;
        let offer = SessionDescription::parse(sdp)?;
        let (ice_restart, video_only) = (offer.ice_restart, offer.video_only);
        let network = self.network.clone();
        let mut state = network.state.lock().unwrap();
        let endpoint = state.endpoint(&self.local, &self.remote, self.generation)?;
        self.apply_remote(endpoint, offer);
        let answer = self.describe(&mut state, ice_restart, video_only)?;
        state.evaluate(&self.local, &self.remote);
        Ok(answer)
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let answer = SessionDescription::parse(sdp)?;
        let network = self.network.clone();
        let mut state = network.state.lock().unwrap();
        let endpoint = state.endpoint(&self.local, &self.remote, self.generation)?;
        if endpoint.local_ufrag.is_none() {
            return Err(TransportError::MissingLocalDescription);
        }
        self.apply_remote(endpoint, answer);
        state.evaluate(&self.local, &self.remote);
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let ufrag = candidate
            .strip_prefix("candidate:")
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| TransportError::InvalidDescription(candidate.to_string()))?;
        let network = self.network.clone();
        let mut state = network.state.lock().unwrap();
        state.endpoint(&self.local, &self.remote, self.generation)?.candidate_ufrag = Some(ufrag.to_string());
        state.evaluate(&self.local, &self.remote);
        Ok(())
    }

    fn replace_track(&mut self, kind: TrackKind, track: Option<&LocalTrack>) -> Result<ReplaceOutcome, TransportError> {
        self.ensure_open()?;
        let outcome = match (self.negotiated.get(&kind), track) {
            (_, None) => {
                self.sending.remove(&kind);
                ReplaceOutcome::Replaced
            }
            (Some(negotiated), Some(next)) if negotiated.params == next.track.params => {
                self.sending.insert(kind, next.track.clone());
                ReplaceOutcome::Replaced
            }
            (_, Some(next)) => {
                self.sending.insert(kind, next.track.clone());
                return Ok(ReplaceOutcome::NeedsRenegotiation);
            }
        };
        let network = self.network.clone();
        let mut state = network.state.lock().unwrap();
        self.announce_media(&mut state);
        Ok(outcome)
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(track) = self.sending.get_mut(&kind) {
            track.enabled = enabled;
        }
        let network = self.network.clone();
        let mut state = network.state.lock().unwrap();
        self.announce_media(&mut state);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.network.state.lock().unwrap();
        let key = (self.local.clone(), self.remote.clone());
        if state.endpoints.get(&key).is_some_and(|e| e.generation == self.generation) {
            state.endpoints.remove(&key);
            if let Some(remote) = state.endpoints.get_mut(&(self.remote.clone(), self.local.clone())) {
                if remote.connected {
                    remote.connected = false;
                    remote.emit(TransportEvent::Disconnected);
                }
            }
        }
        trace!(local = %self.local, remote = %self.remote, "transport closed");
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.close();
    }
}
