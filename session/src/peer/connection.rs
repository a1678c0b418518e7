//! One task per remote peer. Everything that touches a connection's negotiation state happens on that task, so
//! messages from the same peer are handled strictly in order.

use super::state::{
    ConnectionSnapshot,
    ConnectionState,
    NegotiationRole,
    PoolEvent,
    QualityTag,
    RemoteStream,
};
use crate::{
    error::{
        ConnectionError,
        TransportError,
    },
    id::PeerId,
    media::TrackKind,
    pipeline::OutgoingMediaState,
    signaling::{
        SignalMessage,
        SignalingClient,
    },
    transport::{
        OfferOptions,
        PathKind,
        PeerTransport,
        ReplaceOutcome,
        TransportEvent,
        TransportFactory,
    },
};
use meshcall_config::ConnectionConfig;
use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            unbounded_channel,
            UnboundedReceiver,
            UnboundedSender,
        },
        watch,
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Negotiation,
    Grace,
    Restart { attempt: u32 },
}

struct Shared {
    transport: Mutex<Box<dyn PeerTransport>>,
    snapshot: watch::Sender<ConnectionSnapshot>,
    remote: watch::Sender<RemoteStream>,
}

impl Shared {
    /// Applies `update` unless the connection was closed underneath the task.
    fn publish(&self, update: impl FnOnce(&mut ConnectionSnapshot)) {
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == ConnectionState::Closed {
                return false;
            }
            let before = snapshot.clone();
            update(snapshot);
            *snapshot != before
        });
    }
}

/// Everything a connection needs from the pool that spawns it.
pub(super) struct ConnectionParams {
    pub local: PeerId,
    pub peer: PeerId,
    pub config: ConnectionConfig,
    pub signaling: Arc<dyn SignalingClient>,
    pub transports: Arc<dyn TransportFactory>,
    pub outgoing: watch::Receiver<Arc<OutgoingMediaState>>,
    pub events: broadcast::Sender<PoolEvent>,
    pub cancel: CancellationToken,
}

/// The pool's side of a running connection.
pub(super) struct ConnectionHandle {
    inbox: UnboundedSender<SignalMessage>,
    shared: Arc<Shared>,
    events: broadcast::Sender<PoolEvent>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn spawn(params: ConnectionParams) -> Self {
        let ConnectionParams {
            local,
            peer,
            config,
            signaling,
            transports,
            mut outgoing,
            events,
            cancel,
        } = params;

        let current = outgoing.borrow_and_update().clone();
        let role = NegotiationRole::for_pair(&local, &peer);
        let (transport, transport_events) = transports.create(&local, &peer, &current.tracks());
        let shared = Arc::new(Shared {
            transport: Mutex::new(transport),
            snapshot: watch::channel(ConnectionSnapshot::new(peer.clone(), role, current.version)).0,
            remote: watch::channel(RemoteStream::default()).0,
        });
        let (inbox, inbox_rx) = unbounded_channel();

        let connection = Connection {
            peer,
            role,
            config,
            signaling,
            shared: shared.clone(),
            events: events.clone(),
            state: ConnectionState::Idle,
            timer: None,
            sent: current,
            deferred: None,
            remote_description: false,
            pending_candidates: Vec::new(),
            in_flight: None,
            renegotiation: None,
            path: None,
            quality: QualityTag::Unavailable,
        };
        tokio::spawn(connection.run(cancel.clone(), inbox_rx, transport_events, outgoing));

        Self {
            inbox,
            shared,
            events,
            cancel,
        }
    }

    pub fn deliver(&self, message: SignalMessage) {
        let _ = self.inbox.send(message);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn remote_stream(&self) -> watch::Receiver<RemoteStream> {
        self.shared.remote.subscribe()
    }

    /// Stops the task and releases the transport before returning.
    pub fn close(&self) {
        self.cancel.cancel();
        self.shared.transport.lock().unwrap().close();
        let mut previous = None;
        self.shared.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == ConnectionState::Closed {
                return false;
            }
            previous = Some(snapshot.state);
            snapshot.state = ConnectionState::Closed;
            snapshot.quality = QualityTag::Unavailable;
            true
        });
        if let Some(from) = previous {
            let peer_id = self.shared.snapshot.borrow().peer_id.clone();
            debug!(peer = %peer_id, %from, "connection closed");
            let _ = self.events.send(PoolEvent::StateChanged {
                peer_id,
                from,
                to: ConnectionState::Closed,
            });
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn expiry(timer: Option<(Timer, Instant)>) -> Timer {
    match timer {
        Some((timer, deadline)) => {
            tokio::time::sleep_until(deadline).await;
            timer
        }
        None => std::future::pending().await,
    }
}

struct Connection {
    peer: PeerId,
    role: NegotiationRole,
    config: ConnectionConfig,
    signaling: Arc<dyn SignalingClient>,
    shared: Arc<Shared>,
    events: broadcast::Sender<PoolEvent>,
    state: ConnectionState,
    /// The only armed timer. Every transition clears it.
    timer: Option<(Timer, Instant)>,
    /// Outgoing media the transport currently sends.
    sent: Arc<OutgoingMediaState>,
    /// Outgoing media published while the connection could not take it.
    deferred: Option<Arc<OutgoingMediaState>>,
    remote_description: bool,
    pending_candidates: Vec<String>,
    /// Our offer waiting for an answer.
    in_flight: Option<OfferOptions>,
    /// A renegotiation to offer once the one in flight completes.
    renegotiation: Option<OfferOptions>,
    path: Option<PathKind>,
    quality: QualityTag,
}

impl Connection {
    #[instrument(level = "debug", skip_all, fields(peer = %self.peer, role = %self.role))]
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut inbox: UnboundedReceiver<SignalMessage>,
        mut transport_events: UnboundedReceiver<TransportEvent>,
        mut outgoing: watch::Receiver<Arc<OutgoingMediaState>>,
    ) {
        self.start();

        while !self.state.is_terminal() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,

                Some(message) = inbox.recv() => self.on_message(message),

                Some(event) = transport_events.recv() => self.on_transport_event(event),

                Ok(()) = outgoing.changed() => {
                    let next = outgoing.borrow_and_update().clone();
                    self.on_outgoing(next);
                }

                timer = expiry(self.timer) => {
                    self.timer = None;
                    self.on_timer(timer);
                }
            }
        }

        debug!(state = %self.state, "connection task stopped");
    }

    fn start(&mut self) {
        self.transition(ConnectionState::Negotiating);
        self.arm(Timer::Negotiation, self.config.negotiation_timeout());
        if self.role == NegotiationRole::Initiator {
            self.send_offer(OfferOptions::default());
        }
    }

    fn transport<T>(
        &self,
        f: impl FnOnce(&mut dyn PeerTransport) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut transport = self.shared.transport.lock().unwrap();
        f(transport.as_mut())
    }

    fn signal(&self, message: SignalMessage) {
        if let Err(e) = self.signaling.send(&self.peer, message) {
            warn!("failed to signal {}: {e}", self.peer);
        }
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        self.timer = Some((timer, Instant::now() + after));
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.timer = None;
        debug!(%from, %to, "state changed");
        self.shared.publish(|snapshot| snapshot.state = to);
        let _ = self.events.send(PoolEvent::StateChanged {
            peer_id: self.peer.clone(),
            from,
            to,
        });
        self.refresh_quality();
    }

    fn refresh_quality(&mut self) {
        let quality = QualityTag::classify(self.state, self.path, &self.shared.remote.borrow());
        let path = self.path;
        self.shared.publish(|snapshot| {
            snapshot.quality = quality;
            snapshot.path = path;
        });
        if quality != self.quality {
            self.quality = quality;
            let _ = self.events.send(PoolEvent::QualityChanged {
                peer_id: self.peer.clone(),
                quality,
            });
        }
    }

    fn fail(&mut self, reason: ConnectionError) {
        warn!("giving up on {}: {reason}", self.peer);
        self.transition(ConnectionState::Failed);
        self.shared.transport.lock().unwrap().close();
        let error = reason.clone();
        self.shared.publish(|snapshot| snapshot.last_error = Some(error));
        let _ = self.events.send(PoolEvent::PeerLost {
            peer_id: self.peer.clone(),
            reason,
        });
    }

    fn negotiation_failed(&mut self, error: TransportError) {
        self.fail(ConnectionError::NegotiationFailed {
            peer: self.peer.clone(),
            reason: error.to_string(),
        });
    }

    fn completed_negotiation(&mut self) {
        self.remote_description = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport(|t| t.add_remote_candidate(&candidate)) {
                debug!("dropping buffered candidate: {e}");
            }
        }
        self.shared.publish(|snapshot| snapshot.negotiations += 1);
    }

    /// The first offer and ICE restarts travel as `offer`; later media changes as `renegotiate`.
    fn send_offer(&mut self, options: OfferOptions) {
        let sdp = match self.transport(|t| t.create_offer(options)) {
            Ok(sdp) => sdp,
            Err(e) => return self.negotiation_failed(e),
        };
        self.in_flight = Some(options);
        let to_peer_id = self.peer.clone();
        if self.remote_description && !options.ice_restart {
            self.signal(SignalMessage::Renegotiate { to_peer_id, sdp });
        } else {
            self.signal(SignalMessage::Offer { to_peer_id, sdp });
        }
    }

    fn renegotiate(&mut self, options: OfferOptions) {
        if self.in_flight.is_some() {
            let video_only = options.video_only && self.renegotiation.map_or(true, |queued| queued.video_only);
            self.renegotiation = Some(OfferOptions {
                video_only,
                ..Default::default()
            });
            return;
        }
        self.send_offer(options);
    }

    /// Glare: the initiating side keeps its offer and the other side answers instead.
    fn yield_in_flight(&mut self) {
        if let Some(dropped) = self.in_flight.take() {
            debug!("offer glare, answering {} instead", self.peer);
            if !dropped.video_only && !dropped.ice_restart && self.renegotiation.is_none() {
                self.renegotiation = Some(dropped);
            }
        }
    }

    fn answer(&mut self, sdp: &str) {
        match self.transport(|t| t.accept_offer(sdp)) {
            Ok(answer) => {
                self.signal(SignalMessage::Answer {
                    to_peer_id: self.peer.clone(),
                    sdp: answer,
                });
                self.completed_negotiation();
            }
            Err(e) => return self.negotiation_failed(e),
        }
        // our answer already describes the current video; anything broader is offered separately
        match self.renegotiation.take() {
            Some(options) if !options.video_only => self.send_offer(options),
            _ => {}
        }
    }

    fn on_message(&mut self, message: SignalMessage) {
        trace!(%message, "signal received");
        match message {
            SignalMessage::Offer { sdp, .. } | SignalMessage::Renegotiate { sdp, .. } => {
                if self.in_flight.is_some() {
                    if self.role == NegotiationRole::Initiator {
                        debug!("offer glare, keeping ours");
                        return;
                    }
                    self.yield_in_flight();
                }
                self.answer(&sdp);
            }
            SignalMessage::Answer { sdp, .. } => {
                if self.in_flight.take().is_none() {
                    debug!("ignoring unsolicited answer");
                    return;
                }
                if let Err(e) = self.transport(|t| t.accept_answer(&sdp)) {
                    return self.negotiation_failed(e);
                }
                self.completed_negotiation();
                if let Some(options) = self.renegotiation.take() {
                    self.send_offer(options);
                }
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                if !self.remote_description {
                    self.pending_candidates.push(candidate);
                } else if let Err(e) = self.transport(|t| t.add_remote_candidate(&candidate)) {
                    debug!("ignoring remote candidate: {e}");
                }
            }
            SignalMessage::Join { .. } | SignalMessage::Leave { .. } => {}
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => self.signal(SignalMessage::IceCandidate {
                to_peer_id: self.peer.clone(),
                candidate,
            }),
            TransportEvent::Connected { path } => {
                self.path = Some(path);
                match self.state {
                    ConnectionState::Negotiating | ConnectionState::Reconnecting => {
                        self.shared.publish(|snapshot| {
                            snapshot.restart_attempts = 0;
                            snapshot.last_error = None;
                        });
                        self.transition(ConnectionState::Connected);
                        if let Some(latest) = self.deferred.take() {
                            self.replace_tracks(latest);
                        }
                    }
                    _ => self.refresh_quality(),
                }
            }
            TransportEvent::Disconnected => {
                if self.state == ConnectionState::Connected {
                    self.transition(ConnectionState::Reconnecting);
                    self.arm(Timer::Grace, self.config.grace_period());
                }
            }
            TransportEvent::Failed => match self.state {
                ConnectionState::Negotiating => self.negotiation_failed(TransportError::Closed),
                ConnectionState::Connected => {
                    self.transition(ConnectionState::Reconnecting);
                    self.restart(1);
                }
                ConnectionState::Reconnecting if matches!(self.timer, Some((Timer::Grace, _))) => self.restart(1),
                _ => {}
            },
            TransportEvent::RemoteTracks(tracks) => {
                self.shared.remote.send_replace(RemoteStream { tracks });
                self.refresh_quality();
            }
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        match (timer, self.state) {
            (Timer::Negotiation, ConnectionState::Negotiating) => self.fail(ConnectionError::NegotiationFailed {
                peer: self.peer.clone(),
                reason: "no connectivity before the negotiation timeout".into(),
            }),
            (Timer::Grace, ConnectionState::Reconnecting) => {
                debug!("{} did not come back within the grace period", self.peer);
                self.restart(1);
            }
            (Timer::Restart { attempt }, ConnectionState::Reconnecting) => self.restart(attempt + 1),
            (timer, state) => trace!(?timer, %state, "stale timer"),
        }
    }

    /// One ICE restart attempt. Only the initiating side offers; both sides run the same schedule and give up
    /// after the same number of attempts.
    fn restart(&mut self, attempt: u32) {
        if attempt > self.config.max_restart_attempts {
            return self.fail(ConnectionError::ReconnectExhausted {
                peer: self.peer.clone(),
                attempts: self.config.max_restart_attempts,
            });
        }
        info!(attempt, "restarting ICE with {}", self.peer);
        let lost = ConnectionError::ConnectivityLost(self.peer.clone());
        self.shared.publish(|snapshot| {
            snapshot.restart_attempts = attempt;
            snapshot.last_error.get_or_insert(lost);
        });
        if self.role == NegotiationRole::Initiator {
            self.send_offer(OfferOptions {
                ice_restart: true,
                ..Default::default()
            });
        }
        if !self.state.is_terminal() {
            self.arm(Timer::Restart { attempt }, self.config.backoff(attempt));
        }
    }

    fn on_outgoing(&mut self, next: Arc<OutgoingMediaState>) {
        match self.state {
            ConnectionState::Negotiating | ConnectionState::Connected => self.replace_tracks(next),
            _ => {
                trace!(version = next.version, "deferring outgoing media until connectivity is back");
                self.deferred = Some(next);
            }
        }
    }

    /// Points every sender at the tracks of `next`, in place. Only a track whose parameters no longer fit its
    /// media section costs a renegotiation, and only of that section.
    fn replace_tracks(&mut self, next: Arc<OutgoingMediaState>) {
        if next.version == self.sent.version {
            return;
        }
        let mut renegotiate: Option<OfferOptions> = None;
        for kind in [TrackKind::Video, TrackKind::Audio] {
            let (before, after) = (self.sent.track(kind), next.track(kind));
            if before.map(|t| t.track.id) == after.map(|t| t.track.id) {
                if let (Some(before), Some(after)) = (before, after) {
                    if before.track.enabled != after.track.enabled {
                        let enabled = after.track.enabled;
                        if let Err(e) = self.transport(|t| t.set_track_enabled(kind, enabled)) {
                            debug!("failed to flip {kind} sender: {e}");
                        }
                    }
                }
                continue;
            }

            match self.transport(|t| t.replace_track(kind, after)) {
                Ok(outcome) => {
                    let renegotiated = outcome == ReplaceOutcome::NeedsRenegotiation;
                    if renegotiated {
                        let video_only = kind == TrackKind::Video && renegotiate.map_or(true, |o| o.video_only);
                        renegotiate = Some(OfferOptions {
                            video_only,
                            ..Default::default()
                        });
                    }
                    debug!(%kind, renegotiated, version = next.version, "replaced outgoing track");
                    self.shared.publish(|snapshot| snapshot.track_replacements += 1);
                    let _ = self.events.send(PoolEvent::TrackReplaced {
                        peer_id: self.peer.clone(),
                        kind,
                        renegotiated,
                    });
                }
                Err(e) => warn!("failed to replace {kind} track for {}: {e}", self.peer),
            }
        }

        let version = next.version;
        self.shared.publish(|snapshot| snapshot.local_track_version = version);
        self.sent = next;
        if let Some(options) = renegotiate {
            self.renegotiate(options);
        }
    }
}
