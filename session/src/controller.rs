//! Top-level orchestration of the local participant: devices feed the pipeline, the pipeline feeds the mesh, and
//! the lifecycle decides when any of it runs.

use crate::{
    devices::{
        DeviceList,
        DeviceManager,
        SelectedDevices,
    },
    error::{
        SessionError,
        StageError,
    },
    feeds::{
        self,
        FeedView,
    },
    id::PeerId,
    media::TrackKind,
    peer::PeerPool,
    pipeline::{
        MediaPipeline,
        PartialStageConfig,
        StageConfig,
        StageKind,
    },
    roster::RosterSource,
    signaling::SignalingClient,
    transport::TransportFactory,
};
use meshcall_config::ConnectionConfig;
use serde::Serialize;
use std::{
    collections::BTreeSet,
    sync::Arc,
};
use strum::{
    Display,
    EnumString,
};
use tokio::sync::{
    watch,
    Mutex,
};

#[derive(Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Hash, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycle {
    #[default]
    Disabled,
    /// Devices and pipeline run for a local preview; nothing is published.
    Preparing,
    Active,
}

pub struct SessionController {
    roster: Arc<dyn RosterSource>,
    signaling: Arc<dyn SignalingClient>,
    devices: Mutex<DeviceManager>,
    pipeline: MediaPipeline,
    pool: PeerPool,
    lifecycle: watch::Sender<SessionLifecycle>,
    /// Serializes lifecycle transitions and device switches.
    transition: Mutex<()>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("local", self.signaling.local_id())
            .field("lifecycle", &*self.lifecycle.borrow())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    pub fn new(
        roster: Arc<dyn RosterSource>,
        devices: DeviceManager,
        pipeline: MediaPipeline,
        signaling: Arc<dyn SignalingClient>,
        transports: Arc<dyn TransportFactory>,
        connection: ConnectionConfig,
    ) -> Self {
        let pool = PeerPool::new(signaling.clone(), transports, pipeline.subscribe_output(), connection);
        Self {
            roster,
            signaling,
            devices: Mutex::new(devices),
            pipeline,
            pool,
            lifecycle: watch::Sender::new(SessionLifecycle::Disabled),
            transition: Mutex::new(()),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        self.signaling.local_id()
    }

    pub fn state(&self) -> SessionLifecycle {
        *self.lifecycle.borrow()
    }

    pub fn lifecycle(&self) -> watch::Receiver<SessionLifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn pipeline(&self) -> &MediaPipeline {
        &self.pipeline
    }

    pub fn pool(&self) -> &PeerPool {
        &self.pool
    }

    pub fn roster(&self) -> &Arc<dyn RosterSource> {
        &self.roster
    }

    fn set_lifecycle(&self, next: SessionLifecycle) {
        let previous = self.lifecycle.send_replace(next);
        if previous != next {
            info!(local = %self.local_id(), from = %previous, to = %next, "session lifecycle changed");
        }
    }

    /// Acquires the local devices and starts the pipeline for a preview. A device failure leaves the session
    /// disabled. Does nothing unless disabled.
    #[instrument(level = "debug", skip_all, fields(local = %self.local_id()))]
    pub async fn prepare(&self) -> Result<(), SessionError> {
        let _transition = self.transition.lock().await;
        if self.state() != SessionLifecycle::Disabled {
            debug!(state = %self.state(), "prepare ignored");
            return Ok(());
        }

        let mut devices = self.devices.lock().await;
        let SelectedDevices { camera, microphone } = devices.selected().clone();
        if let Err(e) = devices.acquire(camera.as_deref(), microphone.as_deref()).map(drop) {
            if camera.is_none() && microphone.is_none() {
                return Err(e.into());
            }
            warn!("previously selected devices unavailable ({e}), falling back to defaults");
            devices.acquire(None, None)?;
        }
        self.pipeline.attach_sources(devices.stream()).await;
        self.set_lifecycle(SessionLifecycle::Preparing);
        Ok(())
    }

    /// Publishes the prepared media to the room. Does nothing unless preparing.
    #[instrument(level = "debug", skip_all, fields(local = %self.local_id()))]
    pub async fn confirm(&self) -> Result<(), SessionError> {
        let _transition = self.transition.lock().await;
        if self.state() != SessionLifecycle::Preparing {
            debug!(state = %self.state(), "confirm ignored");
            return Ok(());
        }

        let room_code = self.roster.room_code().ok_or(SessionError::NoRoom)?;
        self.pool.start();
        if let Err(e) = self.signaling.join(&room_code) {
            self.pool.clear();
            return Err(e.into());
        }
        self.set_lifecycle(SessionLifecycle::Active);
        self.reconcile_roster();
        Ok(())
    }

    /// [`Self::prepare`] followed by [`Self::confirm`].
    pub async fn enable(&self) -> Result<(), SessionError> {
        self.prepare().await?;
        self.confirm().await
    }

    /// Abandons the preview and releases the devices. Does nothing unless preparing.
    #[instrument(level = "debug", skip_all, fields(local = %self.local_id()))]
    pub async fn cancel(&self) {
        let _transition = self.transition.lock().await;
        if self.state() != SessionLifecycle::Preparing {
            debug!(state = %self.state(), "cancel ignored");
            return;
        }
        self.release_media().await;
        self.set_lifecycle(SessionLifecycle::Disabled);
    }

    /// Leaves the room, closes every connection and releases the devices.
    #[instrument(level = "debug", skip_all, fields(local = %self.local_id()))]
    pub async fn disable(&self) {
        let _transition = self.transition.lock().await;
        match self.state() {
            SessionLifecycle::Disabled => return,
            SessionLifecycle::Active => {
                self.pool.clear();
                if let Err(e) = self.signaling.leave() {
                    warn!("failed to leave the room: {e}");
                }
            }
            SessionLifecycle::Preparing => {}
        }
        self.release_media().await;
        self.set_lifecycle(SessionLifecycle::Disabled);
    }

    async fn release_media(&self) {
        self.pipeline.stop().await;
        self.devices.lock().await.release();
    }

    /// Opens connections to roster participants that have none yet and closes connections to participants no
    /// longer listed. Only acts while active.
    pub fn sync_roster(&self) {
        if self.state() == SessionLifecycle::Active {
            self.reconcile_roster();
        }
    }

    fn reconcile_roster(&self) {
        let local = self.local_id();
        let listed: BTreeSet<PeerId> = self
            .roster
            .participants()
            .into_iter()
            .chain(self.roster.host())
            .map(|p| p.id)
            .filter(|id| id != local)
            .collect();
        for peer in self.pool.peers() {
            if !listed.contains(&peer) {
                self.pool.remove_peer(&peer);
            }
        }
        for peer in listed {
            self.pool.add_peer(peer);
        }
    }

    pub async fn list_devices(&self) -> Result<DeviceList, SessionError> {
        Ok(self.devices.lock().await.list_devices()?)
    }

    /// Swaps one capture device. Every connection keeps its state; only the outgoing track of that kind is
    /// replaced in place.
    #[instrument(level = "debug", skip(self))]
    pub async fn switch_device(&self, kind: TrackKind, device_id: &str) -> Result<(), SessionError> {
        let _transition = self.transition.lock().await;
        let mut devices = self.devices.lock().await;
        if self.state() == SessionLifecycle::Disabled {
            let SelectedDevices { camera, microphone } = devices.selected().clone();
            match kind {
                TrackKind::Video => devices.acquire(Some(device_id), microphone.as_deref())?,
                TrackKind::Audio => devices.acquire(camera.as_deref(), Some(device_id))?,
            };
            // remembered for the next prepare
            devices.release();
            return Ok(());
        }
        let capture = devices.switch_device(kind, device_id)?;
        self.pipeline.replace_source(capture).await;
        Ok(())
    }

    pub async fn set_stage_enabled(&self, kind: StageKind, enabled: bool) -> Result<(), StageError> {
        self.pipeline.set_stage_enabled(kind, enabled).await
    }

    pub async fn update_stage_config(
        &self,
        kind: StageKind,
        partial: PartialStageConfig,
    ) -> Result<StageConfig, StageError> {
        self.pipeline.update_stage_config(kind, partial).await
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) {
        self.pipeline.set_track_enabled(TrackKind::Audio, enabled).await;
        self.roster.on_media_state_change(enabled);
    }

    pub async fn set_camera_enabled(&self, enabled: bool) {
        self.pipeline.set_track_enabled(TrackKind::Video, enabled).await;
        self.roster
            .on_media_state_change(self.pipeline.track_enabled(TrackKind::Audio));
    }

    pub fn microphone_enabled(&self) -> bool {
        self.pipeline.track_enabled(TrackKind::Audio)
    }

    pub fn camera_enabled(&self) -> bool {
        self.pipeline.track_enabled(TrackKind::Video)
    }

    /// Whether the local participant may still cast a vote in the current phase.
    pub fn can_vote(&self) -> bool {
        self.roster.is_voting_phase() && !self.roster.has_voted()
    }

    pub fn language(&self) -> String {
        self.roster.language()
    }

    pub fn feeds(&self) -> Vec<FeedView> {
        feeds::assemble(
            self.roster.as_ref(),
            self.pipeline.current_output(),
            !self.microphone_enabled(),
            &self.pool,
        )
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devices::FakeBackend,
        error::DeviceError,
        roster::{
            Participant,
            StaticRoster,
        },
        signaling::LocalSignalingHub,
        transport::SimulatedNetwork,
    };
    use meshcall_config::{
        media::FakeMedia,
        PipelineConfig,
    };
    use pretty_assertions::assert_eq;

    fn small() -> PipelineConfig {
        PipelineConfig {
            frame_width: 16,
            frame_height: 9,
            ..Default::default()
        }
    }

    fn controller(hub: &LocalSignalingHub, backend: &FakeBackend, roster: &StaticRoster) -> SessionController {
        SessionController::new(
            Arc::new(roster.clone()),
            DeviceManager::new(Arc::new(backend.clone())),
            MediaPipeline::new(small()),
            Arc::new(hub.client(roster.local_id())),
            Arc::new(SimulatedNetwork::new()),
            ConnectionConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_transitions_are_guarded() {
        let hub = LocalSignalingHub::new();
        let backend = FakeBackend::new(&FakeMedia::Builtin, small());
        let roster = StaticRoster::new("alice", "room");
        let session = controller(&hub, &backend, &roster);

        session.confirm().await.unwrap();
        session.cancel().await;
        assert_eq!(session.state(), SessionLifecycle::Disabled);

        session.prepare().await.unwrap();
        assert_eq!(session.state(), SessionLifecycle::Preparing);
        assert!(backend.is_open("fake-camera-0"));
        assert!(hub.members("room").is_empty());
        session.prepare().await.unwrap();

        session.confirm().await.unwrap();
        assert_eq!(session.state(), SessionLifecycle::Active);
        assert_eq!(hub.members("room"), vec![PeerId::from("alice")]);
        session.cancel().await;
        assert_eq!(session.state(), SessionLifecycle::Active);

        session.disable().await;
        assert_eq!(session.state(), SessionLifecycle::Disabled);
        assert!(!backend.is_open("fake-camera-0"));
        assert!(hub.members("room").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_the_preview() {
        let hub = LocalSignalingHub::new();
        let backend = FakeBackend::new(&FakeMedia::Builtin, small());
        let roster = StaticRoster::new("alice", "room");
        let session = controller(&hub, &backend, &roster);

        session.prepare().await.unwrap();
        session.cancel().await;
        assert_eq!(session.state(), SessionLifecycle::Disabled);
        assert!(!backend.is_open("fake-microphone-0"));
        assert!(session.pipeline().current_output().video.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn device_failures_keep_the_session_disabled() {
        let hub = LocalSignalingHub::new();
        let backend = FakeBackend::new(&FakeMedia::Builtin, small());
        backend.deny_permission(TrackKind::Video);
        let roster = StaticRoster::new("alice", "room");
        let session = controller(&hub, &backend, &roster);

        assert_eq!(
            session.prepare().await,
            Err(SessionError::Device(DeviceError::PermissionDenied(TrackKind::Video)))
        );
        assert_eq!(session.state(), SessionLifecycle::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_room_code_blocks_confirmation() {
        let hub = LocalSignalingHub::new();
        let backend = FakeBackend::new(&FakeMedia::Builtin, small());
        let roster = StaticRoster::new("alice", "room");
        roster.set_room_code(None);
        let session = controller(&hub, &backend, &roster);

        session.prepare().await.unwrap();
        assert_eq!(session.confirm().await, Err(SessionError::NoRoom));
        assert_eq!(session.state(), SessionLifecycle::Preparing);
    }

    #[tokio::test(start_paused = true)]
    async fn microphone_toggles_reach_the_roster() {
        let hub = LocalSignalingHub::new();
        let backend = FakeBackend::new(&FakeMedia::Builtin, small());
        let roster = StaticRoster::new("alice", "room");
        let session = controller(&hub, &backend, &roster);
        session.enable().await.unwrap();

        let before = session.pipeline().current_output();
        session.set_microphone_enabled(false).await;
        let after = session.pipeline().current_output();
        assert!(!session.microphone_enabled());
        assert_eq!(
            before.audio.as_ref().map(|t| t.track.id),
            after.audio.as_ref().map(|t| t.track.id)
        );
        assert!(after.version > before.version);

        session.set_camera_enabled(false).await;
        assert_eq!(roster.media_reports(), vec![false, false]);
        assert!(session.feeds().is_empty());

        roster.upsert(Participant::member("alice", "Alice"));
        let feeds = session.feeds();
        assert!(feeds[0].is_self && feeds[0].microphone_muted);
    }

    #[tokio::test(start_paused = true)]
    async fn roster_changes_open_and_close_connections() {
        let hub = LocalSignalingHub::new();
        let backend = FakeBackend::new(&FakeMedia::Builtin, small());
        let roster = StaticRoster::new("alice", "room");
        let session = controller(&hub, &backend, &roster);

        roster.upsert(Participant::member("bob", "Bob"));
        session.sync_roster();
        assert!(session.pool().is_empty());

        session.enable().await.unwrap();
        assert_eq!(session.pool().peers(), vec![PeerId::from("bob")]);

        roster.remove(&"bob".into());
        session.sync_roster();
        assert!(session.pool().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_device_survives_a_restart() {
        let hub = LocalSignalingHub::new();
        let backend = FakeBackend::new(&FakeMedia::DualCamera, small());
        let roster = StaticRoster::new("alice", "room");
        let session = controller(&hub, &backend, &roster);

        session.switch_device(TrackKind::Video, "fake-camera-1").await.unwrap();
        assert!(!backend.is_open("fake-camera-1"));
        session.prepare().await.unwrap();
        assert!(backend.is_open("fake-camera-1"));
        assert!(!backend.is_open("fake-camera-0"));
    }
}
