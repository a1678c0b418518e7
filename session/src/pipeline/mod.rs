//! The local media pipeline: raw capture in, one versioned outgoing stream out.
//!
//! Video runs background → avatar on a frame-rate driven task; audio runs its own fixed-window task. Stages are
//! attached once and then toggled or re-tuned while media keeps flowing. Enabling a stage whose resources are not
//! loaded yet starts a single, cancellable load that every concurrent caller awaits. Every change to the set of
//! outgoing tracks happens under one reconfiguration lock and ends in a freshly published [`OutgoingMediaState`].

mod avatar;
mod background;
mod denoise;
mod frame_loop;
mod output;
mod stage;

pub use avatar::{
    AvatarLoader,
    CentroidTracker,
    FacePose,
    FaceTracker,
};
pub use background::{
    BackgroundLoader,
    LumaSegmenter,
    Segmenter,
};
pub use denoise::{
    DenoiseLoader,
    NoiseGate,
};
pub use output::{
    FrameCounters,
    OutgoingMediaState,
};
pub use stage::{
    AudioTransform,
    PartialStageConfig,
    StageConfig,
    StageKind,
    StageLoader,
    StageRuntime,
    VideoTransform,
};

use crate::{
    devices::{
        CaptureTrack,
        RawStream,
    },
    error::StageError,
    id::TrackId,
    media::{
        AudioWindow,
        CaptureFeed,
        LocalTrack,
        MediaTap,
        Track,
        TrackKind,
        VideoFrame,
    },
};
use frame_loop::{
    ActiveAudioStage,
    ActiveVideoStage,
    AudioChain,
    LoopContext,
    VideoChain,
};
use futures::{
    future::{
        BoxFuture,
        Shared,
    },
    FutureExt as _,
};
use meshcall_config::PipelineConfig;
use output::FrameStats;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::AtomicU64,
        Arc,
        Mutex,
        Weak,
    },
};
use tokio::sync::{
    broadcast,
    mpsc,
    watch,
};
use tokio_util::sync::{
    CancellationToken,
    DropGuard,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct StageStatus {
    pub id: Uuid,
    pub kind: StageKind,
    pub enabled: bool,
    /// Resources are loaded. The stage only touches media while both `enabled` and `initialized`.
    pub initialized: bool,
    pub loading: bool,
    /// How many loads were started for this stage.
    pub loads: u32,
    pub last_error: Option<StageError>,
    pub config: StageConfig,
}

#[derive(Clone)]
enum LoadedStage {
    Video(Arc<Mutex<Box<dyn VideoTransform>>>),
    Audio(Arc<Mutex<Box<dyn AudioTransform>>>),
}

impl From<StageRuntime> for LoadedStage {
    fn from(runtime: StageRuntime) -> Self {
        match runtime {
            StageRuntime::Video(transform) => LoadedStage::Video(Arc::new(Mutex::new(transform))),
            StageRuntime::Audio(transform) => LoadedStage::Audio(Arc::new(Mutex::new(transform))),
        }
    }
}

type LoadResult = Shared<BoxFuture<'static, Result<(), StageError>>>;

struct PendingLoad {
    id: Uuid,
    cancel: CancellationToken,
    result: LoadResult,
}

struct StageSlot {
    id: Uuid,
    loader: Arc<dyn StageLoader>,
    config: StageConfig,
    enabled: bool,
    runtime: Option<LoadedStage>,
    loading: Option<PendingLoad>,
    last_error: Option<StageError>,
    loads: u32,
}

impl StageSlot {
    fn active(&self) -> Option<&LoadedStage> {
        self.runtime.as_ref().filter(|_| self.enabled)
    }

    fn cancel_load(&mut self) {
        if let Some(pending) = self.loading.take() {
            debug!(kind = %self.config.kind(), "cancelling stage load");
            pending.cancel.cancel();
        }
    }
}

struct Source {
    track: Track,
    _loop: DropGuard,
}

struct Published {
    source: TrackId,
    effects: Vec<StageKind>,
    track: Track,
}

/// One media kind's path from its capture source to its published outgoing track.
struct Lane {
    source: Option<Source>,
    enabled: bool,
    published: Option<Published>,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            source: None,
            enabled: true,
            published: None,
        }
    }
}

impl Lane {
    /// Returns whether the published track changed. A different source or effect set means a new track; a flipped
    /// enabled flag keeps the track id.
    fn refresh(&mut self, effects: Vec<StageKind>) -> bool {
        let Some(source) = &self.source else {
            return self.published.take().is_some();
        };
        match &mut self.published {
            Some(published) if published.source == source.track.id && published.effects == effects => {
                if published.track.enabled == self.enabled {
                    return false;
                }
                published.track.enabled = self.enabled;
            }
            _ => {
                let mut track = source.track.clone();
                track.id = TrackId::new();
                track.enabled = self.enabled;
                self.published = Some(Published {
                    source: source.track.id,
                    effects,
                    track,
                });
            }
        }
        true
    }
}

#[derive(Default)]
struct PipelineState {
    stages: BTreeMap<StageKind, StageSlot>,
    video: Lane,
    audio: Lane,
}

impl PipelineState {
    fn lane_mut(&mut self, kind: TrackKind) -> &mut Lane {
        match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }

    fn slot_mut(&mut self, kind: StageKind) -> Result<&mut StageSlot, StageError> {
        self.stages.get_mut(&kind).ok_or(StageError::NotAttached(kind))
    }
}

struct PipelineInner {
    config: PipelineConfig,
    state: Mutex<PipelineState>,
    /// Held across every change to the outgoing tracks so that no half-applied reconfiguration is ever published.
    reconfigure: tokio::sync::Mutex<()>,
    output: watch::Sender<Arc<OutgoingMediaState>>,
    video_chain: watch::Sender<VideoChain>,
    audio_chain: watch::Sender<AudioChain>,
    video_tap: broadcast::Sender<Arc<VideoFrame>>,
    audio_tap: broadcast::Sender<Arc<AudioWindow>>,
    stats: Arc<FrameStats>,
    video_seq: Arc<AtomicU64>,
    audio_seq: Arc<AtomicU64>,
    faults: mpsc::UnboundedSender<StageError>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

#[derive(Clone)]
pub struct MediaPipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for MediaPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPipeline")
            .field("config", &self.inner.config)
            .field("version", &self.inner.output.borrow().version)
            .finish_non_exhaustive()
    }
}

impl MediaPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner = Arc::new(PipelineInner {
            config,
            state: Default::default(),
            reconfigure: Default::default(),
            output: watch::Sender::new(Default::default()),
            video_chain: watch::Sender::new(Default::default()),
            audio_chain: watch::Sender::new(Default::default()),
            video_tap: broadcast::channel(16).0,
            audio_tap: broadcast::channel(64).0,
            stats: Default::default(),
            video_seq: Default::default(),
            audio_seq: Default::default(),
            faults: faults_tx,
            _guard: cancel.clone().drop_guard(),
            cancel: cancel.clone(),
        });
        tokio::spawn(supervise_faults(Arc::downgrade(&inner), faults_rx, cancel));
        Self { inner }
    }

    /// A pipeline with the built-in background, avatar and denoise stages attached, configured from `config`.
    pub async fn with_builtin_stages(config: &meshcall_config::Config) -> Result<Self, StageError> {
        let pipeline = Self::new(config.pipeline);
        pipeline
            .attach_stage(
                Arc::new(BackgroundLoader::default()),
                StageConfig::Background(config.background.clone()),
            )
            .await?;
        pipeline
            .attach_stage(Arc::new(AvatarLoader::default()), StageConfig::Avatar(config.avatar.clone()))
            .await?;
        pipeline
            .attach_stage(Arc::new(DenoiseLoader::default()), StageConfig::AudioDenoise(config.audio))
            .await?;
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Attaches a stage, disabled, replacing any stage of the same kind.
    #[instrument(level = "debug", skip_all, fields(kind = %loader.kind()))]
    pub async fn attach_stage(&self, loader: Arc<dyn StageLoader>, config: StageConfig) -> Result<Uuid, StageError> {
        let kind = loader.kind();
        if config.kind() != kind {
            return Err(StageError::WrongKind {
                kind: config.kind(),
                expected: kind,
            });
        }

        let id = Uuid::new_v4();
        let _reconfigure = self.inner.reconfigure.lock().await;
        let mut state = self.inner.state.lock().unwrap();
        let slot = StageSlot {
            id,
            loader,
            config,
            enabled: false,
            runtime: None,
            loading: None,
            last_error: None,
            loads: 0,
        };
        if let Some(mut previous) = state.stages.insert(kind, slot) {
            debug!(previous = %previous.id, "replacing attached stage");
            previous.cancel_load();
        }
        self.inner.rebuild(&mut state);
        Ok(id)
    }

    /// Turns a stage on or off. Turning on an unloaded stage waits for its load; concurrent callers share one load.
    /// Turning off keeps the config and the loaded resources, and cancels a load still in flight.
    #[instrument(level = "debug", skip(self))]
    pub async fn set_stage_enabled(&self, kind: StageKind, enabled: bool) -> Result<(), StageError> {
        if !enabled {
            let _reconfigure = self.inner.reconfigure.lock().await;
            let mut state = self.inner.state.lock().unwrap();
            let slot = state.slot_mut(kind)?;
            slot.enabled = false;
            slot.cancel_load();
            self.inner.rebuild(&mut state);
            return Ok(());
        }

        let pending = {
            let mut state = self.inner.state.lock().unwrap();
            let slot = state.slot_mut(kind)?;
            slot.enabled = true;
            slot.last_error = None;
            if let Some(pending) = &slot.loading {
                Some(pending.result.clone())
            } else if slot.runtime.is_none() {
                Some(self.start_load(kind, slot))
            } else {
                None
            }
        };

        match pending {
            Some(load) => load.await,
            None => {
                self.inner.republish().await;
                Ok(())
            }
        }
    }

    fn start_load(&self, kind: StageKind, slot: &mut StageSlot) -> LoadResult {
        let id = Uuid::new_v4();
        let cancel = self.inner.cancel.child_token();
        let loading = slot.loader.load(&slot.config);
        slot.loads += 1;
        debug!(%kind, attempt = slot.loads, "loading stage");

        let task = tokio::spawn(run_load(Arc::downgrade(&self.inner), kind, id, loading, cancel.clone()));
        let result = async move { task.await.unwrap_or(Err(StageError::Cancelled(kind))) }
            .boxed()
            .shared();
        slot.loading = Some(PendingLoad {
            id,
            cancel,
            result: result.clone(),
        });
        result
    }

    /// Merges `partial` into the stage's config. Audio parameters reach the running graph with the next window.
    /// A change of avatar model reloads the stage in the background; the old model keeps rendering until the
    /// new one is ready.
    #[instrument(level = "debug", skip(self))]
    pub async fn update_stage_config(
        &self,
        kind: StageKind,
        partial: PartialStageConfig,
    ) -> Result<StageConfig, StageError> {
        if partial.kind() != kind {
            return Err(StageError::WrongKind {
                kind: partial.kind(),
                expected: kind,
            });
        }

        let (next, reload) = {
            let _reconfigure = self.inner.reconfigure.lock().await;
            let mut state = self.inner.state.lock().unwrap();
            let slot = state.slot_mut(kind)?;
            let next = slot.config.merge(&partial)?;
            let needs_reload = slot.config.needs_reload(&next);
            slot.config = next.clone();

            let mut reload = None;
            if needs_reload && (slot.runtime.is_some() || slot.loading.is_some()) {
                slot.cancel_load();
                if slot.enabled {
                    reload = Some(self.start_load(kind, slot));
                } else {
                    slot.runtime = None;
                }
            }
            self.inner.rebuild(&mut state);
            (next, reload)
        };

        if let Some(reload) = reload {
            reload.await?;
        }
        Ok(next)
    }

    pub fn stage_config(&self, kind: StageKind) -> Option<StageConfig> {
        self.inner.state.lock().unwrap().stages.get(&kind).map(|s| s.config.clone())
    }

    pub fn stage_status(&self, kind: StageKind) -> Option<StageStatus> {
        let state = self.inner.state.lock().unwrap();
        state.stages.get(&kind).map(|slot| StageStatus {
            id: slot.id,
            kind,
            enabled: slot.enabled,
            initialized: slot.runtime.is_some(),
            loading: slot.loading.is_some(),
            loads: slot.loads,
            last_error: slot.last_error.clone(),
            config: slot.config.clone(),
        })
    }

    pub fn current_output(&self) -> Arc<OutgoingMediaState> {
        self.inner.output.borrow().clone()
    }

    pub fn subscribe_output(&self) -> watch::Receiver<Arc<OutgoingMediaState>> {
        self.inner.output.subscribe()
    }

    /// Local preview of the processed video.
    pub fn subscribe_video(&self) -> broadcast::Receiver<Arc<VideoFrame>> {
        self.inner.video_tap.subscribe()
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<Arc<AudioWindow>> {
        self.inner.audio_tap.subscribe()
    }

    pub fn counters(&self) -> FrameCounters {
        self.inner.stats.snapshot()
    }

    /// Starts processing the given capture. Whatever was attached before is detached in the same step.
    #[instrument(level = "debug", skip_all)]
    pub async fn attach_sources(&self, stream: &RawStream) {
        let _reconfigure = self.inner.reconfigure.lock().await;
        let mut state = self.inner.state.lock().unwrap();
        for kind in [TrackKind::Video, TrackKind::Audio] {
            state.lane_mut(kind).source = stream.get(kind).map(|capture| self.inner.spawn_source(capture));
        }
        self.inner.rebuild(&mut state);
    }

    /// Swaps the source of one kind, leaving the other lane running.
    #[instrument(level = "debug", skip_all, fields(device = %capture.device_id))]
    pub async fn replace_source(&self, capture: &CaptureTrack) {
        let _reconfigure = self.inner.reconfigure.lock().await;
        let mut state = self.inner.state.lock().unwrap();
        let source = self.inner.spawn_source(capture);
        state.lane_mut(capture.track.kind()).source = Some(source);
        self.inner.rebuild(&mut state);
    }

    pub async fn detach_sources(&self) {
        let _reconfigure = self.inner.reconfigure.lock().await;
        let mut state = self.inner.state.lock().unwrap();
        state.video.source = None;
        state.audio.source = None;
        self.inner.rebuild(&mut state);
    }

    /// Mutes or unmutes an outgoing track without replacing it.
    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        let _reconfigure = self.inner.reconfigure.lock().await;
        let mut state = self.inner.state.lock().unwrap();
        state.lane_mut(kind).enabled = enabled;
        self.inner.rebuild(&mut state);
    }

    pub fn track_enabled(&self, kind: TrackKind) -> bool {
        self.inner.state.lock().unwrap().lane_mut(kind).enabled
    }

    /// Detaches all sources and cancels pending loads. Loaded stages and their configs survive for the next start.
    pub async fn stop(&self) {
        let _reconfigure = self.inner.reconfigure.lock().await;
        let mut state = self.inner.state.lock().unwrap();
        for slot in state.stages.values_mut() {
            if slot.loading.is_some() {
                slot.cancel_load();
                if slot.runtime.is_none() {
                    slot.enabled = false;
                }
            }
        }
        state.video.source = None;
        state.audio.source = None;
        self.inner.rebuild(&mut state);
    }
}

impl PipelineInner {
    fn loop_context(&self, seq: &Arc<AtomicU64>) -> LoopContext {
        LoopContext {
            cancel: self.cancel.child_token(),
            stats: self.stats.clone(),
            faults: self.faults.clone(),
            seq: seq.clone(),
        }
    }

    fn spawn_source(&self, capture: &CaptureTrack) -> Source {
        let guard = match &capture.feed {
            CaptureFeed::Video(feed) => {
                let ctx = self.loop_context(&self.video_seq);
                let guard = ctx.cancel.clone().drop_guard();
                tokio::spawn(frame_loop::run_video(
                    feed.clone(),
                    self.video_chain.subscribe(),
                    self.video_tap.clone(),
                    self.config.frame_interval(),
                    ctx,
                ));
                guard
            }
            CaptureFeed::Audio(feed) => {
                let ctx = self.loop_context(&self.audio_seq);
                let guard = ctx.cancel.clone().drop_guard();
                tokio::spawn(frame_loop::run_audio(
                    feed.subscribe(),
                    self.audio_chain.subscribe(),
                    self.audio_tap.clone(),
                    self.config.audio_interval(),
                    ctx,
                ));
                guard
            }
        };
        debug!(kind = %capture.track.kind(), device = %capture.device_id, "started processing loop");
        Source {
            track: capture.track.clone(),
            _loop: guard,
        }
    }

    async fn republish(&self) {
        let _reconfigure = self.reconfigure.lock().await;
        let mut state = self.state.lock().unwrap();
        self.rebuild(&mut state);
    }

    /// Pushes the active stage chains to the loops and publishes a new output if the outgoing tracks changed.
    /// Callers hold the reconfiguration lock.
    fn rebuild(&self, state: &mut PipelineState) {
        let mut video = Vec::new();
        for kind in StageKind::VIDEO_ORDER {
            if let Some((slot, LoadedStage::Video(transform))) =
                state.stages.get(&kind).and_then(|slot| slot.active().map(|runtime| (slot, runtime)))
            {
                video.push(ActiveVideoStage {
                    kind,
                    config: slot.config.clone(),
                    transform: transform.clone(),
                });
            }
        }
        let mut audio = Vec::new();
        if let Some((slot, LoadedStage::Audio(transform))) = state
            .stages
            .get(&StageKind::AudioDenoise)
            .and_then(|slot| slot.active().map(|runtime| (slot, runtime)))
        {
            if let Some(config) = slot.config.audio() {
                audio.push(ActiveAudioStage {
                    kind: StageKind::AudioDenoise,
                    config: *config,
                    transform: transform.clone(),
                });
            }
        }

        let video_effects: Vec<StageKind> = video.iter().map(|s| s.kind).collect();
        let audio_effects: Vec<StageKind> = audio.iter().map(|s| s.kind).collect();
        self.video_chain.send_replace(Arc::new(video));
        self.audio_chain.send_replace(Arc::new(audio));

        let video_changed = state.video.refresh(video_effects.clone());
        let audio_changed = state.audio.refresh(audio_effects.clone());
        if !video_changed && !audio_changed {
            return;
        }

        let local = |lane: &Lane, tap: MediaTap| {
            lane.published.as_ref().map(|published| LocalTrack {
                track: published.track.clone(),
                tap,
            })
        };
        let version = self.output.borrow().version + 1;
        let next = OutgoingMediaState {
            version,
            video: local(&state.video, MediaTap::Video(self.video_tap.clone())),
            audio: local(&state.audio, MediaTap::Audio(self.audio_tap.clone())),
            effects: video_effects.into_iter().chain(audio_effects).collect(),
        };
        debug!(version, effects = ?next.effects, "publishing outgoing media");
        self.output.send_replace(Arc::new(next));
    }

    async fn fail_stage(&self, kind: StageKind, err: StageError) {
        let _reconfigure = self.reconfigure.lock().await;
        let mut state = self.state.lock().unwrap();
        let Ok(slot) = state.slot_mut(kind) else {
            return;
        };
        if !slot.enabled {
            return;
        }
        warn!(%kind, %err, "stage failed, disabling it");
        slot.enabled = false;
        slot.cancel_load();
        slot.last_error = Some(err);
        self.rebuild(&mut state);
    }
}

async fn run_load(
    inner: Weak<PipelineInner>,
    kind: StageKind,
    id: Uuid,
    loading: BoxFuture<'static, Result<StageRuntime, StageError>>,
    cancel: CancellationToken,
) -> Result<(), StageError> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled(kind)),
        result = loading => result,
    };
    let result = result.and_then(|runtime| {
        if runtime.track_kind() == kind.track_kind() {
            Ok(runtime)
        } else {
            Err(StageError::LoadFailed {
                kind,
                reason: format!("loader produced a {} runtime", runtime.track_kind()),
            })
        }
    });

    let Some(inner) = inner.upgrade() else {
        return Err(StageError::Cancelled(kind));
    };
    let _reconfigure = inner.reconfigure.lock().await;
    let mut state = inner.state.lock().unwrap();
    let slot = state.slot_mut(kind)?;
    if slot.loading.as_ref().map_or(true, |pending| pending.id != id) {
        // superseded by a disable, a newer load or a re-attach
        return Err(StageError::Cancelled(kind));
    }
    slot.loading = None;

    let outcome = match result {
        Ok(runtime) => {
            info!(%kind, "stage loaded");
            slot.runtime = Some(runtime.into());
            Ok(())
        }
        Err(StageError::Cancelled(kind)) => Err(StageError::Cancelled(kind)),
        Err(err) => {
            warn!(%kind, %err, "stage failed to load");
            slot.enabled = false;
            slot.runtime = None;
            slot.last_error = Some(err.clone());
            Err(err)
        }
    };
    inner.rebuild(&mut state);
    outcome
}

async fn supervise_faults(
    inner: Weak<PipelineInner>,
    mut faults: mpsc::UnboundedReceiver<StageError>,
    cancel: CancellationToken,
) {
    loop {
        let err = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            err = faults.recv() => match err {
                Some(err) => err,
                None => break,
            },
        };
        let Some(kind) = err.kind() else {
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.fail_stage(kind, err).await;
    }
}

#[cfg(test)]
mod tests;
