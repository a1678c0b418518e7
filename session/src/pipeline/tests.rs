use super::*;
use crate::devices::{
    DeviceManager,
    FakeBackend,
};
use meshcall_config::{
    media::FakeMedia,
    AvatarType,
    PartialAudioConfig,
    PartialAvatarConfig,
    PartialBackgroundConfig,
};
use pretty_assertions::assert_eq;
use std::{
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
    time::Duration,
};

struct Passthrough;

impl VideoTransform for Passthrough {
    fn apply(&mut self, _frame: &mut VideoFrame, _config: &StageConfig) -> Result<(), StageError> {
        Ok(())
    }
}

impl AudioTransform for Passthrough {
    fn process(&mut self, _samples: &mut [f32], _config: &meshcall_config::AudioConfig) -> Result<(), StageError> {
        Ok(())
    }
}

struct Broken;

impl VideoTransform for Broken {
    fn apply(&mut self, _frame: &mut VideoFrame, _config: &StageConfig) -> Result<(), StageError> {
        Err(StageError::RuntimeError {
            kind: StageKind::Avatar,
            reason: "tracker crashed".into(),
        })
    }
}

#[derive(Clone)]
struct TestLoader {
    kind: StageKind,
    loads: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
    broken: bool,
}

impl TestLoader {
    fn new(kind: StageKind) -> Self {
        Self {
            kind,
            loads: Default::default(),
            delay: Duration::from_millis(100),
            fail: false,
            broken: false,
        }
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl StageLoader for TestLoader {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn load(&self, _config: &StageConfig) -> BoxFuture<'static, Result<StageRuntime, StageError>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        async move {
            tokio::time::sleep(this.delay).await;
            if this.fail {
                return Err(StageError::LoadFailed {
                    kind: this.kind,
                    reason: "model download failed".into(),
                });
            }
            Ok(match this.kind.track_kind() {
                TrackKind::Video if this.broken => StageRuntime::Video(Box::new(Broken)),
                TrackKind::Video => StageRuntime::Video(Box::new(Passthrough)),
                TrackKind::Audio => StageRuntime::Audio(Box::new(Passthrough)),
            })
        }
        .boxed()
    }
}

fn small() -> PipelineConfig {
    PipelineConfig {
        frame_width: 16,
        frame_height: 9,
        ..Default::default()
    }
}

async fn pipeline_with(loaders: &[&TestLoader]) -> MediaPipeline {
    let pipeline = MediaPipeline::new(small());
    for loader in loaders {
        pipeline
            .attach_stage(Arc::new((*loader).clone()), StageConfig::default_for(loader.kind))
            .await
            .unwrap();
    }
    pipeline
}

fn capture(media: FakeMedia) -> DeviceManager {
    let mut devices = DeviceManager::new(Arc::new(FakeBackend::new(&media, small())));
    devices.acquire(None, None).unwrap();
    devices
}

#[tokio::test(start_paused = true)]
async fn concurrent_enables_share_one_load() {
    let loader = TestLoader::new(StageKind::Background);
    let pipeline = pipeline_with(&[&loader]).await;

    let (first, second) = tokio::join!(
        pipeline.set_stage_enabled(StageKind::Background, true),
        pipeline.set_stage_enabled(StageKind::Background, true),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(loader.loads(), 1);
    let status = pipeline.stage_status(StageKind::Background).unwrap();
    assert!(status.enabled && status.initialized && !status.loading);
    assert_eq!(status.loads, 1);
}

#[tokio::test(start_paused = true)]
async fn disabling_keeps_config_and_resources() {
    let loader = TestLoader::new(StageKind::AudioDenoise);
    let pipeline = pipeline_with(&[&loader]).await;
    let tuned = PartialStageConfig::AudioDenoise(PartialAudioConfig {
        noise_threshold: Some(0.35),
        gain_smoothing_factor: Some(0.5),
        ..Default::default()
    });
    let config = pipeline
        .update_stage_config(StageKind::AudioDenoise, tuned)
        .await
        .unwrap();

    pipeline.set_stage_enabled(StageKind::AudioDenoise, true).await.unwrap();
    pipeline.set_stage_enabled(StageKind::AudioDenoise, false).await.unwrap();
    assert_eq!(pipeline.stage_config(StageKind::AudioDenoise), Some(config.clone()));

    pipeline.set_stage_enabled(StageKind::AudioDenoise, true).await.unwrap();
    let status = pipeline.stage_status(StageKind::AudioDenoise).unwrap();
    assert_eq!(status.config, config);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test(start_paused = true)]
async fn audio_tuning_does_not_reload_the_graph() {
    let loader = TestLoader::new(StageKind::AudioDenoise);
    let pipeline = pipeline_with(&[&loader]).await;
    pipeline.set_stage_enabled(StageKind::AudioDenoise, true).await.unwrap();
    for threshold in [0.2, 0.3, 0.4] {
        pipeline
            .update_stage_config(
                StageKind::AudioDenoise,
                PartialStageConfig::AudioDenoise(PartialAudioConfig {
                    spectral_gate_threshold: Some(threshold),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
    }
    assert_eq!(loader.loads(), 1);

    let out_of_range = pipeline
        .update_stage_config(
            StageKind::AudioDenoise,
            PartialStageConfig::AudioDenoise(PartialAudioConfig {
                spectral_gate_threshold: Some(0.9),
                ..Default::default()
            }),
        )
        .await;
    assert!(matches!(out_of_range, Err(StageError::InvalidConfig(_))));
}

#[tokio::test(start_paused = true)]
async fn a_failed_load_only_affects_its_stage() {
    let background = TestLoader::new(StageKind::Background);
    let mut avatar = TestLoader::new(StageKind::Avatar);
    avatar.fail = true;
    let pipeline = pipeline_with(&[&background, &avatar]).await;
    let devices = capture(FakeMedia::Builtin);
    pipeline.attach_sources(devices.stream()).await;

    pipeline.set_stage_enabled(StageKind::Background, true).await.unwrap();
    let err = pipeline.set_stage_enabled(StageKind::Avatar, true).await.unwrap_err();
    assert!(matches!(err, StageError::LoadFailed { kind: StageKind::Avatar, .. }));

    let status = pipeline.stage_status(StageKind::Avatar).unwrap();
    assert!(!status.enabled && !status.initialized);
    assert_eq!(status.last_error, Some(err));
    assert_eq!(pipeline.current_output().effects, vec![StageKind::Background]);
}

#[tokio::test(start_paused = true)]
async fn disabling_cancels_a_load_in_flight() {
    let mut loader = TestLoader::new(StageKind::Avatar);
    loader.delay = Duration::from_secs(30);
    let pipeline = pipeline_with(&[&loader]).await;

    let enabling = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.set_stage_enabled(StageKind::Avatar, true).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(pipeline.stage_status(StageKind::Avatar).unwrap().loading);

    pipeline.set_stage_enabled(StageKind::Avatar, false).await.unwrap();
    assert_eq!(enabling.await.unwrap(), Err(StageError::Cancelled(StageKind::Avatar)));
    let status = pipeline.stage_status(StageKind::Avatar).unwrap();
    assert!(!status.loading && !status.initialized && !status.enabled);
    assert_eq!(status.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn toggles_publish_new_tracks_but_config_updates_do_not() {
    let loader = TestLoader::new(StageKind::Background);
    let pipeline = pipeline_with(&[&loader]).await;
    let devices = capture(FakeMedia::Builtin);
    pipeline.attach_sources(devices.stream()).await;

    let initial = pipeline.current_output();
    let initial_video = initial.video.as_ref().unwrap().track.clone();
    let initial_audio = initial.audio.as_ref().unwrap().track.clone();

    pipeline.set_stage_enabled(StageKind::Background, true).await.unwrap();
    let blurred = pipeline.current_output();
    assert_eq!(blurred.version, initial.version + 1);
    let blurred_video = blurred.video.as_ref().unwrap().track.clone();
    assert_ne!(blurred_video.id, initial_video.id);
    assert_eq!(blurred_video.params, initial_video.params);
    assert_eq!(blurred.audio.as_ref().unwrap().track.id, initial_audio.id);

    pipeline
        .update_stage_config(
            StageKind::Background,
            PartialStageConfig::Background(PartialBackgroundConfig::image("https://example.com/office.jpg")),
        )
        .await
        .unwrap();
    assert_eq!(pipeline.current_output().version, blurred.version);

    pipeline.set_stage_enabled(StageKind::Background, false).await.unwrap();
    let plain = pipeline.current_output();
    assert!(!plain.has_effect(StageKind::Background));
    assert_ne!(plain.video.as_ref().unwrap().track.id, blurred_video.id);
}

#[tokio::test(start_paused = true)]
async fn muting_keeps_the_track_id() {
    let pipeline = MediaPipeline::new(small());
    let devices = capture(FakeMedia::Builtin);
    pipeline.attach_sources(devices.stream()).await;
    let before = pipeline.current_output();

    pipeline.set_track_enabled(TrackKind::Audio, false).await;
    let after = pipeline.current_output();
    assert_eq!(after.version, before.version + 1);
    let (was, now) = (&before.audio.as_ref().unwrap().track, &after.audio.as_ref().unwrap().track);
    assert_eq!(now.id, was.id);
    assert!(was.enabled && !now.enabled);
    assert!(!pipeline.track_enabled(TrackKind::Audio));
}

#[tokio::test(start_paused = true)]
async fn a_stage_failing_at_runtime_disables_itself() {
    let mut avatar = TestLoader::new(StageKind::Avatar);
    avatar.broken = true;
    let background = TestLoader::new(StageKind::Background);
    let pipeline = pipeline_with(&[&background, &avatar]).await;
    let devices = capture(FakeMedia::Builtin);
    pipeline.attach_sources(devices.stream()).await;
    pipeline.set_stage_enabled(StageKind::Background, true).await.unwrap();
    pipeline.set_stage_enabled(StageKind::Avatar, true).await.unwrap();

    let mut output = pipeline.subscribe_output();
    output.wait_for(|state| !state.has_effect(StageKind::Avatar)).await.unwrap();

    let status = pipeline.stage_status(StageKind::Avatar).unwrap();
    assert!(!status.enabled);
    assert!(matches!(status.last_error, Some(StageError::RuntimeError { .. })));
    assert!(pipeline.current_output().has_effect(StageKind::Background));
}

#[tokio::test(start_paused = true)]
async fn frames_leave_in_capture_order_across_toggles() {
    let loader = TestLoader::new(StageKind::Background);
    let pipeline = pipeline_with(&[&loader]).await;
    let mut devices = DeviceManager::new(Arc::new(FakeBackend::new(&FakeMedia::DualCamera, small())));
    devices.acquire(None, None).unwrap();
    pipeline.attach_sources(devices.stream()).await;
    let mut frames = pipeline.subscribe_video();

    let mut seen = Vec::new();
    while seen.len() < 30 {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(err) => panic!("video tap closed: {err}"),
        };
        match seen.len() {
            5 => pipeline.set_stage_enabled(StageKind::Background, true).await.unwrap(),
            15 => {
                let camera = devices.switch_device(TrackKind::Video, "fake-camera-1").unwrap();
                pipeline.replace_source(camera).await;
            }
            25 => pipeline.set_stage_enabled(StageKind::Background, false).await.unwrap(),
            _ => {}
        }
        seen.push(frame.seq);
    }
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "frames reordered: {seen:?}");
    assert!(pipeline.counters().video_processed >= 30);
}

#[tokio::test(start_paused = true)]
async fn avatar_type_change_reloads_the_model() {
    let loader = TestLoader::new(StageKind::Avatar);
    let pipeline = pipeline_with(&[&loader]).await;
    pipeline.set_stage_enabled(StageKind::Avatar, true).await.unwrap();

    let config = pipeline
        .update_stage_config(
            StageKind::Avatar,
            PartialStageConfig::Avatar(PartialAvatarConfig {
                avatar_type: Some(AvatarType::Robot),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    let StageConfig::Avatar(avatar) = config else {
        panic!("expected an avatar config");
    };
    assert_eq!(avatar.avatar_type, AvatarType::Robot);
    assert_eq!(loader.loads(), 2);
    let status = pipeline.stage_status(StageKind::Avatar).unwrap();
    assert!(status.enabled && status.initialized);

    // cosmetic changes reuse the loaded model
    pipeline
        .update_stage_config(
            StageKind::Avatar,
            PartialStageConfig::Avatar(PartialAvatarConfig {
                avatar_size: Some(1.4),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(loader.loads(), 2);
}

#[tokio::test]
async fn unknown_and_mismatched_stages_are_rejected() {
    let pipeline = MediaPipeline::new(small());
    assert_eq!(
        pipeline.set_stage_enabled(StageKind::Avatar, true).await,
        Err(StageError::NotAttached(StageKind::Avatar))
    );
    let err = pipeline
        .attach_stage(
            Arc::new(TestLoader::new(StageKind::Avatar)),
            StageConfig::default_for(StageKind::Background),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StageError::WrongKind {
            kind: StageKind::Background,
            expected: StageKind::Avatar
        }
    );
}
