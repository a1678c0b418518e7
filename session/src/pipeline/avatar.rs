//! Avatar overlay following a tracked face.

use super::stage::{
    StageConfig,
    StageKind,
    StageLoader,
    StageRuntime,
    VideoTransform,
};
use crate::{
    error::StageError,
    media::VideoFrame,
};
use futures::{
    future::BoxFuture,
    FutureExt as _,
};
use meshcall_config::{
    AvatarConfig,
    AvatarType,
};
use std::{
    sync::Arc,
    time::Duration,
};

/// Where the face sits in a frame, in pixels, with `scale` relative to the shorter frame side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacePose {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
}

pub trait FaceTracker: Send + 'static {
    fn locate(&mut self, frame: &VideoFrame) -> Option<FacePose>;
}

/// Locates the centroid of the brightest region.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidTracker;

impl FaceTracker for CentroidTracker {
    fn locate(&mut self, frame: &VideoFrame) -> Option<FacePose> {
        let (mut sx, mut sy, mut n) = (0f64, 0f64, 0u64);
        for y in 0..frame.height {
            for x in 0..frame.width {
                if frame.pixels[frame.pixel_index(x, y)] >= 200 {
                    sx += x as f64;
                    sy += y as f64;
                    n += 1;
                }
            }
        }
        if n == 0 {
            return None;
        }
        let area = n as f32 / (frame.width * frame.height).max(1) as f32;
        Some(FacePose {
            x: (sx / n as f64) as f32,
            y: (sy / n as f64) as f32,
            scale: area.sqrt(),
        })
    }
}

type TrackerFactory = Arc<dyn Fn() -> Box<dyn FaceTracker> + Send + Sync>;

/// Loads the face tracker together with the model of the configured avatar type.
#[derive(Clone)]
pub struct AvatarLoader {
    tracker: TrackerFactory,
    load_delay: Duration,
}

impl Default for AvatarLoader {
    fn default() -> Self {
        Self::new(|| Box::new(CentroidTracker))
    }
}

impl AvatarLoader {
    pub fn new(tracker: impl Fn() -> Box<dyn FaceTracker> + Send + Sync + 'static) -> Self {
        Self {
            tracker: Arc::new(tracker),
            load_delay: Duration::from_millis(300),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }
}

impl StageLoader for AvatarLoader {
    fn kind(&self) -> StageKind {
        StageKind::Avatar
    }

    fn load(&self, config: &StageConfig) -> BoxFuture<'static, Result<StageRuntime, StageError>> {
        let config = match config {
            StageConfig::Avatar(config) => config.clone(),
            other => {
                let kind = other.kind();
                return async move {
                    Err(StageError::WrongKind {
                        kind,
                        expected: StageKind::Avatar,
                    })
                }
                .boxed();
            }
        };
        let tracker = (self.tracker)();
        let delay = self.load_delay;
        async move {
            let model = resolve_model(&config)?;
            tokio::time::sleep(delay).await;
            debug!(%model, "avatar model ready");
            Ok(StageRuntime::Video(Box::new(AvatarTransform {
                tracker,
                model: config.avatar_type,
                pose: None,
            })))
        }
        .boxed()
    }
}

fn resolve_model(config: &AvatarConfig) -> Result<String, StageError> {
    match config.avatar_type {
        AvatarType::Custom => {
            let raw = config.custom_model_url.as_deref().unwrap_or_default();
            let url = url::Url::parse(raw).map_err(|err| StageError::LoadFailed {
                kind: StageKind::Avatar,
                reason: format!("custom model url {raw:?}: {err}"),
            })?;
            match url.scheme() {
                "http" | "https" | "file" => Ok(url.to_string()),
                scheme => Err(StageError::LoadFailed {
                    kind: StageKind::Avatar,
                    reason: format!("unsupported model scheme {scheme}"),
                }),
            }
        }
        builtin => Ok(format!("builtin:{builtin}")),
    }
}

struct AvatarTransform {
    tracker: Box<dyn FaceTracker>,
    model: AvatarType,
    pose: Option<FacePose>,
}

impl AvatarTransform {
    /// Exponential smoothing; higher smoothing follows the tracker more slowly.
    fn smooth(&mut self, observed: FacePose, smoothing: f32) -> FacePose {
        let next = match self.pose {
            None => observed,
            Some(prev) => {
                let mix = |a: f32, b: f32| a * smoothing + b * (1.0 - smoothing);
                FacePose {
                    x: mix(prev.x, observed.x),
                    y: mix(prev.y, observed.y),
                    scale: mix(prev.scale, observed.scale),
                }
            }
        };
        self.pose = Some(next);
        next
    }
}

impl VideoTransform for AvatarTransform {
    fn apply(&mut self, frame: &mut VideoFrame, config: &StageConfig) -> Result<(), StageError> {
        let StageConfig::Avatar(config) = config else {
            return Err(StageError::RuntimeError {
                kind: StageKind::Avatar,
                reason: format!("received {} config", config.kind()),
            });
        };
        if config.avatar_type != self.model {
            // model swap still in flight; keep drawing the loaded one
            trace!(loaded = %self.model, configured = %config.avatar_type, "avatar model mismatch");
        }

        let pose = match self.tracker.locate(frame) {
            Some(observed) => self.smooth(observed, config.tracking_smoothing),
            None => match self.pose {
                Some(pose) => pose,
                None => return Ok(()),
            },
        };

        let short_side = frame.width.min(frame.height) as f32;
        let radius = (pose.scale.max(0.1) * short_side * 0.6 * config.avatar_size).max(1.0);
        let [r, g, b] = config.rgb();
        // expression intensity brightens the centre of the avatar
        let highlight = (config.expression_intensity * 40.0) as u8;

        for y in 0..frame.height {
            for x in 0..frame.width {
                let (dx, dy) = (x as f32 - pose.x, y as f32 - pose.y);
                let dist = (dx * dx + dy * dy).sqrt();
                if dist > radius {
                    continue;
                }
                let lift = if config.enable_blendshapes && dist < radius / 3.0 {
                    highlight
                } else {
                    0
                };
                let i = frame.pixel_index(x, y);
                frame.pixels[i..i + 3].copy_from_slice(&[
                    r.saturating_add(lift),
                    g.saturating_add(lift),
                    b.saturating_add(lift),
                ]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_config::PartialAvatarConfig;

    struct FixedTracker(Option<FacePose>);

    impl FaceTracker for FixedTracker {
        fn locate(&mut self, _frame: &VideoFrame) -> Option<FacePose> {
            self.0
        }
    }

    fn loader(pose: Option<FacePose>) -> AvatarLoader {
        AvatarLoader::new(move || Box::new(FixedTracker(pose))).with_load_delay(Duration::ZERO)
    }

    async fn load(loader: &AvatarLoader, config: &AvatarConfig) -> Result<Box<dyn VideoTransform>, StageError> {
        match loader.load(&StageConfig::Avatar(config.clone())).await? {
            StageRuntime::Video(transform) => Ok(transform),
            StageRuntime::Audio(_) => panic!("avatar must be a video stage"),
        }
    }

    #[tokio::test]
    async fn draws_the_avatar_over_the_face() {
        let pose = FacePose {
            x: 8.0,
            y: 8.0,
            scale: 0.5,
        };
        let config = AvatarConfig::default();
        let mut transform = load(&loader(Some(pose)), &config).await.unwrap();
        let mut frame = VideoFrame::blank(0, 16, 16);
        transform
            .apply(&mut frame, &StageConfig::Avatar(config.clone()))
            .unwrap();

        let [r, _, _] = config.rgb();
        let edge = frame.pixel_index(8, 4);
        assert_eq!(frame.pixels[edge], r);
        assert_eq!(frame.pixels[frame.pixel_index(0, 0)], 0);
    }

    #[tokio::test]
    async fn nothing_is_drawn_before_a_face_was_seen() {
        let config = AvatarConfig::default();
        let mut transform = load(&loader(None), &config).await.unwrap();
        let mut frame = VideoFrame::blank(0, 8, 8);
        transform.apply(&mut frame, &StageConfig::Avatar(config)).unwrap();
        assert_eq!(frame, VideoFrame::blank(0, 8, 8));
    }

    #[tokio::test]
    async fn custom_models_need_a_loadable_url() {
        let custom = AvatarConfig::default()
            .merge(&PartialAvatarConfig {
                avatar_type: Some(AvatarType::Custom),
                custom_model_url: Some(Some("ftp://models/fox.glb".into())),
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            load(&loader(None), &custom).await,
            Err(StageError::LoadFailed { .. })
        ));
    }

    #[test]
    fn smoothing_lags_behind_the_tracker() {
        let mut transform = AvatarTransform {
            tracker: Box::new(CentroidTracker),
            model: AvatarType::Sphere,
            pose: Some(FacePose {
                x: 0.0,
                y: 0.0,
                scale: 0.5,
            }),
        };
        let pose = transform.smooth(
            FacePose {
                x: 10.0,
                y: 10.0,
                scale: 0.5,
            },
            0.8,
        );
        assert!((pose.x - 2.0).abs() < 1e-4);
    }
}
