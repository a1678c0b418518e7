//! The contract every transform stage fulfils, and the per-kind configuration it runs with.

use crate::{
    error::StageError,
    media::{
        TrackKind,
        VideoFrame,
    },
};
use futures::future::BoxFuture;
use meshcall_config::{
    AudioConfig,
    AvatarConfig,
    BackgroundConfig,
    PartialAudioConfig,
    PartialAvatarConfig,
    PartialBackgroundConfig,
};
use serde::{
    Deserialize,
    Serialize,
};
use strum::{
    Display,
    EnumIter,
    EnumString,
};

#[derive(
    Debug, Clone, Copy, Display, EnumString, EnumIter, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum StageKind {
    Background,
    Avatar,
    AudioDenoise,
}

impl StageKind {
    /// Video stages in the order they are applied to a frame.
    pub const VIDEO_ORDER: [StageKind; 2] = [StageKind::Background, StageKind::Avatar];

    pub fn track_kind(&self) -> TrackKind {
        match self {
            StageKind::Background | StageKind::Avatar => TrackKind::Video,
            StageKind::AudioDenoise => TrackKind::Audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StageConfig {
    Background(BackgroundConfig),
    Avatar(AvatarConfig),
    AudioDenoise(AudioConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PartialStageConfig {
    Background(PartialBackgroundConfig),
    Avatar(PartialAvatarConfig),
    AudioDenoise(PartialAudioConfig),
}

impl PartialStageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            PartialStageConfig::Background(_) => StageKind::Background,
            PartialStageConfig::Avatar(_) => StageKind::Avatar,
            PartialStageConfig::AudioDenoise(_) => StageKind::AudioDenoise,
        }
    }
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            StageConfig::Background(_) => StageKind::Background,
            StageConfig::Avatar(_) => StageKind::Avatar,
            StageConfig::AudioDenoise(_) => StageKind::AudioDenoise,
        }
    }

    pub fn default_for(kind: StageKind) -> Self {
        match kind {
            StageKind::Background => StageConfig::Background(Default::default()),
            StageKind::Avatar => StageConfig::Avatar(Default::default()),
            StageKind::AudioDenoise => StageConfig::AudioDenoise(Default::default()),
        }
    }

    /// Produces the next config; `self` is left as it was.
    pub fn merge(&self, partial: &PartialStageConfig) -> Result<Self, StageError> {
        let merged = match (self, partial) {
            (StageConfig::Background(config), PartialStageConfig::Background(partial)) => {
                StageConfig::Background(config.merge(partial)?)
            }
            (StageConfig::Avatar(config), PartialStageConfig::Avatar(partial)) => {
                StageConfig::Avatar(config.merge(partial)?)
            }
            (StageConfig::AudioDenoise(config), PartialStageConfig::AudioDenoise(partial)) => {
                StageConfig::AudioDenoise(config.merge(partial)?)
            }
            (config, partial) => {
                return Err(StageError::WrongKind {
                    kind: partial.kind(),
                    expected: config.kind(),
                })
            }
        };
        Ok(merged)
    }

    /// Whether moving from `self` to `next` invalidates an already loaded model.
    pub fn needs_reload(&self, next: &StageConfig) -> bool {
        match (self, next) {
            (StageConfig::Avatar(current), StageConfig::Avatar(next)) => {
                current.avatar_type != next.avatar_type || current.custom_model_url != next.custom_model_url
            }
            _ => false,
        }
    }

    pub fn audio(&self) -> Option<&AudioConfig> {
        match self {
            StageConfig::AudioDenoise(config) => Some(config),
            _ => None,
        }
    }
}

/// A loaded video model. Called once per frame from the video loop, never concurrently with itself.
pub trait VideoTransform: Send + 'static {
    fn apply(&mut self, frame: &mut VideoFrame, config: &StageConfig) -> Result<(), StageError>;
}

/// A loaded audio graph node. Called once per fixed-size window from the audio loop.
pub trait AudioTransform: Send + 'static {
    fn process(&mut self, samples: &mut [f32], config: &AudioConfig) -> Result<(), StageError>;
}

pub enum StageRuntime {
    Video(Box<dyn VideoTransform>),
    Audio(Box<dyn AudioTransform>),
}

impl StageRuntime {
    pub fn track_kind(&self) -> TrackKind {
        match self {
            StageRuntime::Video(_) => TrackKind::Video,
            StageRuntime::Audio(_) => TrackKind::Audio,
        }
    }
}

impl std::fmt::Debug for StageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StageRuntime::{}", self.track_kind())
    }
}

/// Loads the resources of one stage kind. The returned future is polled at most once per load and may be
/// dropped mid-way when the load is cancelled.
pub trait StageLoader: Send + Sync + 'static {
    fn kind(&self) -> StageKind;

    fn load(&self, config: &StageConfig) -> BoxFuture<'static, Result<StageRuntime, StageError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_config::AvatarType;
    use pretty_assertions::assert_eq;

    #[test]
    fn merge_rejects_a_partial_for_another_stage() {
        let config = StageConfig::default_for(StageKind::Background);
        let err = config
            .merge(&PartialStageConfig::AudioDenoise(Default::default()))
            .unwrap_err();
        assert_eq!(
            err,
            StageError::WrongKind {
                kind: StageKind::AudioDenoise,
                expected: StageKind::Background
            }
        );
    }

    #[test]
    fn only_model_identity_changes_need_a_reload() {
        let config = StageConfig::default_for(StageKind::Avatar);
        let resized = config
            .merge(&PartialStageConfig::Avatar(PartialAvatarConfig {
                avatar_size: Some(1.5),
                ..Default::default()
            }))
            .unwrap();
        assert!(!config.needs_reload(&resized));

        let robot = config
            .merge(&PartialStageConfig::Avatar(PartialAvatarConfig {
                avatar_type: Some(AvatarType::Robot),
                ..Default::default()
            }))
            .unwrap();
        assert!(config.needs_reload(&robot));
    }

    #[test]
    fn partials_deserialize_from_tagged_json() {
        let partial: PartialStageConfig =
            serde_json::from_str(r#"{"kind":"background","useBlur":null,"backgroundImageUrl":null}"#).unwrap();
        assert_eq!(
            partial,
            PartialStageConfig::Background(PartialBackgroundConfig {
                use_blur: None,
                background_image_url: Some(None),
            })
        );
        assert_eq!("audioDenoise".parse::<StageKind>().unwrap(), StageKind::AudioDenoise);
    }
}
