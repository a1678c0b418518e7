//! Per-stage configuration records.
//!
//! Every record is immutable from the outside: changes go through `merge`, which takes a partial record,
//! validates the result against the recognised option ranges and hands back a new value.

use serde::{
    Deserialize,
    Deserializer,
    Serialize,
};
use strum::{
    Display,
    EnumIter,
    EnumString,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidConfig {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f32,
        max: f32,
        value: f32,
    },
    #[error("{field} must be a #RRGGBB colour, got {value:?}")]
    Colour { field: &'static str, value: String },
    #[error("backgroundImageUrl must not be empty")]
    EmptyImageUrl,
    #[error("avatarType custom requires a customModelUrl")]
    MissingCustomModel,
}

fn check_range(field: &'static str, value: f32, min: f32, max: f32) -> Result<(), InvalidConfig> {
    if value.is_nan() || value < min || value > max {
        return Err(InvalidConfig::OutOfRange { field, min, max, value });
    }
    Ok(())
}

/// Distinguishes "field absent" (`None`) from "field explicitly null" (`Some(None)`) in partial records.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// Background

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundConfig {
    #[serde(default)]
    pub use_blur: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image_url: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialBackgroundConfig {
    #[serde(default)]
    pub use_blur: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub background_image_url: Option<Option<String>>,
}

impl PartialBackgroundConfig {
    pub fn blur() -> Self {
        Self {
            use_blur: Some(true),
            background_image_url: Some(None),
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self {
            use_blur: Some(false),
            background_image_url: Some(Some(url.into())),
        }
    }
}

impl BackgroundConfig {
    /// Blur and image replacement are mutually exclusive: whichever the partial turns on wins and clears the other.
    pub fn merge(&self, partial: &PartialBackgroundConfig) -> Result<Self, InvalidConfig> {
        let mut next = self.clone();
        if let Some(url) = &partial.background_image_url {
            next.background_image_url = url.clone();
        }
        if let Some(use_blur) = partial.use_blur {
            next.use_blur = use_blur;
        }

        if let Some(url) = &next.background_image_url {
            if url.trim().is_empty() {
                return Err(InvalidConfig::EmptyImageUrl);
            }
        }

        match (partial.use_blur, &partial.background_image_url) {
            (Some(true), _) => next.background_image_url = None,
            (_, Some(Some(_))) => next.use_blur = false,
            _ => {}
        }

        Ok(next)
    }

    /// Whether the stage would change a frame at all with this config.
    pub fn has_effect(&self) -> bool {
        self.use_blur || self.background_image_url.is_some()
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// Audio

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub noise_threshold: f32,
    pub gain_smoothing_factor: f32,
    pub spectral_gate_threshold: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            noise_threshold: 0.1,
            gain_smoothing_factor: 0.9,
            spectral_gate_threshold: 0.1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialAudioConfig {
    #[serde(default)]
    pub noise_threshold: Option<f32>,
    #[serde(default)]
    pub gain_smoothing_factor: Option<f32>,
    #[serde(default)]
    pub spectral_gate_threshold: Option<f32>,
}

impl AudioConfig {
    pub fn merge(&self, partial: &PartialAudioConfig) -> Result<Self, InvalidConfig> {
        let next = Self {
            noise_threshold: partial.noise_threshold.unwrap_or(self.noise_threshold),
            gain_smoothing_factor: partial.gain_smoothing_factor.unwrap_or(self.gain_smoothing_factor),
            spectral_gate_threshold: partial.spectral_gate_threshold.unwrap_or(self.spectral_gate_threshold),
        };
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        check_range("noiseThreshold", self.noise_threshold, 0.0, 1.0)?;
        check_range("gainSmoothingFactor", self.gain_smoothing_factor, 0.0, 1.0)?;
        check_range("spectralGateThreshold", self.spectral_gate_threshold, 0.0, 0.5)
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// Avatar

#[derive(Debug, Default, Clone, Copy, Display, EnumIter, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AvatarType {
    Raccoon,
    Robot,
    Alien,
    Cat,
    Custom,
    #[default]
    Sphere,
    Cube,
    Ring,
    Triangle,
}

impl AvatarType {
    /// Colour used when switching to this avatar type without an explicit colour.
    pub fn default_colour(&self) -> &'static str {
        match self {
            AvatarType::Sphere => "#4F46E5",
            AvatarType::Cube => "#10B981",
            AvatarType::Ring => "#8B5CF6",
            AvatarType::Triangle => "#F59E0B",
            _ => "#4F46E5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarConfig {
    pub avatar_type: AvatarType,
    pub avatar_color: String,
    pub avatar_size: f32,
    pub tracking_smoothing: f32,
    pub expression_intensity: f32,
    #[serde(default = "default_true")]
    pub enable_blendshapes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_model_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            avatar_type: AvatarType::default(),
            avatar_color: AvatarType::default().default_colour().to_string(),
            avatar_size: 1.0,
            tracking_smoothing: 0.8,
            expression_intensity: 1.0,
            enable_blendshapes: true,
            custom_model_url: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialAvatarConfig {
    #[serde(default)]
    pub avatar_type: Option<AvatarType>,
    #[serde(default)]
    pub avatar_color: Option<String>,
    #[serde(default)]
    pub avatar_size: Option<f32>,
    #[serde(default)]
    pub tracking_smoothing: Option<f32>,
    #[serde(default)]
    pub expression_intensity: Option<f32>,
    #[serde(default)]
    pub enable_blendshapes: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub custom_model_url: Option<Option<String>>,
}

impl AvatarConfig {
    pub fn merge(&self, partial: &PartialAvatarConfig) -> Result<Self, InvalidConfig> {
        let mut next = self.clone();
        if let Some(avatar_type) = partial.avatar_type {
            next.avatar_type = avatar_type;
            if partial.avatar_color.is_none() && avatar_type != self.avatar_type {
                next.avatar_color = avatar_type.default_colour().to_string();
            }
        }
        if let Some(colour) = &partial.avatar_color {
            next.avatar_color = colour.clone();
        }
        if let Some(size) = partial.avatar_size {
            next.avatar_size = size;
        }
        if let Some(smoothing) = partial.tracking_smoothing {
            next.tracking_smoothing = smoothing;
        }
        if let Some(intensity) = partial.expression_intensity {
            next.expression_intensity = intensity;
        }
        if let Some(blendshapes) = partial.enable_blendshapes {
            next.enable_blendshapes = blendshapes;
        }
        if let Some(url) = &partial.custom_model_url {
            next.custom_model_url = url.clone();
        }
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        parse_hex_colour(&self.avatar_color).ok_or_else(|| InvalidConfig::Colour {
            field: "avatarColor",
            value: self.avatar_color.clone(),
        })?;
        check_range("avatarSize", self.avatar_size, f32::MIN_POSITIVE, 10.0)?;
        check_range("trackingSmoothing", self.tracking_smoothing, 0.0, 1.0)?;
        check_range("expressionIntensity", self.expression_intensity, 0.0, 2.0)?;
        if self.avatar_type == AvatarType::Custom && self.custom_model_url.is_none() {
            return Err(InvalidConfig::MissingCustomModel);
        }
        Ok(())
    }

    pub fn rgb(&self) -> [u8; 3] {
        parse_hex_colour(&self.avatar_color).unwrap_or([0x4F, 0x46, 0xE5])
    }
}

pub fn parse_hex_colour(value: &str) -> Option<[u8; 3]> {
    let hex = value.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blur_and_image_are_mutually_exclusive() {
        let config = BackgroundConfig::default();

        let blurred = config.merge(&PartialBackgroundConfig::blur()).unwrap();
        assert!(blurred.use_blur);
        assert_eq!(blurred.background_image_url, None);

        let image = blurred.merge(&PartialBackgroundConfig::image("https://example.com/beach.jpg")).unwrap();
        assert!(!image.use_blur);
        assert_eq!(image.background_image_url.as_deref(), Some("https://example.com/beach.jpg"));

        let blurred_again = image
            .merge(&PartialBackgroundConfig {
                use_blur: Some(true),
                background_image_url: None,
            })
            .unwrap();
        assert!(blurred_again.use_blur);
        assert_eq!(blurred_again.background_image_url, None);

        // the source record is untouched
        assert!(!config.has_effect());
    }

    #[test]
    fn explicit_null_clears_the_image() {
        let partial: PartialBackgroundConfig = serde_json::from_str(r#"{"backgroundImageUrl": null}"#).unwrap();
        assert_eq!(partial.background_image_url, Some(None));

        let absent: PartialBackgroundConfig = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(absent.background_image_url, None);

        let image = BackgroundConfig::default()
            .merge(&PartialBackgroundConfig::image("bg.png"))
            .unwrap();
        assert_eq!(image.merge(&absent).unwrap(), image);
        assert!(!image.merge(&partial).unwrap().has_effect());
    }

    #[test]
    fn audio_ranges_are_enforced() {
        let config = AudioConfig::default();
        let err = config
            .merge(&PartialAudioConfig {
                spectral_gate_threshold: Some(0.7),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            InvalidConfig::OutOfRange {
                field: "spectralGateThreshold",
                ..
            }
        ));

        let tuned = config
            .merge(&PartialAudioConfig {
                noise_threshold: Some(0.35),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tuned.noise_threshold, 0.35);
        assert_eq!(tuned.gain_smoothing_factor, config.gain_smoothing_factor);
    }

    #[test]
    fn switching_avatar_type_picks_its_colour() {
        let config = AvatarConfig::default();
        let cube = config
            .merge(&PartialAvatarConfig {
                avatar_type: Some(AvatarType::Cube),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cube.avatar_color, "#10B981");
        assert_eq!(cube.rgb(), [0x10, 0xB9, 0x81]);

        let err = config
            .merge(&PartialAvatarConfig {
                avatar_type: Some(AvatarType::Custom),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, InvalidConfig::MissingCustomModel);

        assert!(config
            .merge(&PartialAvatarConfig {
                avatar_color: Some("blue".into()),
                ..Default::default()
            })
            .is_err());
    }
}
