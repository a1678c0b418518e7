#[macro_use]
extern crate tracing;

mod app_config;
mod args;
mod connection_config;
pub mod media;
mod participant_config;
mod stage_config;

use crate::media::FakeMedia;
use app_config::AppConfig;
pub use app_config::{
    get_config_dir,
    get_data_dir,
};
pub use args::{
    Args,
    Command,
};
use color_eyre::Result;
pub use connection_config::{
    ConnectionConfig,
    PipelineConfig,
};
use eyre::Context as _;
pub use participant_config::{
    generate_peer_id,
    ParticipantConfig,
};
use serde::{
    Deserialize,
    Serialize,
};
pub use stage_config::{
    parse_hex_colour,
    AudioConfig,
    AvatarConfig,
    AvatarType,
    AvatarTypeIter,
    BackgroundConfig,
    InvalidConfig,
    PartialAudioConfig,
    PartialAvatarConfig,
    PartialBackgroundConfig,
};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten, skip_serializing)]
    pub app_config: AppConfig,
    pub room_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_url: Option<url::Url>,
    #[serde(default)]
    pub fake_media: FakeMedia,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub avatar: AvatarConfig,
}

const DEFAULT_CONFIG: &str = include_str!("default-config.yaml");

impl Default for Config {
    fn default() -> Self {
        serde_yml::from_str(DEFAULT_CONFIG).expect("Failed to parse default config")
    }
}

impl Config {
    pub fn new(args: Args) -> Result<Self, config::ConfigError> {
        let data_dir = get_data_dir();
        let config_dir = get_config_dir();
        let mut builder = config::Config::builder()
            .set_default("data_dir", data_dir.to_string_lossy().to_string())?
            .set_default("config_dir", config_dir.to_string_lossy().to_string())?;

        builder = builder.add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Yaml));

        let config_files = [("config.yaml", config::FileFormat::Yaml)];

        for (file, format) in &config_files {
            let source = config::File::from(config_dir.join(file))
                .format(*format)
                .required(false);
            builder = builder.add_source(source);
        }

        builder = builder.add_source(args);

        let cfg: Self = builder.build()?.try_deserialize()?;

        Ok(cfg)
    }

    /// Rejects stage settings outside their recognised ranges before anything is started with them.
    pub fn validate(&self) -> Result<()> {
        self.audio.validate().context("invalid audio config")?;
        self.avatar.validate().context("invalid avatar config")?;
        if self.pipeline.frame_rate == 0 || self.pipeline.audio_window == 0 {
            eyre::bail!("pipeline frame_rate and audio_window must be non-zero");
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.app_config.data_dir
    }

    pub fn save(&self) -> Result<()> {
        // Only save the parts that have changed from the default.
        let default = Self::default();
        let mut clone = self.clone();

        if self.peer_id == default.peer_id {
            clone.peer_id = None;
        }
        if self.signaling_url == default.signaling_url {
            clone.signaling_url = None;
        }

        std::fs::create_dir_all(&self.app_config.config_dir).context("Failed to create config directory")?;
        let path = self.app_config.config_dir.join("config.yaml");
        let content = serde_yml::to_string(&clone).context("Failed to serialize config")?;
        std::fs::write(&path, content).wrap_err_with(|| format!("Failed to write config to {:?}", path))
    }

    /// Updates the configuration based on optional command-line arguments.
    /// Saves the configuration if any changes were made.
    ///
    /// # Errors
    /// Returns an error if saving the updated configuration fails.
    #[instrument(level = "debug", skip(self, args))]
    pub fn update_from_args(&mut self, args: &Args) -> Result<()> {
        let mut changed = false;
        if let Some(room) = &args.room {
            if &self.room_code != room {
                info!(old = %self.room_code, new = %room, "Updating room from args");
                self.room_code = room.clone();
                changed = true;
            }
        }

        if let Some(url) = &args.signaling_url {
            if self.signaling_url.as_ref() != Some(url) {
                info!(old = ?self.signaling_url, new = %url, "Updating signaling URL from args");
                self.signaling_url = Some(url.clone());
                changed = true;
            }
        }

        if changed {
            debug!("Configuration updated from command-line arguments, saving...");
            self.save()?;
        } else {
            debug!("No configuration changes from command-line arguments.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn embedded_defaults_match_record_defaults() {
        let config = Config::default();
        assert_eq!(config.room_code, "lobby");
        assert_eq!(config.fake_media, FakeMedia::Builtin);
        assert_eq!(config.connection, ConnectionConfig::default());
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.audio, AudioConfig::default());
        assert_eq!(config.avatar, AvatarConfig::default());
        assert!(!config.background.has_effect());
        config.validate().unwrap();
    }

    #[test]
    fn participant_identity_falls_back_to_a_generated_id() {
        let mut config = Config::default();
        let generated = ParticipantConfig::new(&config).unwrap();
        assert!(!generated.peer_id.is_empty());
        assert_eq!(generated.room_code, "lobby");

        config.peer_id = Some(" alice ".into());
        assert_eq!(ParticipantConfig::new(&config).unwrap().peer_id, "alice");

        config.room_code = "  ".into();
        assert!(ParticipantConfig::new(&config).is_err());
    }
}
