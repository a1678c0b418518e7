//! Tracks and the raw media units flowing through them.

use crate::{
    id::TrackId,
    pipeline::StageKind,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::sync::Arc;
use strum::{
    Display,
    EnumString,
};
use tokio::sync::{
    broadcast,
    watch,
};

#[derive(Debug, Clone, Copy, Display, EnumString, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TrackParams {
    Video {
        codec: String,
        width: u32,
        height: u32,
        frame_rate: u32,
    },
    Audio {
        codec: String,
        sample_rate: u32,
        channels: u16,
    },
}

impl TrackParams {
    pub fn video(width: u32, height: u32, frame_rate: u32) -> Self {
        Self::Video {
            codec: "VP8".into(),
            width,
            height,
            frame_rate,
        }
    }

    pub fn audio(sample_rate: u32) -> Self {
        Self::Audio {
            codec: "opus".into(),
            sample_rate,
            channels: 1,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            TrackParams::Video { .. } => TrackKind::Video,
            TrackParams::Audio { .. } => TrackKind::Audio,
        }
    }
}

/// Description of a media track, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub label: String,
    pub params: TrackParams,
    pub enabled: bool,
}

impl Track {
    pub fn new(label: impl Into<String>, params: TrackParams) -> Self {
        Self {
            id: TrackId::new(),
            label: label.into(),
            params,
            enabled: true,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.params.kind()
    }
}

/// An RGBA frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Stages that transformed this frame, in application order.
    pub applied: Vec<StageKind>,
}

impl VideoFrame {
    pub fn blank(seq: u64, width: u32, height: u32) -> Self {
        Self {
            seq,
            width,
            height,
            pixels: vec![0; (width * height * 4) as usize],
            applied: Vec::new(),
        }
    }

    pub fn pixel_index(&self, x: u32, y: u32) -> usize {
        ((y * self.width + x) * 4) as usize
    }
}

/// A fixed-size window of mono samples in `-1.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioWindow {
    pub seq: u64,
    pub samples: Vec<f32>,
}

/// Where the raw capture of a device can be read from. Video keeps only the latest frame; audio keeps every window.
#[derive(Debug, Clone)]
pub enum CaptureFeed {
    Video(watch::Receiver<Option<Arc<VideoFrame>>>),
    Audio(broadcast::Sender<Arc<AudioWindow>>),
}

/// Processed media leaving the pipeline, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub enum MediaTap {
    Video(broadcast::Sender<Arc<VideoFrame>>),
    Audio(broadcast::Sender<Arc<AudioWindow>>),
}

impl MediaTap {
    pub fn subscribers(&self) -> usize {
        match self {
            MediaTap::Video(tx) => tx.receiver_count(),
            MediaTap::Audio(tx) => tx.receiver_count(),
        }
    }
}

/// An outgoing track together with the tap its media is read from.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub track: Track,
    pub tap: MediaTap,
}

impl LocalTrack {
    pub fn kind(&self) -> TrackKind {
        self.track.kind()
    }
}
