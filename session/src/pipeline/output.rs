use super::StageKind;
use crate::media::{
    LocalTrack,
    TrackKind,
};
use serde::Serialize;
use std::sync::atomic::{
    AtomicU64,
    Ordering,
};

/// The current outgoing stream. A new value is published whenever the set of outgoing tracks changes; consumers
/// only ever hold the `Arc` of a complete value.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMediaState {
    pub version: u64,
    pub video: Option<LocalTrack>,
    pub audio: Option<LocalTrack>,
    /// Stages currently shaping the output, video stages in application order followed by audio stages.
    pub effects: Vec<StageKind>,
}

impl OutgoingMediaState {
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.video.iter().chain(self.audio.iter()).cloned().collect()
    }

    pub fn has_effect(&self, kind: StageKind) -> bool {
        self.effects.contains(&kind)
    }
}

#[derive(Debug, Default)]
pub(super) struct FrameStats {
    pub video_processed: AtomicU64,
    pub video_dropped: AtomicU64,
    pub audio_processed: AtomicU64,
    pub audio_dropped: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameCounters {
    pub video_processed: u64,
    /// Captured frames never processed because a newer frame had already arrived.
    pub video_dropped: u64,
    pub audio_processed: u64,
    pub audio_dropped: u64,
}

impl FrameStats {
    pub fn snapshot(&self) -> FrameCounters {
        FrameCounters {
            video_processed: self.video_processed.load(Ordering::Relaxed),
            video_dropped: self.video_dropped.load(Ordering::Relaxed),
            audio_processed: self.audio_processed.load(Ordering::Relaxed),
            audio_dropped: self.audio_dropped.load(Ordering::Relaxed),
        }
    }
}
