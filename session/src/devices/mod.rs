//! Camera and microphone selection. The device manager is the only owner of raw capture.

mod fake;

use crate::{
    error::DeviceError,
    media::{
        CaptureFeed,
        Track,
        TrackKind,
    },
};
pub use fake::FakeBackend;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    any::Any,
    sync::Arc,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: TrackKind,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    pub cameras: Vec<DeviceInfo>,
    pub microphones: Vec<DeviceInfo>,
}

impl DeviceList {
    pub fn of_kind(&self, kind: TrackKind) -> &[DeviceInfo] {
        match kind {
            TrackKind::Video => &self.cameras,
            TrackKind::Audio => &self.microphones,
        }
    }
}

/// An open capture device. Dropping it releases the device.
pub struct CaptureTrack {
    pub device_id: String,
    pub track: Track,
    pub feed: CaptureFeed,
    _lease: Box<dyn Any + Send + Sync>,
}

impl CaptureTrack {
    pub fn new(device_id: impl Into<String>, track: Track, feed: CaptureFeed, lease: impl Any + Send + Sync) -> Self {
        Self {
            device_id: device_id.into(),
            track,
            feed,
            _lease: Box::new(lease),
        }
    }
}

impl std::fmt::Debug for CaptureTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureTrack")
            .field("device_id", &self.device_id)
            .field("track", &self.track)
            .finish_non_exhaustive()
    }
}

/// The platform side of capture: enumeration and opening devices.
pub trait MediaBackend: Send + Sync + 'static {
    fn enumerate(&self) -> Result<DeviceList, DeviceError>;

    fn open(&self, kind: TrackKind, device_id: &str) -> Result<CaptureTrack, DeviceError>;
}

/// The raw local capture, at most one track per kind.
#[derive(Debug, Default)]
pub struct RawStream {
    pub video: Option<CaptureTrack>,
    pub audio: Option<CaptureTrack>,
}

impl RawStream {
    pub fn get(&self, kind: TrackKind) -> Option<&CaptureTrack> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    fn slot(&mut self, kind: TrackKind) -> &mut Option<CaptureTrack> {
        match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelectedDevices {
    pub camera: Option<String>,
    pub microphone: Option<String>,
}

pub struct DeviceManager {
    backend: Arc<dyn MediaBackend>,
    selected: SelectedDevices,
    stream: RawStream,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            selected: Default::default(),
            stream: Default::default(),
        }
    }

    pub fn list_devices(&self) -> Result<DeviceList, DeviceError> {
        self.backend.enumerate()
    }

    pub fn selected(&self) -> &SelectedDevices {
        &self.selected
    }

    pub fn stream(&self) -> &RawStream {
        &self.stream
    }

    /// Opens the requested devices, falling back to the first available device of each kind when no id is given.
    /// Anything acquired before is released first. A kind with no devices at all is simply absent from the stream; an
    /// explicitly requested device that cannot be opened fails the whole acquisition and leaves nothing open.
    #[instrument(level = "debug", skip(self))]
    pub fn acquire(&mut self, camera_id: Option<&str>, mic_id: Option<&str>) -> Result<&RawStream, DeviceError> {
        self.release();
        let devices = self.backend.enumerate()?;

        let mut stream = RawStream::default();
        for (kind, requested) in [(TrackKind::Video, camera_id), (TrackKind::Audio, mic_id)] {
            let id = match requested {
                Some(id) => Some(id.to_string()),
                None => devices.of_kind(kind).first().map(|device| device.id.clone()),
            };
            let Some(id) = id else {
                debug!(%kind, "no device available");
                continue;
            };
            let capture = self.backend.open(kind, &id)?;
            *stream.slot(kind) = Some(capture);
        }

        self.selected = SelectedDevices {
            camera: stream.video.as_ref().map(|c| c.device_id.clone()),
            microphone: stream.audio.as_ref().map(|c| c.device_id.clone()),
        };
        self.stream = stream;
        info!(selected = ?self.selected, "acquired capture devices");
        Ok(&self.stream)
    }

    /// Opens `new_id` and swaps it in for the current device of `kind`; the other kind is left untouched.
    /// The previous device is only released once the new one is open, so there is never a gap with no track.
    #[instrument(level = "debug", skip(self))]
    pub fn switch_device(&mut self, kind: TrackKind, new_id: &str) -> Result<&CaptureTrack, DeviceError> {
        if self.stream.get(kind).is_some_and(|current| current.device_id == new_id) {
            debug!("device already selected");
        } else {
            let opened = self.backend.open(kind, new_id)?;
            let previous = self.stream.slot(kind).replace(opened);
            drop(previous);
            match kind {
                TrackKind::Video => self.selected.camera = Some(new_id.to_string()),
                TrackKind::Audio => self.selected.microphone = Some(new_id.to_string()),
            }
            info!(%kind, device = new_id, "switched capture device");
        }

        self.stream.get(kind).ok_or_else(|| DeviceError::DeviceNotFound {
            kind,
            id: new_id.to_string(),
        })
    }

    pub fn release(&mut self) {
        if !self.stream.is_empty() {
            debug!("releasing capture devices");
        }
        self.stream = RawStream::default();
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("selected", &self.selected)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
