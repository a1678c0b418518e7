//! Synthetic capture devices producing a moving test pattern and a noisy tone.

use super::{
    CaptureTrack,
    DeviceInfo,
    DeviceList,
    MediaBackend,
};
use crate::{
    error::DeviceError,
    media::{
        AudioWindow,
        CaptureFeed,
        Track,
        TrackKind,
        TrackParams,
        VideoFrame,
    },
};
use meshcall_config::{
    media::FakeMedia,
    PipelineConfig,
};
use std::{
    collections::HashSet,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{
        broadcast,
        watch,
    },
    time::MissedTickBehavior,
};
use tokio_util::sync::{
    CancellationToken,
    DropGuard,
};

#[derive(Debug, Clone)]
struct FakeCamera {
    info: DeviceInfo,
    width: u32,
    height: u32,
}

#[derive(Debug, Default)]
struct Faults {
    deny_enumeration: bool,
    denied: HashSet<TrackKind>,
    busy_elsewhere: HashSet<String>,
}

/// Capture backend with configurable synthetic devices and injectable platform failures.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    pipeline: PipelineConfig,
    cameras: Arc<Mutex<Vec<FakeCamera>>>,
    microphones: Arc<Mutex<Vec<DeviceInfo>>>,
    in_use: Arc<Mutex<HashSet<String>>>,
    faults: Arc<Mutex<Faults>>,
}

impl FakeBackend {
    pub fn new(media: &FakeMedia, pipeline: PipelineConfig) -> Self {
        let backend = Self {
            pipeline,
            cameras: Default::default(),
            microphones: Default::default(),
            in_use: Default::default(),
            faults: Default::default(),
        };
        for i in 0..media.cameras() {
            backend.add_camera(
                format!("fake-camera-{i}"),
                format!("Fake Camera {i}"),
                pipeline.frame_width,
                pipeline.frame_height,
            );
        }
        for i in 0..media.microphones() {
            backend.microphones.lock().unwrap().push(DeviceInfo {
                id: format!("fake-microphone-{i}"),
                label: format!("Fake Microphone {i}"),
                kind: TrackKind::Audio,
            });
        }
        backend
    }

    pub fn add_camera(&self, id: impl Into<String>, label: impl Into<String>, width: u32, height: u32) {
        self.cameras.lock().unwrap().push(FakeCamera {
            info: DeviceInfo {
                id: id.into(),
                label: label.into(),
                kind: TrackKind::Video,
            },
            width,
            height,
        });
    }

    pub fn deny_enumeration(&self, deny: bool) {
        self.faults.lock().unwrap().deny_enumeration = deny;
    }

    pub fn deny_permission(&self, kind: TrackKind) {
        self.faults.lock().unwrap().denied.insert(kind);
    }

    /// Marks a device as held by another application.
    pub fn occupy(&self, device_id: impl Into<String>) {
        self.faults.lock().unwrap().busy_elsewhere.insert(device_id.into());
    }

    pub fn is_open(&self, device_id: &str) -> bool {
        self.in_use.lock().unwrap().contains(device_id)
    }

    fn open_camera(&self, camera: FakeCamera, lease: Lease) -> CaptureTrack {
        let FakeCamera { info, width, height } = camera;
        let frame_rate = self.pipeline.frame_rate;
        let track = Track::new(info.label.clone(), TrackParams::video(width, height, frame_rate));
        let (tx, rx) = watch::channel(None);
        let token = lease.token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut seq = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = tx.send(Some(Arc::new(test_pattern(seq, width, height))));
                        seq += 1;
                    }
                }
            }
            trace!("fake camera stopped");
        });
        CaptureTrack::new(info.id, track, CaptureFeed::Video(rx), lease)
    }

    fn open_microphone(&self, info: DeviceInfo, lease: Lease) -> CaptureTrack {
        let PipelineConfig {
            sample_rate,
            audio_window,
            ..
        } = self.pipeline;
        let track = Track::new(info.label.clone(), TrackParams::audio(sample_rate));
        let (tx, _) = broadcast::channel(64);
        let token = lease.token.clone();
        let sender = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(
                audio_window as f64 / sample_rate.max(1) as f64,
            ));
            let mut tone = Tone::new(220.0, sample_rate as f32);
            let mut seq = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let samples = (0..audio_window).map(|_| tone.next_sample()).collect();
                        // no subscriber yet is fine
                        let _ = sender.send(Arc::new(AudioWindow { seq, samples }));
                        seq += 1;
                    }
                }
            }
            trace!("fake microphone stopped");
        });
        CaptureTrack::new(info.id, track, CaptureFeed::Audio(tx), lease)
    }
}

impl MediaBackend for FakeBackend {
    fn enumerate(&self) -> Result<DeviceList, DeviceError> {
        if self.faults.lock().unwrap().deny_enumeration {
            return Err(DeviceError::EnumerationDenied);
        }
        Ok(DeviceList {
            cameras: self.cameras.lock().unwrap().iter().map(|c| c.info.clone()).collect(),
            microphones: self.microphones.lock().unwrap().clone(),
        })
    }

    fn open(&self, kind: TrackKind, device_id: &str) -> Result<CaptureTrack, DeviceError> {
        {
            let faults = self.faults.lock().unwrap();
            if faults.denied.contains(&kind) {
                return Err(DeviceError::PermissionDenied(kind));
            }
            if faults.busy_elsewhere.contains(device_id) {
                return Err(DeviceError::DeviceInUse {
                    kind,
                    id: device_id.to_string(),
                });
            }
        }

        let not_found = || DeviceError::DeviceNotFound {
            kind,
            id: device_id.to_string(),
        };

        match kind {
            TrackKind::Video => {
                let camera = self
                    .cameras
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|c| c.info.id == device_id)
                    .cloned()
                    .ok_or_else(not_found)?;
                let lease = Lease::take(&self.in_use, kind, device_id)?;
                Ok(self.open_camera(camera, lease))
            }
            TrackKind::Audio => {
                let microphone = self
                    .microphones
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|m| m.id == device_id)
                    .cloned()
                    .ok_or_else(not_found)?;
                let lease = Lease::take(&self.in_use, kind, device_id)?;
                Ok(self.open_microphone(microphone, lease))
            }
        }
    }
}

/// Exclusive hold on a fake device; stops its generator and frees the device on drop.
struct Lease {
    id: String,
    in_use: Arc<Mutex<HashSet<String>>>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl Lease {
    fn take(in_use: &Arc<Mutex<HashSet<String>>>, kind: TrackKind, id: &str) -> Result<Self, DeviceError> {
        if !in_use.lock().unwrap().insert(id.to_string()) {
            return Err(DeviceError::DeviceInUse {
                kind,
                id: id.to_string(),
            });
        }
        let token = CancellationToken::new();
        Ok(Self {
            id: id.to_string(),
            in_use: in_use.clone(),
            _guard: token.clone().drop_guard(),
            token,
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_use.lock().unwrap().remove(&self.id);
    }
}

/// Horizontal gradient with a bright square orbiting the centre, standing in for a face.
fn test_pattern(seq: u64, width: u32, height: u32) -> VideoFrame {
    let mut frame = VideoFrame::blank(seq, width, height);
    let angle = seq as f32 * 0.1;
    let side = (width.min(height) / 4).max(1);
    let cx = (width as f32 / 2.0 + angle.cos() * width as f32 / 6.0) as u32;
    let cy = (height as f32 / 2.0 + angle.sin() * height as f32 / 6.0) as u32;
    for y in 0..height {
        for x in 0..width {
            let i = frame.pixel_index(x, y);
            let inside = x.abs_diff(cx) < side / 2 && y.abs_diff(cy) < side / 2;
            let shade = if inside { 230 } else { (x * 160 / width.max(1)) as u8 };
            frame.pixels[i..i + 4].copy_from_slice(&[shade, shade, shade.saturating_add(20), 255]);
        }
    }
    frame
}

struct Tone {
    phase: f32,
    step: f32,
    noise: u32,
}

impl Tone {
    fn new(frequency: f32, sample_rate: f32) -> Self {
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * frequency / sample_rate.max(1.0),
            noise: 0x2545_F491,
        }
    }

    fn next_sample(&mut self) -> f32 {
        self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        // xorshift
        self.noise ^= self.noise << 13;
        self.noise ^= self.noise >> 17;
        self.noise ^= self.noise << 5;
        let noise = (self.noise as f32 / u32::MAX as f32) * 2.0 - 1.0;
        0.3 * self.phase.sin() + 0.02 * noise
    }
}
