//! Background blur and replacement around a segmented foreground.

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
use std::{
    hash::{
        DefaultHasher,
        Hash,
        Hasher,
    },
    sync::Arc,
    time::Duration,
};

/// Produces a per-pixel foreground probability in `0.0..=1.0`, row-major, one entry per pixel.
pub trait Segmenter: Send + 'static {
    fn segment(&mut self, frame: &VideoFrame) -> Vec<f32>;
}

/// Treats bright pixels as the person in front of the camera.
#[derive(Debug, Clone, Copy)]
pub struct LumaSegmenter {
    pub threshold: u8,
}

impl Default for LumaSegmenter {
    fn default() -> Self {
        Self { threshold: 200 }
    }
}

impl Segmenter for LumaSegmenter {
    fn segment(&mut self, frame: &VideoFrame) -> Vec<f32> {
        frame
            .pixels
            .chunks_exact(4)
            .map(|px| {
                let luma = (px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000;
                if luma as u8 >= self.threshold {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }
}

type SegmenterFactory = Arc<dyn Fn() -> Box<dyn Segmenter> + Send + Sync>;

/// Loads the segmentation model. The load delay stands in for fetching model weights.
#[derive(Clone)]
pub struct BackgroundLoader {
    segmenter: SegmenterFactory,
    load_delay: Duration,
}

impl Default for BackgroundLoader {
    fn default() -> Self {
        Self::new(|| Box::new(LumaSegmenter::default()))
    }
}

impl BackgroundLoader {
    pub fn new(segmenter: impl Fn() -> Box<dyn Segmenter> + Send + Sync + 'static) -> Self {
        Self {
            segmenter: Arc::new(segmenter),
            load_delay: Duration::from_millis(200),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }
}

impl StageLoader for BackgroundLoader {
    fn kind(&self) -> StageKind {
        StageKind::Background
    }

    fn load(&self, _config: &StageConfig) -> BoxFuture<'static, Result<StageRuntime, StageError>> {
        let segmenter = (self.segmenter)();
        let delay = self.load_delay;
        async move {
            tokio::time::sleep(delay).await;
            debug!("segmentation model ready");
            Ok(StageRuntime::Video(Box::new(BackgroundTransform {
                segmenter,
                backdrop: None,
            })))
        }
        .boxed()
    }
}

struct Backdrop {
    url: String,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

struct BackgroundTransform {
    segmenter: Box<dyn Segmenter>,
    backdrop: Option<Backdrop>,
}

const BLUR_RADIUS: i64 = 4;

impl BackgroundTransform {
    fn backdrop(&mut self, url: &str, width: u32, height: u32) -> &[u8] {
        let stale = self
            .backdrop
            .as_ref()
            .map_or(true, |b| b.url != url || b.width != width || b.height != height);
        if stale {
            self.backdrop = Some(Backdrop {
                url: url.to_string(),
                width,
                height,
                pixels: render_backdrop(url, width, height),
            });
        }
        self.backdrop.as_ref().map(|b| b.pixels.as_slice()).unwrap_or_default()
    }
}

impl VideoTransform for BackgroundTransform {
    fn apply(&mut self, frame: &mut VideoFrame, config: &StageConfig) -> Result<(), StageError> {
        let StageConfig::Background(config) = config else {
            return Err(StageError::RuntimeError {
                kind: StageKind::Background,
                reason: format!("received {} config", config.kind()),
            });
        };
        if !config.has_effect() {
            return Ok(());
        }

        let mask = self.segmenter.segment(frame);
        if mask.len() != (frame.width * frame.height) as usize {
            return Err(StageError::RuntimeError {
                kind: StageKind::Background,
                reason: format!("mask has {} entries for a {}x{} frame", mask.len(), frame.width, frame.height),
            });
        }

        let replacement = match &config.background_image_url {
            Some(url) => self.backdrop(url, frame.width, frame.height).to_vec(),
            None => box_blur(frame),
        };

        for (i, alpha) in mask.iter().enumerate() {
            let px = i * 4;
            for c in 0..3 {
                let fg = frame.pixels[px + c] as f32;
                let bg = replacement[px + c] as f32;
                frame.pixels[px + c] = (fg * alpha + bg * (1.0 - alpha)).round() as u8;
            }
        }
        Ok(())
    }
}

fn box_blur(frame: &VideoFrame) -> Vec<u8> {
    let (w, h) = (frame.width as i64, frame.height as i64);
    let mut out = frame.pixels.clone();
    for y in 0..h {
        for x in 0..w {
            let mut sum = [0u32; 3];
            let mut count = 0;
            for dy in -BLUR_RADIUS..=BLUR_RADIUS {
                for dx in -BLUR_RADIUS..=BLUR_RADIUS {
                    let (sx, sy) = (x + dx, y + dy);
                    if sx < 0 || sy < 0 || sx >= w || sy >= h {
                        continue;
                    }
                    let i = frame.pixel_index(sx as u32, sy as u32);
                    for c in 0..3 {
                        sum[c] += frame.pixels[i + c] as u32;
                    }
                    count += 1;
                }
            }
            let i = frame.pixel_index(x as u32, y as u32);
            for c in 0..3 {
                out[i + c] = (sum[c] / count) as u8;
            }
        }
    }
    out
}

/// Stand-in for a decoded background image: a vertical two-colour gradient keyed by the image URL.
fn render_backdrop(url: &str, width: u32, height: u32) -> Vec<u8> {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    let seed = hasher.finish().to_le_bytes();
    let (top, bottom) = ([seed[0], seed[1], seed[2]], [seed[3], seed[4], seed[5]]);

    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        let t = y as f32 / height.max(1) as f32;
        let row = [0, 1, 2].map(|c| (top[c] as f32 * (1.0 - t) + bottom[c] as f32 * t) as u8);
        for _ in 0..width {
            pixels.extend_from_slice(&[row[0], row[1], row[2], 255]);
        }
    }
    pixels
}
