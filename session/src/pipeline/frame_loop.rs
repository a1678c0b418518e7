//! The periodic video and audio tasks. Each owns its input feed and reads the active stage chain fresh for every
//! frame or window, so stage toggles take effect without restarting the loop.

use super::{
    output::FrameStats,
    stage::{
        AudioTransform,
        StageConfig,
        StageKind,
        VideoTransform,
    },
};
use crate::{
    error::StageError,
    media::{
        AudioWindow,
        VideoFrame,
    },
};
use meshcall_config::AudioConfig;
use std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{
        broadcast::{
            self,
            error::TryRecvError,
        },
        mpsc::UnboundedSender,
        watch,
    },
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub(super) struct ActiveVideoStage {
    pub kind: StageKind,
    pub config: StageConfig,
    pub transform: Arc<Mutex<Box<dyn VideoTransform>>>,
}

#[derive(Clone)]
pub(super) struct ActiveAudioStage {
    pub kind: StageKind,
    pub config: AudioConfig,
    pub transform: Arc<Mutex<Box<dyn AudioTransform>>>,
}

pub(super) type VideoChain = Arc<Vec<ActiveVideoStage>>;
pub(super) type AudioChain = Arc<Vec<ActiveAudioStage>>;

/// What every loop shares with the pipeline.
#[derive(Clone)]
pub(super) struct LoopContext {
    pub cancel: CancellationToken,
    pub stats: Arc<FrameStats>,
    pub faults: UnboundedSender<StageError>,
    /// Output sequence numbers continue across source swaps.
    pub seq: Arc<AtomicU64>,
}

impl LoopContext {
    fn report(&self, kind: StageKind, err: StageError) {
        let err = match err {
            err @ StageError::RuntimeError { .. } => err,
            other => StageError::RuntimeError {
                kind,
                reason: other.to_string(),
            },
        };
        let _ = self.faults.send(err);
    }
}

pub(super) async fn run_video(
    mut source: watch::Receiver<Option<Arc<VideoFrame>>>,
    mut chain: watch::Receiver<VideoChain>,
    tap: broadcast::Sender<Arc<VideoFrame>>,
    interval: Duration,
    ctx: LoopContext,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_input: Option<u64> = None;

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(input) = source.borrow_and_update().clone() else {
            continue;
        };
        if last_input.is_some_and(|last| input.seq <= last) {
            continue;
        }
        if let Some(last) = last_input {
            let skipped = input.seq - last - 1;
            if skipped > 0 {
                trace!(skipped, "video loop fell behind capture");
                ctx.stats.video_dropped.fetch_add(skipped, Ordering::Relaxed);
            }
        }
        last_input = Some(input.seq);

        let stages = chain.borrow_and_update().clone();
        let mut frame = VideoFrame::clone(&input);
        frame.applied.clear();
        for stage in stages.iter() {
            let result = match stage.transform.lock() {
                Ok(mut transform) => transform.apply(&mut frame, &stage.config),
                Err(_) => Err(StageError::RuntimeError {
                    kind: stage.kind,
                    reason: "transform panicked earlier".into(),
                }),
            };
            match result {
                Ok(()) => frame.applied.push(stage.kind),
                Err(err) => ctx.report(stage.kind, err),
            }
        }

        frame.seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
        ctx.stats.video_processed.fetch_add(1, Ordering::Relaxed);
        let _ = tap.send(Arc::new(frame));
    }
    trace!("video loop stopped");
}

pub(super) async fn run_audio(
    mut input: broadcast::Receiver<Arc<AudioWindow>>,
    mut chain: watch::Receiver<AudioChain>,
    tap: broadcast::Sender<Arc<AudioWindow>>,
    interval: Duration,
    ctx: LoopContext,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    'outer: loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stages = chain.borrow_and_update().clone();
        loop {
            let window = match input.try_recv() {
                Ok(window) => window,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(missed)) => {
                    ctx.stats.audio_dropped.fetch_add(missed, Ordering::Relaxed);
                    continue;
                }
                Err(TryRecvError::Closed) => break 'outer,
            };

            let mut samples = window.samples.clone();
            for stage in stages.iter() {
                let result = match stage.transform.lock() {
                    Ok(mut transform) => transform.process(&mut samples, &stage.config),
                    Err(_) => Err(StageError::RuntimeError {
                        kind: stage.kind,
                        reason: "transform panicked earlier".into(),
                    }),
                };
                if let Err(err) = result {
                    ctx.report(stage.kind, err);
                }
            }

            ctx.stats.audio_processed.fetch_add(1, Ordering::Relaxed);
            let _ = tap.send(Arc::new(AudioWindow {
                seq: ctx.seq.fetch_add(1, Ordering::Relaxed),
                samples,
            }));
        }
    }
    trace!("audio loop stopped");
}
