//! Adaptive noise gate for the microphone.

use super::stage::{
    AudioTransform,
    StageConfig,
    StageKind,
    StageLoader,
    StageRuntime,
};
use crate::error::StageError;
use futures::{
    future::BoxFuture,
    FutureExt as _,
};
use meshcall_config::AudioConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DenoiseLoader {
    load_delay: Duration,
}

impl Default for DenoiseLoader {
    fn default() -> Self {
        Self {
            load_delay: Duration::from_millis(50),
        }
    }
}

impl DenoiseLoader {
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }
}

impl StageLoader for DenoiseLoader {
    fn kind(&self) -> StageKind {
        StageKind::AudioDenoise
    }

    fn load(&self, _config: &StageConfig) -> BoxFuture<'static, Result<StageRuntime, StageError>> {
        let delay = self.load_delay;
        async move {
            tokio::time::sleep(delay).await;
            Ok(StageRuntime::Audio(Box::new(NoiseGate::default())))
        }
        .boxed()
    }
}

/// Attenuates windows whose level falls under the noise threshold, easing the gain in and out so the gate
/// does not click, then zeroes residual samples under the spectral gate relative to the window peak.
#[derive(Debug)]
pub struct NoiseGate {
    gain: f32,
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

impl NoiseGate {
    pub fn gain(&self) -> f32 {
        self.gain
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

impl AudioTransform for NoiseGate {
    fn process(&mut self, samples: &mut [f32], config: &AudioConfig) -> Result<(), StageError> {
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(StageError::RuntimeError {
                kind: StageKind::AudioDenoise,
                reason: "non-finite sample in window".into(),
            });
        }

        let target = if rms(samples) < config.noise_threshold { 0.0 } else { 1.0 };
        self.gain = self.gain * config.gain_smoothing_factor + target * (1.0 - config.gain_smoothing_factor);

        let peak = samples.iter().fold(0f32, |peak, s| peak.max(s.abs()));
        let floor = peak * config.spectral_gate_threshold;
        for sample in samples.iter_mut() {
            *sample = if sample.abs() < floor { 0.0 } else { *sample * self.gain };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(noise_threshold: f32, gain_smoothing_factor: f32) -> AudioConfig {
        AudioConfig {
            noise_threshold,
            gain_smoothing_factor,
            spectral_gate_threshold: 0.0,
        }
    }

    #[test]
    fn quiet_windows_fade_out_and_loud_ones_fade_back_in() {
        let mut gate = NoiseGate::default();
        let quiet = config(0.1, 0.5);
        let mut hiss = vec![0.01; 8];
        gate.process(&mut hiss, &quiet).unwrap();
        assert_eq!(gate.gain(), 0.5);
        gate.process(&mut vec![0.01; 8], &quiet).unwrap();
        assert_eq!(gate.gain(), 0.25);

        let mut speech = vec![0.5; 8];
        gate.process(&mut speech, &quiet).unwrap();
        assert_eq!(gate.gain(), 0.625);
        assert_eq!(speech[0], 0.5 * 0.625);
    }

    #[test]
    fn tuning_applies_to_the_next_window_without_reset() {
        let mut gate = NoiseGate::default();
        gate.process(&mut vec![0.01; 4], &config(0.1, 0.0)).unwrap();
        assert_eq!(gate.gain(), 0.0);
        // lowering the threshold lets the same level through immediately
        gate.process(&mut vec![0.01; 4], &config(0.001, 0.0)).unwrap();
        assert_eq!(gate.gain(), 1.0);
    }

    #[test]
    fn spectral_gate_removes_residue_below_the_floor() {
        let mut gate = NoiseGate::default();
        let mut samples = vec![0.8, 0.02, -0.5, -0.01];
        gate.process(
            &mut samples,
            &AudioConfig {
                noise_threshold: 0.0,
                gain_smoothing_factor: 0.0,
                spectral_gate_threshold: 0.1,
            },
        )
        .unwrap();
        assert_eq!(samples, vec![0.8, 0.0, -0.5, 0.0]);
    }

    #[test]
    fn corrupt_input_is_a_runtime_error() {
        let mut gate = NoiseGate::default();
        assert!(matches!(
            gate.process(&mut [f32::NAN], &AudioConfig::default()),
            Err(StageError::RuntimeError { .. })
        ));
    }
}
