//! Voice Activity Detection using energy-based analysis.
//!
//! Uses RMS energy thresholding on inbound PCM16 frames. Every frame yields a
//! [`VadEvent`] carrying the length of the current contiguous speech or
//! silence run, so downstream turn logic never needs a wall clock.

use crate::config::VadConfig;
use crate::pipeline::messages::AudioFrame;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// RMS level that `activation_threshold = 1.0` maps to.
const ACTIVATION_RMS_SCALE: f32 = 0.04;

/// Classification of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    /// The caller is talking.
    Speech,
    /// Background noise or nothing.
    Silence,
}

/// Activity report for one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadEvent {
    /// Classification of the frame.
    pub activity: Activity,
    /// Length of the contiguous run of `activity`, including this frame.
    pub contiguous: Duration,
    /// True on the first frame of a new run.
    pub onset: bool,
    /// RMS energy of the frame.
    pub rms: f32,
    /// Media timestamp of the frame.
    pub at: Duration,
}

impl VadEvent {
    /// Convenience constructor for a speech run of the given length.
    pub fn speech(contiguous: Duration, at: Duration) -> Self {
        Self {
            activity: Activity::Speech,
            contiguous,
            onset: false,
            rms: 0.0,
            at,
        }
    }

    /// Convenience constructor for a silence run of the given length.
    pub fn silence(contiguous: Duration, at: Duration) -> Self {
        Self {
            activity: Activity::Silence,
            contiguous,
            onset: false,
            rms: 0.0,
            at,
        }
    }

    /// Whether the frame was classified as speech.
    pub fn is_speech(&self) -> bool {
        self.activity == Activity::Speech
    }
}

/// Voice activity detector using RMS energy thresholding.
pub struct VoiceActivityDetector {
    /// Frames with RMS strictly above this are speech.
    rms_threshold: f32,
    /// Classification of the current run.
    activity: Activity,
    /// Length of the current run.
    contiguous: Duration,
}

impl VoiceActivityDetector {
    /// Create a detector from configuration.
    pub fn new(config: &VadConfig) -> Self {
        let rms_threshold = config.activation_threshold.clamp(0.0, 1.0) * ACTIVATION_RMS_SCALE;
        info!(
            "VAD initialized: activation_threshold={}, rms_threshold={rms_threshold:.4}",
            config.activation_threshold
        );
        Self {
            rms_threshold,
            activity: Activity::Silence,
            contiguous: Duration::ZERO,
        }
    }

    /// RMS level above which a frame counts as speech.
    pub fn rms_threshold(&self) -> f32 {
        self.rms_threshold
    }

    /// Classify a frame and extend or restart the current run.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> VadEvent {
        let rms = compute_rms_energy(frame);
        let activity = if rms > self.rms_threshold {
            Activity::Speech
        } else {
            Activity::Silence
        };

        let onset = activity != self.activity;
        if onset {
            self.activity = activity;
            self.contiguous = frame.duration();
        } else {
            self.contiguous = self.contiguous.saturating_add(frame.duration());
        }

        VadEvent {
            activity,
            contiguous: self.contiguous,
            onset,
            rms,
            at: frame.captured_at,
        }
    }

    /// Reset to silence.
    pub fn reset(&mut self) {
        self.activity = Activity::Silence;
        self.contiguous = Duration::ZERO;
    }
}

/// Compute RMS energy of a frame's samples.
fn compute_rms_energy(frame: &AudioFrame) -> f32 {
    let count = frame.sample_count();
    if count == 0 {
        return 0.0;
    }
    let sum_sq: f32 = frame.samples().map(|s| s * s).sum();
    (sum_sq / count as f32).sqrt()
}
