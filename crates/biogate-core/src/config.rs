//! Threshold and policy values for the biometric engine.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial TOML
//! table only overrides the keys it names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiometricConfig {
    pub face: FaceConfig,
    pub liveness: LivenessConfig,
    pub voice: VoiceConfig,
    pub lockout: LockoutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    /// Euclidean distance below which two encodings match (strict).
    pub match_threshold: f32,
    /// Minimum detector confidence for an enrollment frame.
    pub detection_confidence: f32,
    /// Fraction of near-black pixels above which a frame counts as dark.
    pub dark_frame_fraction: f32,
    /// Run CLAHE contrast enhancement before detection.
    pub enhance_contrast: bool,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            detection_confidence: 0.8,
            dark_frame_fraction: 0.95,
            enhance_contrast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub enabled: bool,
    /// Averaged eye-aspect ratio below which the eyes count as closed.
    pub ear_threshold: f32,
    /// Minimum run of closed-eye frames that qualifies as a blink.
    pub min_consecutive_frames: u32,
    /// Confirmed blinks required to pass.
    pub min_blinks: u32,
    /// Observation window: frames past this count are ignored.
    pub max_frames: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ear_threshold: 0.3,
            min_consecutive_frames: 3,
            min_blinks: 1,
            max_frames: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Rate every waveform is resampled to before feature extraction.
    pub sample_rate: u32,
    pub num_cepstra: usize,
    pub num_filters: usize,
    pub fft_size: usize,
    /// Analysis window length in seconds.
    pub window_secs: f64,
    /// Hop between windows in seconds.
    pub step_secs: f64,
    pub preemphasis: f64,
    pub cepstral_lifter: usize,
    /// DTW similarity at or above which two samples match.
    pub match_threshold: f64,
    pub min_zero_crossings: usize,
    pub min_rms: f64,
    pub max_clipped_fraction: f64,
    /// Upper bound on sample duration; keeps DTW cost bounded.
    pub max_duration_secs: f64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            num_cepstra: 13,
            num_filters: 26,
            fft_size: 1024,
            window_secs: 0.025,
            step_secs: 0.01,
            preemphasis: 0.97,
            cepstral_lifter: 22,
            match_threshold: 0.75,
            min_zero_crossings: 1000,
            min_rms: 0.05,
            max_clipped_fraction: 0.01,
            max_duration_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Failed attempts at which further verification is refused.
    pub max_attempts: u32,
    /// Seconds a failed-attempt counter survives after its last increment.
    pub window_secs: u64,
}

impl LockoutConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            window_secs: 300,
        }
    }
}

/// Per-call verification policy (per-identity security settings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationPolicy {
    pub require_liveness: bool,
    pub require_voice: bool,
    /// Overrides [`LockoutConfig::max_attempts`] for this identity.
    pub max_attempts: Option<u32>,
    /// Overrides [`LockoutConfig::window_secs`] for this identity.
    pub lockout_window_secs: Option<u64>,
}

impl VerificationPolicy {
    /// The lockout rules in force for this call.
    pub fn lockout(&self, base: &LockoutConfig) -> LockoutConfig {
        LockoutConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            window_secs: self.lockout_window_secs.unwrap_or(base.window_secs),
        }
    }
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            require_liveness: true,
            require_voice: false,
            max_attempts: None,
            lockout_window_secs: None,
        }
    }
}
