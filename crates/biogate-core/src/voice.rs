//! Voice feature extraction: resample, quality gate, MFCC, standardization.
//!
//! The cepstral pipeline is the classic one: pre-emphasis, 25 ms frames on a
//! 10 ms hop (rectangular window), power spectrum, triangular mel
//! filterbank, log, orthonormal DCT-II, sinusoidal liftering, and the first
//! coefficient replaced by log frame energy. Each coefficient column is then
//! standardized (zero mean, unit variance) using statistics of this sample
//! only.

use crate::config::VoiceConfig;
use crate::types::VoiceFeatureSequence;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use thiserror::Error;

/// Samples at or above this magnitude count as clipped.
const CLIP_LEVEL: f64 = 0.999;
/// Frame and hop used for the RMS energy estimate.
const RMS_FRAME: usize = 2048;
const RMS_HOP: usize = 512;
/// Columns with a standard deviation below this are left unscaled.
const MIN_SCALE: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("invalid audio input: {0}")]
    InvalidInput(String),
    #[error("invalid voice configuration: {0}")]
    InvalidConfig(String),
    #[error("insufficient audio quality: {0}")]
    InsufficientAudioQuality(AudioQuality),
}

/// Signal statistics behind the quality gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioQuality {
    pub zero_crossings: usize,
    /// Mean of per-frame RMS energy.
    pub rms: f64,
    pub clipped_fraction: f64,
}

impl std::fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} zero crossings, rms {:.4}, {:.2}% clipped",
            self.zero_crossings,
            self.rms,
            self.clipped_fraction * 100.0
        )
    }
}

impl AudioQuality {
    pub fn measure(signal: &[f64]) -> Self {
        let zero_crossings = signal
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();

        let frame_rms = |frame: &[f64]| (frame.iter().map(|x| x * x).sum::<f64>() / frame.len() as f64).sqrt();
        let rms = if signal.len() <= RMS_FRAME {
            frame_rms(signal)
        } else {
            let frames: Vec<f64> = (0..=(signal.len() - RMS_FRAME) / RMS_HOP)
                .map(|i| frame_rms(&signal[i * RMS_HOP..i * RMS_HOP + RMS_FRAME]))
                .collect();
            frames.iter().sum::<f64>() / frames.len() as f64
        };

        let clipped = signal.iter().filter(|x| x.abs() >= CLIP_LEVEL).count();

        Self {
            zero_crossings,
            rms,
            clipped_fraction: clipped as f64 / signal.len().max(1) as f64,
        }
    }

    /// Live iff crossings and energy both clear their floors and clipping
    /// stays under its ceiling.
    pub fn is_live(&self, config: &VoiceConfig) -> bool {
        self.zero_crossings > config.min_zero_crossings
            && self.rms > config.min_rms
            && self.clipped_fraction <= config.max_clipped_fraction
    }
}

/// Reusable extractor holding the FFT plan and mel filterbank.
pub struct VoiceExtractor {
    config: VoiceConfig,
    fft: Arc<dyn Fft<f64>>,
    filterbank: Vec<Vec<f64>>,
    lifter: Vec<f64>,
    frame_len: usize,
    frame_step: usize,
}

impl VoiceExtractor {
    pub fn new(config: &VoiceConfig) -> Result<Self, VoiceError> {
        let rate = config.sample_rate as f64;
        let frame_len = (config.window_secs * rate).round() as usize;
        let frame_step = (config.step_secs * rate).round() as usize;

        if config.sample_rate == 0 || frame_len == 0 || frame_step == 0 {
            return Err(VoiceError::InvalidConfig("sample rate, window and step must be positive".into()));
        }
        if config.fft_size < 2 || config.num_filters == 0 {
            return Err(VoiceError::InvalidConfig("fft size and filter count must be positive".into()));
        }
        if config.num_cepstra == 0 || config.num_cepstra > config.num_filters {
            return Err(VoiceError::InvalidConfig(format!(
                "cepstra count {} must be in 1..={}",
                config.num_cepstra, config.num_filters
            )));
        }

        let fft = FftPlanner::<f64>::new().plan_fft_forward(config.fft_size);
        Ok(Self {
            config: config.clone(),
            fft,
            filterbank: mel_filterbank(config.num_filters, config.fft_size, config.sample_rate),
            lifter: lifter_weights(config.num_cepstra, config.cepstral_lifter),
            frame_len,
            frame_step,
        })
    }

    /// Validate, resample and measure a waveform without extracting features.
    pub fn assess(&self, samples: &[f32], sample_rate: u32) -> Result<AudioQuality, VoiceError> {
        let signal = self.prepare(samples, sample_rate)?;
        Ok(AudioQuality::measure(&signal))
    }

    /// Full extraction. Fails with `InsufficientAudioQuality` when the
    /// sample looks silent, clipped or otherwise non-live.
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<VoiceFeatureSequence, VoiceError> {
        let signal = self.prepare(samples, sample_rate)?;

        let quality = AudioQuality::measure(&signal);
        if !quality.is_live(&self.config) {
            tracing::debug!(?quality, "voice sample rejected by quality gate");
            return Err(VoiceError::InsufficientAudioQuality(quality));
        }

        let mut frames = self.mfcc(&signal);
        standardize(&mut frames);
        tracing::debug!(frames = frames.len(), width = self.config.num_cepstra, "voice features extracted");

        VoiceFeatureSequence::new(frames).map_err(|e| VoiceError::InvalidInput(e.to_string()))
    }

    fn prepare(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f64>, VoiceError> {
        if samples.is_empty() {
            return Err(VoiceError::InvalidInput("empty waveform".into()));
        }
        if sample_rate == 0 {
            return Err(VoiceError::InvalidInput("sample rate must be positive".into()));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(VoiceError::InvalidInput("waveform contains non-finite samples".into()));
        }

        // checked on the source rate so an oversized resample never allocates
        let duration = samples.len() as f64 / f64::from(sample_rate);
        if duration > self.config.max_duration_secs {
            return Err(VoiceError::InvalidInput(format!(
                "sample is {duration:.2}s, limit is {:.2}s",
                self.config.max_duration_secs
            )));
        }
        Ok(resample(samples, sample_rate, self.config.sample_rate))
    }

    fn mfcc(&self, signal: &[f64]) -> Vec<Vec<f64>> {
        let nfft = self.config.fft_size;
        let bins = nfft / 2 + 1;

        let emphasized: Vec<f64> = std::iter::once(signal[0])
            .chain(signal.windows(2).map(|w| w[1] - self.config.preemphasis * w[0]))
            .collect();

        let num_frames = if emphasized.len() <= self.frame_len {
            1
        } else {
            1 + (emphasized.len() - self.frame_len).div_ceil(self.frame_step)
        };

        let mut buf = vec![Complex::new(0.0, 0.0); nfft];
        (0..num_frames)
            .map(|f| {
                let start = f * self.frame_step;
                for (i, slot) in buf.iter_mut().enumerate() {
                    let v = if i < self.frame_len {
                        emphasized.get(start + i).copied().unwrap_or(0.0)
                    } else {
                        0.0
                    };
                    *slot = Complex::new(v, 0.0);
                }
                self.fft.process(&mut buf);

                let power: Vec<f64> = buf[..bins].iter().map(|c| c.norm_sqr() / nfft as f64).collect();
                let energy = nonzero(power.iter().sum());

                let log_mel: Vec<f64> = self
                    .filterbank
                    .iter()
                    .map(|filter| nonzero(filter.iter().zip(&power).map(|(w, p)| w * p).sum()).ln())
                    .collect();

                let mut cepstra = dct_ortho(&log_mel, self.config.num_cepstra);
                for (c, w) in cepstra.iter_mut().zip(&self.lifter) {
                    *c *= w;
                }
                cepstra[0] = energy.ln();
                cepstra
            })
            .collect()
    }
}

fn nonzero(v: f64) -> f64 {
    if v == 0.0 { f64::EPSILON } else { v }
}

/// Linear-interpolation resampler.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f64> {
    if from == to || samples.len() < 2 {
        return samples.iter().map(|&s| s as f64).collect();
    }
    let n = samples.len();
    let out_len = ((n as u64 * to as u64 + from as u64 / 2) / from as u64).max(1) as usize;
    let ratio = from as f64 / to as f64;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let i0 = (pos.floor() as usize).min(n - 1);
            let i1 = (i0 + 1).min(n - 1);
            let frac = pos - i0 as f64;
            samples[i0] as f64 * (1.0 - frac) + samples[i1] as f64 * frac
        })
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular filters evenly spaced on the mel scale from 0 Hz to Nyquist.
fn mel_filterbank(num_filters: usize, nfft: usize, sample_rate: u32) -> Vec<Vec<f64>> {
    let rate = sample_rate as f64;
    let high = hz_to_mel(rate / 2.0);
    let bins: Vec<usize> = (0..num_filters + 2)
        .map(|i| {
            let mel = high * i as f64 / (num_filters + 1) as f64;
            ((nfft + 1) as f64 * mel_to_hz(mel) / rate).floor() as usize
        })
        .collect();

    let width = nfft / 2 + 1;
    (0..num_filters)
        .map(|j| {
            let (lo, mid, hi) = (bins[j], bins[j + 1], bins[j + 2]);
            let mut filter = vec![0.0; width];
            for k in lo..mid.min(width) {
                filter[k] = (k - lo) as f64 / (mid - lo) as f64;
            }
            for k in mid..hi.min(width) {
                filter[k] = (hi - k) as f64 / (hi - mid) as f64;
            }
            filter
        })
        .collect()
}

fn lifter_weights(num_cepstra: usize, lifter: usize) -> Vec<f64> {
    (0..num_cepstra)
        .map(|n| {
            if lifter == 0 {
                1.0
            } else {
                let l = lifter as f64;
                1.0 + (l / 2.0) * (std::f64::consts::PI * n as f64 / l).sin()
            }
        })
        .collect()
}

/// Orthonormal DCT-II, first `keep` coefficients.
fn dct_ortho(input: &[f64], keep: usize) -> Vec<f64> {
    let n = input.len() as f64;
    (0..keep)
        .map(|k| {
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            scale
                * input
                    .iter()
                    .enumerate()
                    .map(|(i, x)| x * (std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos())
                    .sum::<f64>()
        })
        .collect()
}

/// Standardize each column to zero mean and unit (population) variance.
fn standardize(frames: &mut [Vec<f64>]) {
    let Some(width) = frames.first().map(Vec::len) else {
        return;
    };
    let n = frames.len() as f64;
    for col in 0..width {
        let mean = frames.iter().map(|f| f[col]).sum::<f64>() / n;
        let var = frames.iter().map(|f| (f[col] - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();
        let scale = if std < MIN_SCALE { 1.0 } else { std };
        for f in frames.iter_mut() {
            f[col] = (f[col] - mean) / scale;
        }
    }
}
