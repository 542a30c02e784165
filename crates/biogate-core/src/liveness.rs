//! Blink-based liveness detection over a stream of eye landmarks.
//!
//! Each frame yields an averaged eye-aspect ratio (EAR). A run of at least
//! `min_consecutive_frames` frames below `ear_threshold` counts as one
//! blink, confirmed on the rising edge when the EAR climbs back above the
//! threshold. A session passes once `min_blinks` blinks are confirmed.
//!
//! Thresholds come from a [`LivenessConfig`] passed to every call, so one
//! session type serves any configuration.
//!
//! # Threat coverage
//!
//! Blocks a static printed photo. Does not block video replay or masks.

use crate::config::LivenessConfig;
use crate::types::{LandmarkFrame, Point};
use thiserror::Error;

/// Horizontal eye widths below this are treated as degenerate landmarks.
const MIN_EYE_WIDTH: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LivenessError {
    #[error("degenerate eye contour: corner points coincide")]
    DegenerateEye,
    #[error("liveness check failed: {blinks} blink(s) confirmed, {required} required")]
    CheckFailed { blinks: u32, required: u32 },
}

fn dist(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Eye-aspect ratio `(|p2-p6| + |p3-p5|) / (2 |p1-p4|)` for one eye.
pub fn eye_aspect_ratio(eye: &[Point; 6]) -> Result<f32, LivenessError> {
    let horizontal = dist(eye[0], eye[3]);
    if horizontal < MIN_EYE_WIDTH || !horizontal.is_finite() {
        return Err(LivenessError::DegenerateEye);
    }
    Ok((dist(eye[1], eye[5]) + dist(eye[2], eye[4])) / (2.0 * horizontal))
}

/// Mean EAR of both eyes.
pub fn averaged_ear(frame: &LandmarkFrame) -> Result<f32, LivenessError> {
    Ok((eye_aspect_ratio(&frame.left_eye)? + eye_aspect_ratio(&frame.right_eye)?) / 2.0)
}

/// What a single observation did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    EyesOpen,
    EyesClosing,
    BlinkConfirmed,
    /// Frame fell outside the observation window.
    Ignored,
}

/// Ephemeral per-verification blink counter. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct LivenessSession {
    closed_run: u32,
    blinks: u32,
    frames_seen: usize,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessReport {
    pub blinks: u32,
    pub frames_observed: usize,
}

impl LivenessSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blinks(&self) -> u32 {
        self.blinks
    }

    /// Feed one landmark frame.
    pub fn observe(&mut self, frame: &LandmarkFrame, config: &LivenessConfig) -> Result<LivenessEvent, LivenessError> {
        if self.frames_seen >= config.max_frames {
            return Ok(LivenessEvent::Ignored);
        }
        let ear = averaged_ear(frame)?;
        Ok(self.observe_ear(ear, config))
    }

    /// Feed one averaged EAR value.
    pub fn observe_ear(&mut self, ear: f32, config: &LivenessConfig) -> LivenessEvent {
        if self.frames_seen >= config.max_frames {
            return LivenessEvent::Ignored;
        }
        self.frames_seen += 1;

        if ear < config.ear_threshold {
            self.closed_run += 1;
            return LivenessEvent::EyesClosing;
        }

        let qualified = self.closed_run >= config.min_consecutive_frames;
        self.closed_run = 0;
        if qualified {
            self.blinks += 1;
            tracing::debug!(blinks = self.blinks, "blink confirmed");
            LivenessEvent::BlinkConfirmed
        } else {
            LivenessEvent::EyesOpen
        }
    }

    /// End the session. A closed-eye run still open at the end is not counted.
    pub fn finish(self, config: &LivenessConfig) -> Result<LivenessReport, LivenessError> {
        if self.blinks >= config.min_blinks {
            Ok(LivenessReport {
                blinks: self.blinks,
                frames_observed: self.frames_seen,
            })
        } else {
            Err(LivenessError::CheckFailed {
                blinks: self.blinks,
                required: config.min_blinks,
            })
        }
    }
}

/// Count confirmed blinks in an EAR sequence.
pub fn count_blinks(ears: &[f32], config: &LivenessConfig) -> u32 {
    let mut session = LivenessSession::new();
    for &ear in ears {
        session.observe_ear(ear, config);
    }
    session.blinks()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LivenessConfig {
        LivenessConfig {
            enabled: true,
            ear_threshold: 0.3,
            min_consecutive_frames: 3,
            min_blinks: 1,
            max_frames: 150,
        }
    }

    fn eye(cx: f32, half_gap: f32) -> [Point; 6] {
        [
            (cx - 1.0, 0.0),
            (cx - 0.5, -half_gap),
            (cx + 0.5, -half_gap),
            (cx + 1.0, 0.0),
            (cx + 0.5, half_gap),
            (cx - 0.5, half_gap),
        ]
    }

    #[test]
    fn test_ear_formula() {
        // vertical pairs 2*h apart, horizontal 2 apart → EAR = h
        assert!((eye_aspect_ratio(&eye(0.0, 0.35)).unwrap() - 0.35).abs() < 1e-6);
        assert!(eye_aspect_ratio(&eye(0.0, 0.0)).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_eye() {
        assert_eq!(eye_aspect_ratio(&[(1.0, 1.0); 6]), Err(LivenessError::DegenerateEye));
    }

    #[test]
    fn test_averaged_ear() {
        let f = LandmarkFrame { left_eye: eye(0.0, 0.2), right_eye: eye(10.0, 0.4) };
        assert!((averaged_ear(&f).unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_single_blink_rising_edge() {
        let ears = [0.4, 0.4, 0.15, 0.15, 0.15, 0.4];
        assert_eq!(count_blinks(&ears, &cfg()), 1);
    }

    #[test]
    fn test_blink_counted_once_per_run() {
        let mut s = LivenessSession::new();
        let events: Vec<_> = [0.1, 0.1, 0.1, 0.1, 0.1, 0.4, 0.4]
            .iter()
            .map(|&e| s.observe_ear(e, &cfg()))
            .collect();
        assert_eq!(
            events.iter().filter(|&&e| e == LivenessEvent::BlinkConfirmed).count(),
            1
        );
        assert_eq!(events[5], LivenessEvent::BlinkConfirmed);
        assert_eq!(events[6], LivenessEvent::EyesOpen);
    }

    #[test]
    fn test_short_run_not_a_blink() {
        assert_eq!(count_blinks(&[0.4, 0.1, 0.1, 0.4], &cfg()), 0);
    }

    #[test]
    fn test_run_open_at_end_not_counted() {
        assert_eq!(count_blinks(&[0.4, 0.1, 0.1, 0.1, 0.1], &cfg()), 0);
    }

    #[test]
    fn test_two_blinks() {
        let ears = [0.4, 0.1, 0.1, 0.1, 0.4, 0.35, 0.2, 0.2, 0.2, 0.2, 0.4];
        assert_eq!(count_blinks(&ears, &cfg()), 2);
    }

    #[test]
    fn test_threshold_per_call() {
        let ears = [0.4, 0.25, 0.25, 0.25, 0.4];
        assert_eq!(count_blinks(&ears, &cfg()), 1);
        let strict = LivenessConfig { ear_threshold: 0.2, ..cfg() };
        assert_eq!(count_blinks(&ears, &strict), 0);
    }

    #[test]
    fn test_observation_window() {
        let windowed = LivenessConfig { max_frames: 4, ..cfg() };
        let mut s = LivenessSession::new();
        for e in [0.1, 0.1, 0.1, 0.1] {
            s.observe_ear(e, &windowed);
        }
        assert_eq!(s.observe_ear(0.4, &windowed), LivenessEvent::Ignored);
        assert_eq!(s.blinks(), 0);
    }

    #[test]
    fn test_finish_quota() {
        let mut s = LivenessSession::new();
        for e in [0.4, 0.1, 0.1, 0.1, 0.4] {
            s.observe_ear(e, &cfg());
        }
        let report = s.clone().finish(&cfg()).unwrap();
        assert_eq!(report.blinks, 1);
        assert_eq!(report.frames_observed, 5);

        let two = LivenessConfig { min_blinks: 2, ..cfg() };
        assert_eq!(s.finish(&two), Err(LivenessError::CheckFailed { blinks: 1, required: 2 }));
    }

    #[test]
    fn test_observe_landmark_frame() {
        let mut s = LivenessSession::new();
        let open = LandmarkFrame { left_eye: eye(0.0, 0.4), right_eye: eye(10.0, 0.4) };
        let shut = LandmarkFrame { left_eye: eye(0.0, 0.05), right_eye: eye(10.0, 0.05) };
        for f in [open, shut, shut, shut] {
            s.observe(&f, &cfg()).unwrap();
        }
        assert_eq!(s.observe(&open, &cfg()).unwrap(), LivenessEvent::BlinkConfirmed);
    }
}
