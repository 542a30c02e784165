//! Template comparison: Euclidean distance for face encodings, dynamic
//! time warping for voice feature sequences.

use crate::types::{FaceEncoding, VoiceFeatureSequence};
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("encoding length mismatch: probe {probe}, enrolled {enrolled}")]
    LengthMismatch { probe: usize, enrolled: usize },
    #[error("cannot compare empty input")]
    Empty,
    #[error("frame width mismatch: probe {probe}, enrolled {enrolled}")]
    FrameWidthMismatch { probe: usize, enrolled: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceMatch {
    pub matched: bool,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceMatch {
    pub matched: bool,
    pub similarity: f64,
    pub cost: f64,
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, MatchError> {
    if a.len() != b.len() {
        return Err(MatchError::LengthMismatch { probe: a.len(), enrolled: b.len() });
    }
    if a.is_empty() {
        return Err(MatchError::Empty);
    }
    Ok(a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt())
}

/// Match iff the distance is strictly below `threshold`.
pub fn compare_faces(probe: &FaceEncoding, enrolled: &FaceEncoding, threshold: f32) -> Result<FaceMatch, MatchError> {
    let distance = euclidean_distance(&probe.values, &enrolled.values)?;
    Ok(FaceMatch {
        matched: distance < threshold,
        distance,
    })
}

fn frame_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Accumulated DTW cost with unit step weights and no warping window.
///
/// `D[0][0] = 0`, the rest of row 0 and column 0 are infinite, and
/// `D[i][j] = d(a[i-1], b[j-1]) + min(D[i-1][j], D[i][j-1], D[i-1][j-1])`.
pub fn dtw_cost(a: &VoiceFeatureSequence, b: &VoiceFeatureSequence) -> Result<f64, MatchError> {
    if a.is_empty() || b.is_empty() {
        return Err(MatchError::Empty);
    }
    if a.width() != b.width() {
        return Err(MatchError::FrameWidthMismatch { probe: a.width(), enrolled: b.width() });
    }

    let (n, m) = (a.len(), b.len());
    let mut d = Array2::<f64>::from_elem((n + 1, m + 1), f64::INFINITY);
    d[[0, 0]] = 0.0;

    for i in 1..=n {
        let fa = &a.frames()[i - 1];
        for j in 1..=m {
            let step = d[[i - 1, j]].min(d[[i, j - 1]]).min(d[[i - 1, j - 1]]);
            d[[i, j]] = frame_distance(fa, &b.frames()[j - 1]) + step;
        }
    }
    Ok(d[[n, m]])
}

/// Match iff `1 / (1 + cost)` reaches `threshold`.
pub fn compare_voices(
    probe: &VoiceFeatureSequence,
    enrolled: &VoiceFeatureSequence,
    threshold: f64,
) -> Result<VoiceMatch, MatchError> {
    let cost = dtw_cost(probe, enrolled)?;
    let similarity = 1.0 / (1.0 + cost);
    Ok(VoiceMatch {
        matched: similarity >= threshold,
        similarity,
        cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn enc(values: &[f32]) -> FaceEncoding {
        FaceEncoding::new(values.to_vec())
    }

    fn seq(frames: &[&[f64]]) -> VoiceFeatureSequence {
        VoiceFeatureSequence::new(frames.iter().map(|f| f.to_vec()).collect()).unwrap()
    }

    #[test]
    fn test_identical_faces_match() {
        let e = enc(&[0.1, 0.2, 0.3]);
        let m = compare_faces(&e, &e, 0.6).unwrap();
        assert!(m.matched);
        assert_eq!(m.distance, 0.0);
    }

    #[test]
    fn test_face_threshold_is_strict() {
        let m = compare_faces(&enc(&[0.0, 0.0]), &enc(&[0.5, 0.0]), 0.5).unwrap();
        assert_eq!(m.distance, 0.5);
        assert!(!m.matched);
    }

    #[test]
    fn test_face_distance_0_9_mismatch() {
        let m = compare_faces(&enc(&[0.0]), &enc(&[0.9]), 0.6).unwrap();
        assert!(!m.matched);
        assert!((m.distance - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_face_length_mismatch() {
        assert_eq!(
            compare_faces(&enc(&[0.0; 128]), &enc(&[0.0; 512]), 0.6),
            Err(MatchError::LengthMismatch { probe: 128, enrolled: 512 })
        );
        assert_eq!(compare_faces(&enc(&[]), &enc(&[]), 0.6), Err(MatchError::Empty));
    }

    #[test]
    fn test_dtw_identical_is_zero() {
        let s = seq(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]);
        assert_eq!(dtw_cost(&s, &s).unwrap(), 0.0);
        let m = compare_voices(&s, &s, 0.75).unwrap();
        assert!(m.matched);
        assert_eq!(m.similarity, 1.0);
    }

    #[test]
    fn test_dtw_absorbs_time_stretch() {
        let a = seq(&[&[0.0], &[1.0], &[2.0]]);
        let b = seq(&[&[0.0], &[0.0], &[1.0], &[1.0], &[2.0]]);
        assert_eq!(dtw_cost(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_dtw_known_cost() {
        // single frames 3-4-5 apart
        let a = seq(&[&[0.0, 0.0]]);
        let b = seq(&[&[3.0, 4.0]]);
        let m = compare_voices(&a, &b, 0.75).unwrap();
        assert_eq!(m.cost, 5.0);
        assert!((m.similarity - 1.0 / 6.0).abs() < 1e-12);
        assert!(!m.matched);
    }

    #[test]
    fn test_voice_threshold_inclusive() {
        // cost 1/3 → similarity exactly 0.75
        let a = seq(&[&[0.0]]);
        let b = seq(&[&[1.0 / 3.0]]);
        let m = compare_voices(&a, &b, 0.75).unwrap();
        assert!((m.similarity - 0.75).abs() < 1e-12);
        assert_eq!(m.matched, m.similarity >= 0.75);
    }

    #[test]
    fn test_dtw_width_mismatch() {
        let a = seq(&[&[0.0, 1.0]]);
        let b = seq(&[&[0.0, 1.0, 2.0]]);
        assert_eq!(
            dtw_cost(&a, &b),
            Err(MatchError::FrameWidthMismatch { probe: 2, enrolled: 3 })
        );
    }

    fn arb_sequence(width: usize) -> impl Strategy<Value = VoiceFeatureSequence> {
        prop::collection::vec(prop::collection::vec(-10.0f64..10.0, width), 1..12)
            .prop_map(|frames| VoiceFeatureSequence::new(frames).unwrap())
    }

    proptest! {
        #[test]
        fn prop_dtw_symmetric(a in arb_sequence(4), b in arb_sequence(4)) {
            let ab = dtw_cost(&a, &b).unwrap();
            let ba = dtw_cost(&b, &a).unwrap();
            prop_assert!((ab - ba).abs() <= 1e-9 * ab.max(1.0));
        }

        #[test]
        fn prop_dtw_self_cost_zero(a in arb_sequence(3)) {
            prop_assert_eq!(dtw_cost(&a, &a).unwrap(), 0.0);
        }

        #[test]
        fn prop_dtw_finite_non_negative(a in arb_sequence(2), b in arb_sequence(2)) {
            let c = dtw_cost(&a, &b).unwrap();
            prop_assert!(c.is_finite() && c >= 0.0);
        }

        #[test]
        fn prop_face_distance_symmetric(
            v in prop::collection::vec((-1.0f32..1.0, -1.0f32..1.0), 1..64)
        ) {
            let (a, b): (Vec<f32>, Vec<f32>) = v.into_iter().unzip();
            prop_assert_eq!(euclidean_distance(&a, &b).unwrap(), euclidean_distance(&b, &a).unwrap());
            prop_assert_eq!(euclidean_distance(&a, &a).unwrap(), 0.0);
        }
    }
}
