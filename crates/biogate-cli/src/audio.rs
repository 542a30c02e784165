//! Voice sample loading: 16-bit PCM WAV, or headerless s16le.

use anyhow::{bail, Context, Result};
use biogate_core::VoiceProbe;
use std::path::Path;

const PCM_FORMAT: u16 = 1;

/// Load a voice sample. WAV files carry their own rate; raw little-endian
/// 16-bit mono PCM needs `raw_rate`.
pub fn load_voice(path: &Path, raw_rate: Option<u32>) -> Result<VoiceProbe> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        parse_wav(&bytes).with_context(|| format!("parsing {}", path.display()))
    } else {
        let Some(sample_rate) = raw_rate else {
            bail!("{} is not a WAV file; pass --sample-rate for raw PCM", path.display());
        };
        Ok(VoiceProbe {
            samples: decode_s16le(&bytes, 1)?,
            sample_rate,
        })
    }
}

/// Decode interleaved s16le into mono f32 in [-1, 1], averaging channels.
fn decode_s16le(bytes: &[u8], channels: u16) -> Result<Vec<f32>> {
    let channels = usize::from(channels.max(1));
    let frame_bytes = 2 * channels;
    if bytes.len() % frame_bytes != 0 {
        bail!("PCM payload of {} bytes is not a whole number of {channels}-channel frames", bytes.len());
    }
    Ok(bytes
        .chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(2)
                .map(|s| i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0)
                .sum();
            sum / channels as f32
        })
        .collect())
}

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn parse_wav(bytes: &[u8]) -> Result<VoiceProbe> {
    let mut format: Option<(u16, u16, u32, u16)> = None;
    let mut pos = 12;

    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let len = read_u32(bytes, pos + 4) as usize;
        let body_start = pos + 8;
        let body_end = body_start.saturating_add(len).min(bytes.len());
        let body = &bytes[body_start..body_end];

        match id {
            b"fmt " => {
                if body.len() < 16 {
                    bail!("fmt chunk too short");
                }
                format = Some((read_u16(body, 0), read_u16(body, 2), read_u32(body, 4), read_u16(body, 14)));
            }
            b"data" => {
                let Some((tag, channels, sample_rate, bits)) = format else {
                    bail!("data chunk before fmt chunk");
                };
                if tag != PCM_FORMAT || bits != 16 {
                    bail!("unsupported WAV encoding: format {tag}, {bits} bits (need 16-bit PCM)");
                }
                let whole = body.len() - body.len() % (2 * usize::from(channels.max(1)));
                return Ok(VoiceProbe {
                    samples: decode_s16le(&body[..whole], channels)?,
                    sample_rate,
                });
            }
            _ => {}
        }
        // chunks are padded to even length
        pos = body_start.saturating_add(len + (len & 1));
    }
    bail!("no data chunk")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav(channels: u16, rate: u32, samples: &[i16]) -> Vec<u8> {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&PCM_FORMAT.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * 2 * channels as u32).to_le_bytes());
        out.extend_from_slice(&(2 * channels).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn test_mono_wav() {
        let probe = parse_wav(&wav(1, 16_000, &[0, 16384, -32768])).unwrap();
        assert_eq!(probe.sample_rate, 16_000);
        assert_eq!(probe.samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_stereo_wav_downmixed() {
        let probe = parse_wav(&wav(2, 44_100, &[16384, 0, -16384, -16384])).unwrap();
        assert_eq!(probe.sample_rate, 44_100);
        assert_eq!(probe.samples, vec![0.25, -0.5]);
    }

    #[test]
    fn test_rejects_non_pcm() {
        let mut bytes = wav(1, 8_000, &[0, 1]);
        bytes[20] = 3; // IEEE float tag
        assert!(parse_wav(&bytes).is_err());
    }

    #[test]
    fn test_raw_pcm_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.pcm");
        std::fs::write(&path, [0u8, 0x40, 0, 0xC0]).unwrap();

        let probe = load_voice(&path, Some(8_000)).unwrap();
        assert_eq!(probe.samples, vec![0.5, -0.5]);
        assert_eq!(probe.sample_rate, 8_000);
        assert!(load_voice(&path, None).is_err());
    }

    #[test]
    fn test_odd_raw_length_rejected() {
        assert!(decode_s16le(&[0, 0, 0], 1).is_err());
    }
}
