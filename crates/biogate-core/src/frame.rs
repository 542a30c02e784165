//! Grayscale image frames, decoding, dark-frame detection and CLAHE.

use thiserror::Error;

/// Pixels below this value count toward the dark-frame fraction.
const DARK_PIXEL_CEILING: u8 = 32;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame buffer: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame has zero width or height")]
    Empty,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// An 8-bit grayscale image frame.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    /// Row-major luma samples (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ImageFrame {
    /// Wrap a raw luma buffer, checking its length against the dimensions.
    pub fn from_luma(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    /// Decode an encoded image (PNG, JPEG, ...) and convert it to luma.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let gray = image::load_from_memory(bytes)?.to_luma8();
        let (width, height) = gray.dimensions();
        Self::from_luma(gray.into_raw(), width, height)
    }

    /// Pixel at (x, y); callers guarantee bounds.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width as usize + x]
    }

    /// Bilinear sample at a sub-pixel position. Out-of-bounds samples read as 0.
    pub fn sample_bilinear(&self, sx: f32, sy: f32) -> f32 {
        let w = self.width as i32;
        let h = self.height as i32;
        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let at = |x: i32, y: i32| -> f32 {
            if x >= 0 && x < w && y >= 0 && y < h {
                self.pixel(x as usize, y as usize) as f32
            } else {
                0.0
            }
        };

        at(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + at(x0 + 1, y0) * fx * (1.0 - fy)
            + at(x0, y0 + 1) * (1.0 - fx) * fy
            + at(x0 + 1, y0 + 1) * fx * fy
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// True if more than `max_dark_fraction` of pixels fall in the darkest bucket.
    pub fn is_dark(&self, max_dark_fraction: f32) -> bool {
        if self.data.is_empty() {
            return true;
        }
        let dark = self.data.iter().filter(|&&p| p < DARK_PIXEL_CEILING).count();
        (dark as f32 / self.data.len() as f32) > max_dark_fraction
    }

    /// Contrast-limited adaptive histogram equalization, in place.
    ///
    /// Splits the frame into a `tiles` × `tiles` grid, clips each tile
    /// histogram at `clip_limit` × tile area, and blends neighbouring tile
    /// CDFs bilinearly.
    pub fn clahe(&mut self, tiles: usize, clip_limit: f32) {
        let w = self.width as usize;
        let h = self.height as usize;
        if tiles == 0 {
            return;
        }
        let tile_w = w / tiles;
        let tile_h = h / tiles;
        if tile_w == 0 || tile_h == 0 {
            return;
        }
        let tile_area = (tile_w * tile_h) as f32;
        let clip = (clip_limit * tile_area) as u32;

        let cdfs: Vec<[f32; 256]> = (0..tiles * tiles)
            .map(|t| {
                let (row, col) = (t / tiles, t % tiles);
                let mut hist = [0u32; 256];
                for y in row * tile_h..(row + 1) * tile_h {
                    for x in col * tile_w..(col + 1) * tile_w {
                        hist[self.data[y * w + x] as usize] += 1;
                    }
                }
                tile_cdf(&mut hist, clip, tile_area)
            })
            .collect();

        let last = (tiles - 1) as f32;
        for y in 0..h {
            let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
            let r0 = fy as usize;
            let r1 = (r0 + 1).min(tiles - 1);
            let dy = fy - r0 as f32;

            for x in 0..w {
                let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
                let c0 = fx as usize;
                let c1 = (c0 + 1).min(tiles - 1);
                let dx = fx - c0 as f32;

                let p = self.data[y * w + x] as usize;
                let top = cdfs[r0 * tiles + c0][p] * (1.0 - dx) + cdfs[r0 * tiles + c1][p] * dx;
                let bot = cdfs[r1 * tiles + c0][p] * (1.0 - dx) + cdfs[r1 * tiles + c1][p] * dx;
                self.data[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Clip a tile histogram, redistribute the excess, and return its 0–255 CDF.
fn tile_cdf(hist: &mut [u32; 256], clip: u32, tile_area: f32) -> [f32; 256] {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < leftover);
    }

    let mut cdf = [0f32; 256];
    let mut acc = 0f32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        acc += count as f32;
        *slot = acc;
    }
    let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = tile_area - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: u8, w: u32, h: u32) -> ImageFrame {
        ImageFrame::from_luma(vec![value; (w * h) as usize], w, h).unwrap()
    }

    #[test]
    fn test_from_luma_length_check() {
        let err = ImageFrame::from_luma(vec![0; 5], 2, 2).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { expected: 4, actual: 5 }));
        assert!(matches!(ImageFrame::from_luma(vec![], 0, 4), Err(FrameError::Empty)));
    }

    #[test]
    fn test_decode_png_to_luma() {
        let img = image::GrayImage::from_pixel(3, 2, image::Luma([77u8]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let frame = ImageFrame::decode(&bytes).unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert!(frame.data.iter().all(|&p| p == 77));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(ImageFrame::decode(b"not an image"), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(uniform(0, 10, 10).is_dark(0.95));
        assert!(!uniform(128, 10, 10).is_dark(0.95));

        // 96 of 100 pixels dark
        let mut data = vec![10u8; 96];
        data.extend([200u8; 4]);
        let frame = ImageFrame::from_luma(data, 10, 10).unwrap();
        assert!(frame.is_dark(0.95));
        assert!(!frame.is_dark(0.97));
    }

    #[test]
    fn test_bilinear_sample_midpoint() {
        let frame = ImageFrame::from_luma(vec![0, 100, 0, 100], 2, 2).unwrap();
        assert!((frame.sample_bilinear(0.5, 0.0) - 50.0).abs() < 1e-4);
        assert_eq!(frame.sample_bilinear(-5.0, -5.0), 0.0);
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let (w, h) = (16u32, 16u32);
        let data: Vec<u8> = (0..(w * h) as usize).map(|i| 100 + (i % 11) as u8).collect();
        let mut frame = ImageFrame::from_luma(data, w, h).unwrap();

        let before = stddev(&frame.data);
        frame.clahe(2, 0.02);
        let after = stddev(&frame.data);
        assert!(after > before, "before={before:.2} after={after:.2}");
    }

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        (data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n).sqrt()
    }
}
