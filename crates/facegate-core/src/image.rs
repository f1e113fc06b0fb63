//! Grayscale image buffer: decoding, resampling and affine warps.
//!
//! Every stage of the pipeline (detection, alignment, augmentation and the
//! center-crop fallback) works on 8-bit single-channel pixels.

use base64::Engine as _;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("image could not be encoded: {0}")]
    Encode(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid pixel buffer: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image has zero width or height")]
    Empty,
}

/// How samples that fall outside the source image are filled during a warp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Border {
    /// Fill with a fixed gray level.
    Constant(u8),
    /// Mirror the image at its edges, repeating the edge pixel (`fedcba|abcdef|fedcba`).
    Reflect,
}

/// An 8-bit grayscale image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl FaceImage {
    /// Wrap a raw grayscale buffer, checking that it matches the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::Empty);
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(ImageError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Decode an encoded image (PNG, JPEG, ...) and convert it to grayscale.
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        let decoded =
            ::image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()))?;
        let gray = decoded.to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(gray.into_raw(), width, height)
    }

    /// Decode a base64 payload. A `data:image/...;base64,` prefix is stripped.
    pub fn from_base64(payload: &str) -> Result<Self, ImageError> {
        let body = match payload.split_once(',') {
            Some((header, body)) if header.starts_with("data:") => body,
            _ => payload,
        };
        let bytes = base64::engine::general_purpose::STANDARD.decode(body.trim())?;
        Self::decode(&bytes)
    }

    /// Encode as PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>, ImageError> {
        let buffer = ::image::GrayImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or(ImageError::InvalidLength {
                expected: self.width as usize * self.height as usize,
                actual: self.data.len(),
            })?;
        let mut out = Cursor::new(Vec::new());
        buffer
            .write_to(&mut out, ::image::ImageFormat::Png)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Copy out a rectangle. The rectangle is clipped to the image bounds and
    /// is at least one pixel in each direction.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> FaceImage {
        let x0 = x.min(self.width - 1) as usize;
        let y0 = y.min(self.height - 1) as usize;
        let w = (width.max(1) as usize).min(self.width as usize - x0);
        let h = (height.max(1) as usize).min(self.height as usize - y0);
        let stride = self.width as usize;

        let mut data = Vec::with_capacity(w * h);
        for row in y0..y0 + h {
            data.extend_from_slice(&self.data[row * stride + x0..row * stride + x0 + w]);
        }
        FaceImage {
            data,
            width: w as u32,
            height: h as u32,
        }
    }

    /// Resize with bilinear interpolation.
    pub fn resize(&self, width: u32, height: u32) -> FaceImage {
        let data = resize_bilinear(
            &self.data,
            self.width as usize,
            self.height as usize,
            width.max(1) as usize,
            height.max(1) as usize,
        );
        FaceImage {
            data,
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Mirror left to right.
    pub fn flip_horizontal(&self) -> FaceImage {
        let w = self.width as usize;
        let data = self
            .data
            .chunks_exact(w)
            .flat_map(|row| row.iter().rev().copied())
            .collect();
        FaceImage {
            data,
            width: self.width,
            height: self.height,
        }
    }

    /// Resample through an inverse affine map.
    ///
    /// `inverse` maps output coordinates back into the source:
    /// ```text
    /// sx = m[0]·x + m[1]·y + m[2]
    /// sy = m[3]·x + m[4]·y + m[5]
    /// ```
    pub fn warp(
        &self,
        inverse: &[f32; 6],
        out_width: u32,
        out_height: u32,
        border: Border,
    ) -> FaceImage {
        let ow = out_width as usize;
        let oh = out_height as usize;
        let mut data = vec![0u8; ow * oh];

        for oy in 0..oh {
            for ox in 0..ow {
                let (x, y) = (ox as f32, oy as f32);
                let sx = inverse[0] * x + inverse[1] * y + inverse[2];
                let sy = inverse[3] * x + inverse[4] * y + inverse[5];
                data[oy * ow + ox] = self.sample_bilinear(sx, sy, border);
            }
        }

        FaceImage {
            data,
            width: out_width,
            height: out_height,
        }
    }

    fn sample_bilinear(&self, sx: f32, sy: f32, border: Border) -> u8 {
        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tap = |x: i64, y: i64| -> f32 {
            let (w, h) = (self.width as i64, self.height as i64);
            match border {
                Border::Constant(fill) => {
                    if x < 0 || y < 0 || x >= w || y >= h {
                        fill as f32
                    } else {
                        self.data[(y * w + x) as usize] as f32
                    }
                }
                Border::Reflect => {
                    let (rx, ry) = (reflect(x, w), reflect(y, h));
                    self.data[(ry * w + rx) as usize] as f32
                }
            }
        };

        let val = tap(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + tap(x0 + 1, y0) * fx * (1.0 - fy)
            + tap(x0, y0 + 1) * (1.0 - fx) * fy
            + tap(x0 + 1, y0 + 1) * fx * fy;
        val.round().clamp(0.0, 255.0) as u8
    }
}

/// Mirror an index into `[0, n)`, repeating the edge sample.
fn reflect(i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    let m = i.rem_euclid(2 * n);
    if m < n {
        m
    } else {
        2 * n - 1 - m
    }
}

/// Bilinear resample of a grayscale buffer (half-pixel centers).
pub(crate) fn resize_bilinear(
    src: &[u8],
    width: usize,
    height: usize,
    new_w: usize,
    new_h: usize,
) -> Vec<u8> {
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;
    let mut out = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let top = src[y0 * width + x0] as f32 * (1.0 - fx) + src[y0 * width + x1] as f32 * fx;
            let bot = src[y1 * width + x0] as f32 * (1.0 - fx) + src[y1 * width + x1] as f32 * fx;
            out[y * new_w + x] = (top * (1.0 - fy) + bot * fy).round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::horizontal_gradient;

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = FaceImage::new(vec![0; 5], 2, 2).unwrap_err();
        assert!(matches!(err, ImageError::InvalidLength { expected: 4, actual: 5 }));
        assert!(matches!(FaceImage::new(vec![], 0, 3), Err(ImageError::Empty)));
    }

    #[test]
    fn test_png_decode_roundtrip_preserves_pixels() {
        let img = horizontal_gradient(32, 24);
        let decoded = FaceImage::decode(&img.encode_png().unwrap()).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            FaceImage::decode(b"definitely not an image"),
            Err(ImageError::Decode(_))
        ));
    }

    #[test]
    fn test_from_base64_data_url() {
        let img = horizontal_gradient(8, 8);
        let encoded = base64::engine::general_purpose::STANDARD.encode(img.encode_png().unwrap());
        let url = format!("data:image/png;base64,{encoded}");
        assert_eq!(FaceImage::from_base64(&url).unwrap(), img);
        assert_eq!(FaceImage::from_base64(&encoded).unwrap(), img);
    }

    #[test]
    fn test_reflect_indices() {
        // BORDER_REFLECT: fedcba|abcdef|fedcba
        let n = 4;
        let mapped: Vec<i64> = (-4..8).map(|i| reflect(i, n)).collect();
        assert_eq!(mapped, vec![3, 2, 1, 0, 0, 1, 2, 3, 3, 2, 1, 0]);
        assert_eq!(reflect(-7, 1), 0);
    }

    #[test]
    fn test_identity_warp_is_exact() {
        let img = horizontal_gradient(20, 10);
        let out = img.warp(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], 20, 10, Border::Reflect);
        assert_eq!(out, img);
    }

    #[test]
    fn test_warp_constant_border_fills_outside() {
        let img = FaceImage::new(vec![200; 16], 4, 4).unwrap();
        // Shift the source 10 px right: every output pixel samples outside.
        let out = img.warp(&[1.0, 0.0, 10.0, 0.0, 1.0, 0.0], 4, 4, Border::Constant(7));
        assert!(out.data.iter().all(|&p| p == 7));
    }

    #[test]
    fn test_warp_reflect_has_no_black_edges() {
        let img = FaceImage::new(vec![180; 100], 10, 10).unwrap();
        let out = img.warp(&[1.0, 0.0, -3.0, 0.0, 1.0, 4.0], 10, 10, Border::Reflect);
        assert!(out.data.iter().all(|&p| p == 180));
    }

    #[test]
    fn test_flip_horizontal() {
        let img = FaceImage::new(vec![1, 2, 3, 4, 5, 6], 3, 2).unwrap();
        assert_eq!(img.flip_horizontal().data, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_crop_clips_to_bounds() {
        let img = FaceImage::new((0..16).collect(), 4, 4).unwrap();
        let c = img.crop(2, 1, 10, 2);
        assert_eq!((c.width, c.height), (2, 2));
        assert_eq!(c.data, vec![6, 7, 10, 11]);
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let img = FaceImage::new(vec![128; 100 * 100], 100, 100).unwrap();
        let out = img.resize(200, 150);
        assert_eq!((out.width, out.height), (200, 150));
        assert!(out.data.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_avg_brightness() {
        let img = FaceImage::new(vec![0, 100, 200, 100], 2, 2).unwrap();
        assert!((img.avg_brightness() - 100.0).abs() < 1e-6);
    }
}
