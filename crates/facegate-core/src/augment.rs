//! Synthetic enrollment samples: seeded geometric and photometric perturbation.
//!
//! Each call draws its parameters from a `StdRng` seeded with the caller's
//! seed, so `augment(image, seed)` is pixel-for-pixel reproducible. The
//! perturbations run in a fixed order: rotation, flip, brightness, noise,
//! crop.

use crate::image::{Border, FaceImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::fmt;
use std::str::FromStr;

/// Preset perturbation strengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AugmentProfile {
    /// Rotation, flip and a mild brightness change.
    #[default]
    Standard,
    /// Wider brightness range plus Gaussian noise and a center crop.
    Heavy,
}

impl FromStr for AugmentProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(AugmentProfile::Standard),
            "heavy" => Ok(AugmentProfile::Heavy),
            other => Err(format!("unknown augment profile '{other}' (expected standard or heavy)")),
        }
    }
}

impl fmt::Display for AugmentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AugmentProfile::Standard => "standard",
            AugmentProfile::Heavy => "heavy",
        })
    }
}

/// Ranges and gate probabilities for each perturbation.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentConfig {
    /// Rotation angle is uniform in `[-max, +max]` degrees.
    pub max_rotation_deg: f32,
    pub flip_probability: f64,
    /// Multiplicative brightness factor range.
    pub brightness_range: (f32, f32),
    pub brightness_probability: f64,
    pub noise_probability: f64,
    /// Standard deviation of the additive noise, in gray levels.
    pub noise_std: f32,
    pub crop_probability: f64,
    /// Fraction of each side trimmed by the center crop.
    pub crop_range: (f32, f32),
}

impl AugmentConfig {
    pub fn standard() -> Self {
        Self {
            max_rotation_deg: 15.0,
            flip_probability: 0.5,
            brightness_range: (0.8, 1.2),
            brightness_probability: 0.6,
            noise_probability: 0.0,
            noise_std: 8.0,
            crop_probability: 0.0,
            crop_range: (0.05, 0.15),
        }
    }

    pub fn heavy() -> Self {
        Self {
            brightness_range: (0.7, 1.3),
            noise_probability: 0.3,
            crop_probability: 0.4,
            ..Self::standard()
        }
    }

    /// Draw one set of perturbation parameters.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> AugmentParams {
        let max = self.max_rotation_deg.abs();
        let angle_deg = rng.gen_range(-max..=max);
        let flip = rng.gen_bool(self.flip_probability.clamp(0.0, 1.0));

        let brightness = rng
            .gen_bool(self.brightness_probability.clamp(0.0, 1.0))
            .then(|| rng.gen_range(ordered(self.brightness_range)));
        let noise_std = rng
            .gen_bool(self.noise_probability.clamp(0.0, 1.0))
            .then_some(self.noise_std);
        let crop = rng.gen_bool(self.crop_probability.clamp(0.0, 1.0)).then(|| {
            let range = ordered(self.crop_range);
            (rng.gen_range(range.clone()), rng.gen_range(range))
        });

        AugmentParams {
            angle_deg,
            flip,
            brightness,
            noise_std,
            crop,
        }
    }
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl From<AugmentProfile> for AugmentConfig {
    fn from(profile: AugmentProfile) -> Self {
        match profile {
            AugmentProfile::Standard => Self::standard(),
            AugmentProfile::Heavy => Self::heavy(),
        }
    }
}

fn ordered((a, b): (f32, f32)) -> std::ops::RangeInclusive<f32> {
    a.min(b)..=a.max(b)
}

/// Parameters drawn for one synthetic sample.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentParams {
    pub angle_deg: f32,
    pub flip: bool,
    pub brightness: Option<f32>,
    pub noise_std: Option<f32>,
    /// Fraction trimmed from the (left/right, top/bottom) edges.
    pub crop: Option<(f32, f32)>,
}

/// Seed used for synthetic sample `index` of an enrollment seeded with `base`.
pub fn sample_seed(base: u64, index: usize) -> u64 {
    base.wrapping_add(index as u64)
}

/// Produces perturbed copies of a source image.
#[derive(Debug, Clone, Default)]
pub struct Augmenter {
    config: AugmentConfig,
}

impl Augmenter {
    pub fn new(config: AugmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.config
    }

    /// One perturbed copy; identical seeds give identical pixels.
    pub fn augment(&self, image: &FaceImage, seed: u64) -> FaceImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let params = self.config.sample(&mut rng);
        tracing::trace!(seed, ?params, "augment");
        apply(image, &params, &mut rng)
    }

    /// Lazy, unbounded sequence of perturbed copies; item `i` equals
    /// `augment(image, sample_seed(seed, i))`.
    pub fn variants<'a>(&'a self, image: &'a FaceImage, seed: u64) -> Variants<'a> {
        Variants {
            augmenter: self,
            source: image,
            seed,
            index: 0,
        }
    }
}

/// Iterator returned by [`Augmenter::variants`].
pub struct Variants<'a> {
    augmenter: &'a Augmenter,
    source: &'a FaceImage,
    seed: u64,
    index: usize,
}

impl Iterator for Variants<'_> {
    type Item = FaceImage;

    fn next(&mut self) -> Option<FaceImage> {
        let out = self
            .augmenter
            .augment(self.source, sample_seed(self.seed, self.index));
        self.index += 1;
        Some(out)
    }
}

/// Apply drawn parameters. `rng` is only consumed by the noise step.
pub fn apply<R: Rng>(image: &FaceImage, params: &AugmentParams, rng: &mut R) -> FaceImage {
    let mut out = rotate(image, params.angle_deg);
    if params.flip {
        out = out.flip_horizontal();
    }
    if let Some(factor) = params.brightness {
        scale_brightness(&mut out, factor);
    }
    if let Some(std) = params.noise_std {
        add_noise(&mut out, std, rng);
    }
    if let Some((fx, fy)) = params.crop {
        out = crop_and_resize(&out, fx, fy);
    }
    out
}

/// Rotate about the image center, counter-clockwise for positive angles,
/// filling uncovered corners by reflection.
pub fn rotate(image: &FaceImage, angle_deg: f32) -> FaceImage {
    if angle_deg == 0.0 {
        return image.clone();
    }
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let cx = image.width as f32 / 2.0;
    let cy = image.height as f32 / 2.0;
    let inverse = [
        cos,
        -sin,
        cx - cos * cx + sin * cy,
        sin,
        cos,
        cy - sin * cx - cos * cy,
    ];
    image.warp(&inverse, image.width, image.height, Border::Reflect)
}

/// Multiply every pixel by `factor`, saturating at 0 and 255.
pub fn scale_brightness(image: &mut FaceImage, factor: f32) {
    for p in image.data.iter_mut() {
        *p = (*p as f32 * factor).round().clamp(0.0, 255.0) as u8;
    }
}

/// Add zero-mean Gaussian noise, saturating at 0 and 255.
pub fn add_noise<R: Rng>(image: &mut FaceImage, std: f32, rng: &mut R) {
    let normal = match Normal::new(0.0f32, std) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(std, error = %e, "invalid noise deviation; skipping noise");
            return;
        }
    };
    for p in image.data.iter_mut() {
        *p = (*p as f32 + normal.sample(rng)).round().clamp(0.0, 255.0) as u8;
    }
}

/// Trim `fx`/`fy` of the width/height from each side, then scale back up.
pub fn crop_and_resize(image: &FaceImage, fx: f32, fy: f32) -> FaceImage {
    let dx = (image.width as f32 * fx.clamp(0.0, 0.49)) as u32;
    let dy = (image.height as f32 * fy.clamp(0.0, 0.49)) as u32;
    let w = image.width.saturating_sub(2 * dx).max(1);
    let h = image.height.saturating_sub(2 * dy).max(1);
    image.crop(dx, dy, w, h).resize(image.width, image.height)
}
