//! Image preprocessing and augmentation.
//!
//! `preprocess` is the single entry point turning raw image bytes into
//! the CHW float layout every backbone consumes. It is pure: equal bytes
//! and target size always give equal output.

use std::io::Cursor;

use image::imageops::FilterType;
use image::ImageReader;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{PavementError, Result};
use crate::IMAGE_CHANNELS;

/// Smallest decoded side length accepted. Anything below this cannot
/// survive resampling to a backbone input.
pub const MIN_IMAGE_SIDE: u32 = 2;

/// Decode, validate, resize and scale image bytes to CHW floats in [0, 1].
pub fn preprocess(image_bytes: &[u8], target_size: usize) -> Result<Vec<f32>> {
    let decoded = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| PavementError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| PavementError::Decode(e.to_string()))?;

    let (width, height) = (decoded.width(), decoded.height());
    if width < MIN_IMAGE_SIDE || height < MIN_IMAGE_SIDE {
        return Err(PavementError::Dimension(format!(
            "{}x{} below minimum side of {}",
            width, height, MIN_IMAGE_SIDE
        )));
    }

    let rgb = decoded
        .resize_exact(target_size as u32, target_size as u32, FilterType::Lanczos3)
        .to_rgb8();

    let mut pixels = vec![0.0f32; IMAGE_CHANNELS * target_size * target_size];
    for y in 0..target_size {
        for x in 0..target_size {
            let p = rgb.get_pixel(x as u32, y as u32);
            for c in 0..IMAGE_CHANNELS {
                pixels[c * target_size * target_size + y * target_size + x] =
                    p[c] as f32 / 255.0;
            }
        }
    }

    Ok(pixels)
}

/// Augmentation knobs. All magnitudes are in [0, 1] pixel units.
#[derive(Debug, Clone)]
pub struct AugmentationPolicy {
    /// Probability of a horizontal flip
    pub flip_prob: f64,
    /// Maximum additive brightness shift
    pub brightness_delta: f32,
    /// Maximum multiplicative contrast deviation from 1.0
    pub contrast_delta: f32,
    /// Standard deviation of additive gaussian noise
    pub noise_std: f32,
}

impl Default for AugmentationPolicy {
    fn default() -> Self {
        Self {
            flip_prob: 0.5,
            brightness_delta: 0.2,
            contrast_delta: 0.2,
            noise_std: 0.02,
        }
    }
}

/// Apply the augmentation policy to a CHW buffer.
///
/// Deterministic in (input, policy, seed); results stay clamped to [0, 1].
pub fn augment(pixels: &[f32], size: usize, policy: &AugmentationPolicy, seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut out = pixels.to_vec();

    if rng.gen::<f64>() < policy.flip_prob {
        for c in 0..IMAGE_CHANNELS {
            for y in 0..size {
                let row = c * size * size + y * size;
                out[row..row + size].reverse();
            }
        }
    }

    let brightness = rng.gen_range(-policy.brightness_delta..=policy.brightness_delta);
    let contrast = 1.0 + rng.gen_range(-policy.contrast_delta..=policy.contrast_delta);

    for v in out.iter_mut() {
        *v = (*v - 0.5) * contrast + 0.5 + brightness;
    }

    if policy.noise_std > 0.0 {
        // Box-Muller pairs; one gaussian draw per pixel
        for v in out.iter_mut() {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            *v += z * policy.noise_std;
        }
    }

    for v in out.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 120, 120]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_preprocess_valid_image() {
        let bytes = png_bytes(10, 6);
        let pixels = preprocess(&bytes, 8).unwrap();
        assert_eq!(pixels.len(), 3 * 8 * 8);
        assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_preprocess_rejects_garbage() {
        let err = preprocess(b"definitely not an image", 8).unwrap_err();
        assert!(matches!(err, PavementError::Decode(_)));
    }

    #[test]
    fn test_preprocess_rejects_one_by_one() {
        let bytes = png_bytes(1, 1);
        let err = preprocess(&bytes, 8).unwrap_err();
        assert!(matches!(err, PavementError::Dimension(_)));
    }

    #[test]
    fn test_preprocess_deterministic() {
        let bytes = png_bytes(12, 12);
        assert_eq!(preprocess(&bytes, 8).unwrap(), preprocess(&bytes, 8).unwrap());
    }

    #[test]
    fn test_augment_deterministic_per_seed() {
        let pixels = vec![0.4f32; 3 * 8 * 8];
        let policy = AugmentationPolicy::default();

        let a = augment(&pixels, 8, &policy, 7);
        let b = augment(&pixels, 8, &policy, 7);
        let c = augment(&pixels, 8, &policy, 8);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_augment_stays_in_range() {
        let pixels: Vec<f32> = (0..3 * 8 * 8).map(|i| (i % 256) as f32 / 255.0).collect();
        let out = augment(&pixels, 8, &AugmentationPolicy::default(), 3);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
