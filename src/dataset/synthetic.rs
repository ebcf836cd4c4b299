//! Synthetic pavement image generation.
//!
//! Each condition class gets a statistical signature on top of an
//! asphalt base texture: wear discs, crack patterns of increasing
//! severity, and potholes for failed surfaces. Generation is fully
//! deterministic in (class, sample index, seed), so a dataset can be
//! reproduced from its config alone.

use std::path::Path;

use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{ConditionClass, CrackType, Provenance, Sample};
use crate::error::Result;
use crate::{DEFAULT_IMAGE_SIZE, IMAGE_CHANNELS};

/// Reference side length the severity geometry is calibrated against.
const REFERENCE_SIZE: usize = 224;

/// Configuration for synthetic dataset generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Samples generated for each condition class
    pub samples_per_class: usize,
    /// Square image side length
    pub image_size: usize,
    /// Master seed; every sample derives its own stream from it
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            samples_per_class: 500,
            image_size: DEFAULT_IMAGE_SIZE,
            seed: 42,
        }
    }
}

/// Grayscale drawing surface. Pavement distress is achromatic, so all
/// drawing happens on one channel and fans out to RGB at the end.
struct Canvas {
    size: usize,
    px: Vec<u8>,
}

impl Canvas {
    fn new(size: usize, fill: u8) -> Self {
        Self {
            size,
            px: vec![fill; size * size],
        }
    }

    fn get(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.size as i32 - 1) as usize;
        let y = y.clamp(0, self.size as i32 - 1) as usize;
        self.px[y * self.size + x]
    }

    fn set(&mut self, x: i32, y: i32, value: u8) {
        if x >= 0 && y >= 0 && (x as usize) < self.size && (y as usize) < self.size {
            self.px[y as usize * self.size + x as usize] = value;
        }
    }

    fn fill_disc(&mut self, cx: i32, cy: i32, radius: i32, value: u8) {
        let r2 = radius * radius;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= r2 {
                    self.set(cx + dx, cy + dy, value);
                }
            }
        }
    }

    /// Bresenham line stamped with a disc for thickness.
    fn line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, width: i32, value: u8) {
        let (mut x, mut y) = (x0, y0);
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let radius = (width / 2).max(0);

        loop {
            if radius == 0 {
                self.set(x, y, value);
            } else {
                self.fill_disc(x, y, radius, value);
            }
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }
}

/// Scale a length calibrated for the reference size to the actual size.
fn scaled(value: i32, size: usize) -> i32 {
    (value * size as i32 / REFERENCE_SIZE as i32).max(1)
}

/// Scale a count calibrated for the reference area to the actual area.
fn scaled_count(count: usize, size: usize) -> usize {
    (count * size * size / (REFERENCE_SIZE * REFERENCE_SIZE)).max(1)
}

/// Dark grey asphalt base with texture noise and aggregate speckles.
fn base_pavement(size: usize, rng: &mut ChaCha8Rng) -> Canvas {
    let base: u8 = rng.gen_range(40..80);
    let mut canvas = Canvas::new(size, base);

    for v in canvas.px.iter_mut() {
        let noise: i16 = rng.gen_range(-20..20);
        *v = (*v as i16 + noise).clamp(0, 255) as u8;
    }

    // Aggregate texture, roughly one speckle per kilopixel
    for _ in 0..(size * size / 1000).max(1) {
        let x = rng.gen_range(0..size as i32);
        let y = rng.gen_range(0..size as i32);
        let radius = rng.gen_range(1..=scaled(3, size));
        let color: u8 = rng.gen_range(60..120);
        canvas.fill_disc(x, y, radius, color);
    }

    canvas
}

fn add_wear(canvas: &mut Canvas, rng: &mut ChaCha8Rng, count: (usize, usize), disc: (i32, i32), darken: (i16, i16)) {
    let size = canvas.size;
    let n = rng.gen_range(scaled_count(count.0, size)..=scaled_count(count.1, size));
    for _ in 0..n {
        let x = rng.gen_range(0..size as i32);
        let y = rng.gen_range(0..size as i32);
        let radius = rng.gen_range(scaled(disc.0, size)..=scaled(disc.1, size));
        let delta = if darken.0 == darken.1 {
            darken.0
        } else {
            rng.gen_range(darken.0..=darken.1)
        };
        let value = (canvas.get(x, y) as i16 - delta).clamp(0, 255) as u8;
        canvas.fill_disc(x, y, radius, value);
    }
}

fn add_hairline_cracks(canvas: &mut Canvas, rng: &mut ChaCha8Rng) {
    let size = canvas.size as i32;
    for _ in 0..rng.gen_range(2..=5) {
        let sx = rng.gen_range(0..size);
        let sy = rng.gen_range(0..size);
        let ex = (sx + rng.gen_range(-scaled(50, canvas.size)..=scaled(50, canvas.size))).clamp(0, size - 1);
        let ey = (sy + rng.gen_range(-scaled(20, canvas.size)..=scaled(20, canvas.size))).clamp(0, size - 1);
        canvas.line(sx, sy, ex, ey, 1, 30);
    }
}

fn add_moderate_cracks(canvas: &mut Canvas, rng: &mut ChaCha8Rng) {
    add_hairline_cracks(canvas, rng);
    let size = canvas.size as i32;
    for _ in 0..rng.gen_range(3..=7) {
        let sx = rng.gen_range(0..size);
        let sy = rng.gen_range(0..size);
        let ex = (sx + rng.gen_range(-scaled(80, canvas.size)..=scaled(80, canvas.size))).clamp(0, size - 1);
        let ey = (sy + rng.gen_range(-scaled(40, canvas.size)..=scaled(40, canvas.size))).clamp(0, size - 1);
        canvas.line(sx, sy, ex, ey, rng.gen_range(2..=scaled(4, canvas.size).max(2)), 25);
    }
}

fn add_severe_cracks(canvas: &mut Canvas, rng: &mut ChaCha8Rng) {
    add_moderate_cracks(canvas, rng);
    let size = canvas.size as i32;
    for _ in 0..rng.gen_range(5..=10) {
        let sx = rng.gen_range(0..size);
        let sy = rng.gen_range(0..size);
        let ex = (sx + rng.gen_range(-scaled(100, canvas.size)..=scaled(100, canvas.size))).clamp(0, size - 1);
        let ey = (sy + rng.gen_range(-scaled(60, canvas.size)..=scaled(60, canvas.size))).clamp(0, size - 1);
        canvas.line(sx, sy, ex, ey, rng.gen_range(scaled(4, canvas.size)..=scaled(8, canvas.size)), 15);
    }
}

fn draw_longitudinal(canvas: &mut Canvas, rng: &mut ChaCha8Rng) {
    let size = canvas.size as i32;
    for _ in 0..rng.gen_range(1..=3) {
        let start_x = rng.gen_range(size / 4..3 * size / 4);
        let width = rng.gen_range(2..=scaled(6, canvas.size).max(2));
        let step = scaled(10, canvas.size);
        let jitter = scaled(15, canvas.size);

        let mut prev = (start_x, 0);
        let mut y = step;
        while y < size {
            let x = (start_x + rng.gen_range(-jitter..=jitter)).clamp(0, size - 1);
            canvas.line(prev.0, prev.1, x, y, width, 20);
            prev = (x, y);
            y += step;
        }
    }
}

fn draw_transverse(canvas: &mut Canvas, rng: &mut ChaCha8Rng) {
    let size = canvas.size as i32;
    for _ in 0..rng.gen_range(1..=2) {
        let start_y = rng.gen_range(size / 4..3 * size / 4);
        let width = rng.gen_range(2..=scaled(5, canvas.size).max(2));
        let step = scaled(10, canvas.size);
        let jitter = scaled(10, canvas.size);

        let mut prev = (0, start_y);
        let mut x = step;
        while x < size {
            let y = (start_y + rng.gen_range(-jitter..=jitter)).clamp(0, size - 1);
            canvas.line(prev.0, prev.1, x, y, width, 15);
            prev = (x, y);
            x += step;
        }
    }
}

fn draw_alligator(canvas: &mut Canvas, rng: &mut ChaCha8Rng) {
    let size = canvas.size as i32;
    let cx = rng.gen_range(size / 4..3 * size / 4);
    let cy = rng.gen_range(size / 4..3 * size / 4);
    let near = scaled(50, canvas.size);
    let far = scaled(80, canvas.size);

    for _ in 0..rng.gen_range(8..=15) {
        let sx = (cx + rng.gen_range(-near..=near)).clamp(0, size - 1);
        let sy = (cy + rng.gen_range(-near..=near)).clamp(0, size - 1);
        let ex = (cx + rng.gen_range(-far..=far)).clamp(0, size - 1);
        let ey = (cy + rng.gen_range(-far..=far)).clamp(0, size - 1);
        canvas.line(sx, sy, ex, ey, rng.gen_range(2..=scaled(4, canvas.size).max(2)), 25);
    }
}

fn draw_block(canvas: &mut Canvas, rng: &mut ChaCha8Rng) {
    let size = canvas.size as i32;
    let block_x = rng.gen_range(scaled(30, canvas.size)..=scaled(60, canvas.size));
    let block_y = rng.gen_range(scaled(30, canvas.size)..=scaled(60, canvas.size));
    let jitter = scaled(5, canvas.size);

    let mut x = block_x;
    while x < size {
        let xv = x + rng.gen_range(-jitter..=jitter);
        canvas.line(xv, 0, xv, size - 1, rng.gen_range(1..=scaled(3, canvas.size)), 20);
        x += block_x;
    }
    let mut y = block_y;
    while y < size {
        let yv = y + rng.gen_range(-jitter..=jitter);
        canvas.line(0, yv, size - 1, yv, rng.gen_range(1..=scaled(3, canvas.size)), 20);
        y += block_y;
    }
}

fn draw_potholes(canvas: &mut Canvas, rng: &mut ChaCha8Rng, count: (usize, usize)) {
    let size = canvas.size as i32;
    let margin = scaled(30, canvas.size).min(size / 3);

    for _ in 0..rng.gen_range(count.0..=count.1) {
        let cx = rng.gen_range(margin..(size - margin).max(margin + 1));
        let cy = rng.gen_range(margin..(size - margin).max(margin + 1));
        let radius = rng.gen_range(scaled(15, canvas.size)..=scaled(35, canvas.size));
        let wobble = scaled(8, canvas.size);

        // Irregular rim: per-sector radius jitter, then a darker core
        let jitters: Vec<i32> = (0..18).map(|_| rng.gen_range(-wobble..=wobble)).collect();
        let reach = radius + wobble;
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let dist = ((dx * dx + dy * dy) as f64).sqrt();
                let angle = (dy as f64).atan2(dx as f64).to_degrees().rem_euclid(360.0);
                let sector = (angle / 20.0) as usize % 18;
                if dist <= (radius + jitters[sector]) as f64 {
                    canvas.set(cx + dx, cy + dy, 10);
                }
            }
        }
        canvas.fill_disc(cx, cy, radius / 2, 5);
    }
}

/// Draw the distress signature for one condition class, returning the
/// dominant crack type visible in the image.
fn apply_condition(canvas: &mut Canvas, condition: ConditionClass, rng: &mut ChaCha8Rng) -> CrackType {
    match condition {
        ConditionClass::Excellent => CrackType::NoCracks,
        ConditionClass::Good => {
            add_wear(canvas, rng, (20, 50), (3, 8), (15, 15));
            CrackType::NoCracks
        }
        ConditionClass::Fair => {
            add_wear(canvas, rng, (50, 100), (5, 15), (10, 25));
            if rng.gen_bool(0.5) {
                draw_longitudinal(canvas, rng);
                CrackType::Longitudinal
            } else {
                draw_transverse(canvas, rng);
                CrackType::Transverse
            }
        }
        ConditionClass::Poor => {
            add_moderate_cracks(canvas, rng);
            add_wear(canvas, rng, (100, 200), (8, 20), (30, 30));
            if rng.gen_bool(0.5) {
                draw_alligator(canvas, rng);
                CrackType::Alligator
            } else {
                draw_block(canvas, rng);
                CrackType::Block
            }
        }
        ConditionClass::Failed => {
            add_severe_cracks(canvas, rng);
            draw_potholes(canvas, rng, (1, 4));
            add_wear(canvas, rng, (200, 400), (10, 30), (40, 40));
            CrackType::Pothole
        }
    }
}

/// Generate one synthetic sample. Deterministic in (condition, index, seed).
pub fn generate_sample(
    condition: ConditionClass,
    index: usize,
    config: &SyntheticConfig,
) -> Sample {
    // Independent stream per sample so ordering never matters
    let stream = config
        .seed
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add((condition.index() as u64) << 32)
        .wrapping_add(index as u64);
    let mut rng = ChaCha8Rng::seed_from_u64(stream);

    let mut canvas = base_pavement(config.image_size, &mut rng);
    let crack = apply_condition(&mut canvas, condition, &mut rng);

    let size = config.image_size;
    let mut pixels = vec![0.0f32; IMAGE_CHANNELS * size * size];
    for (i, v) in canvas.px.iter().enumerate() {
        let value = *v as f32 / 255.0;
        for c in 0..IMAGE_CHANNELS {
            pixels[c * size * size + i] = value;
        }
    }

    let id = (condition.index() as u64) * 1_000_000 + index as u64;
    Sample::new(id, pixels, size, condition, Some(crack), Provenance::Synthetic)
}

/// Generate `samples_per_class` samples for every condition class.
pub fn generate_synthetic_dataset(config: &SyntheticConfig) -> Vec<Sample> {
    info!(
        "Generating synthetic dataset: {} samples/class at {}px (seed {})",
        config.samples_per_class, config.image_size, config.seed
    );

    let mut samples = Vec::with_capacity(config.samples_per_class * ConditionClass::ALL.len());
    for condition in ConditionClass::ALL {
        for i in 0..config.samples_per_class {
            samples.push(generate_sample(condition, i, config));
        }
    }
    samples
}

/// Export samples as PNG files under `<dir>/<condition>/`, with a
/// metadata file describing the generation parameters.
pub fn export_png_dataset(samples: &[Sample], config: &SyntheticConfig, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    for sample in samples {
        let class_dir = dir.join(sample.condition.as_str());
        std::fs::create_dir_all(&class_dir)?;

        let size = sample.size;
        let mut img = RgbImage::new(size as u32, size as u32);
        for y in 0..size {
            for x in 0..size {
                let r = (sample.pixels[y * size + x] * 255.0) as u8;
                let g = (sample.pixels[size * size + y * size + x] * 255.0) as u8;
                let b = (sample.pixels[2 * size * size + y * size + x] * 255.0) as u8;
                img.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
            }
        }
        img.save(class_dir.join(format!("{}_{:05}.png", sample.condition.as_str(), sample.id % 1_000_000)))?;
    }

    let metadata = serde_json::json!({
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "samples_per_class": config.samples_per_class,
        "image_size": config.image_size,
        "seed": config.seed,
        "condition_classes": ConditionClass::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        "total_images": samples.len(),
    });
    std::fs::write(
        dir.join("dataset_metadata.json"),
        serde_json::to_string_pretty(&metadata)?,
    )?;

    info!("Exported {} PNGs to {}", samples.len(), dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            samples_per_class: 4,
            image_size: 32,
            seed: 42,
        }
    }

    #[test]
    fn test_generation_deterministic() {
        let config = small_config();
        let a = generate_sample(ConditionClass::Poor, 2, &config);
        let b = generate_sample(ConditionClass::Poor, 2, &config);
        assert_eq!(a.pixels, b.pixels);
        assert_eq!(a.crack, b.crack);

        let other_seed = SyntheticConfig { seed: 43, ..config };
        let c = generate_sample(ConditionClass::Poor, 2, &other_seed);
        assert_ne!(a.pixels, c.pixels);
    }

    #[test]
    fn test_dataset_shape_and_labels() {
        let config = small_config();
        let samples = generate_synthetic_dataset(&config);
        assert_eq!(samples.len(), 4 * 5);

        for sample in &samples {
            assert_eq!(sample.pixels.len(), 3 * 32 * 32);
            assert!(sample.crack.is_some());
            assert_eq!(sample.provenance, Provenance::Synthetic);
        }

        let excellent: Vec<_> = samples
            .iter()
            .filter(|s| s.condition == ConditionClass::Excellent)
            .collect();
        assert!(excellent.iter().all(|s| s.crack == Some(CrackType::NoCracks)));

        let failed: Vec<_> = samples
            .iter()
            .filter(|s| s.condition == ConditionClass::Failed)
            .collect();
        assert!(failed.iter().all(|s| s.crack == Some(CrackType::Pothole)));
    }

    #[test]
    fn test_failed_darker_than_excellent() {
        let config = SyntheticConfig {
            samples_per_class: 8,
            image_size: 32,
            seed: 7,
        };
        let mean = |s: &Sample| s.pixels.iter().sum::<f32>() / s.pixels.len() as f32;

        let avg_excellent: f32 = (0..8)
            .map(|i| mean(&generate_sample(ConditionClass::Excellent, i, &config)))
            .sum::<f32>()
            / 8.0;
        let avg_failed: f32 = (0..8)
            .map(|i| mean(&generate_sample(ConditionClass::Failed, i, &config)))
            .sum::<f32>()
            / 8.0;

        assert!(avg_failed < avg_excellent);
    }

    #[test]
    fn test_png_export() {
        let config = SyntheticConfig {
            samples_per_class: 1,
            image_size: 16,
            seed: 1,
        };
        let samples = generate_synthetic_dataset(&config);
        let dir = tempfile::tempdir().unwrap();

        export_png_dataset(&samples, &config, dir.path()).unwrap();

        assert!(dir.path().join("excellent").exists());
        assert!(dir.path().join("dataset_metadata.json").exists());
        let pngs: Vec<_> = std::fs::read_dir(dir.path().join("failed"))
            .unwrap()
            .collect();
        assert_eq!(pngs.len(), 1);
    }
}
