//! Tile augmentation
//!
//! Training tiles get three independent geometric transforms (transpose,
//! vertical flip, horizontal flip), each with its own probability. None of
//! them alter pixel values, so stain colour is untouched. Validation tiles
//! are never augmented.

use image::DynamicImage;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Per-transform probabilities
#[derive(Clone, Debug, PartialEq)]
pub struct AugmentationConfig {
    /// Probability of swapping the x and y axes
    pub transpose_prob: f64,
    /// Probability of a top-bottom flip
    pub vertical_flip_prob: f64,
    /// Probability of a left-right flip
    pub horizontal_flip_prob: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self::train()
    }
}

impl AugmentationConfig {
    /// Train-time transform set, every transform at p = 0.5
    pub fn train() -> Self {
        Self {
            transpose_prob: 0.5,
            vertical_flip_prob: 0.5,
            horizontal_flip_prob: 0.5,
        }
    }

    /// Identity (validation and inference)
    pub fn none() -> Self {
        Self {
            transpose_prob: 0.0,
            vertical_flip_prob: 0.0,
            horizontal_flip_prob: 0.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.transpose_prob <= 0.0
            && self.vertical_flip_prob <= 0.0
            && self.horizontal_flip_prob <= 0.0
    }
}

/// Applies an [`AugmentationConfig`] to tile images
#[derive(Clone, Debug)]
pub struct TileAugmenter {
    config: AugmentationConfig,
}

impl TileAugmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    /// Randomly transform one tile
    ///
    /// Always draws three values from `rng` so the random stream does not
    /// depend on which transforms fired.
    pub fn augment(&self, img: DynamicImage, rng: &mut ChaCha8Rng) -> DynamicImage {
        let transpose = rng.gen_bool(self.config.transpose_prob.clamp(0.0, 1.0));
        let vflip = rng.gen_bool(self.config.vertical_flip_prob.clamp(0.0, 1.0));
        let hflip = rng.gen_bool(self.config.horizontal_flip_prob.clamp(0.0, 1.0));

        let mut result = img;
        if transpose {
            result = transpose_image(&result);
        }
        if vflip {
            result = result.flipv();
        }
        if hflip {
            result = result.fliph();
        }
        result
    }
}

/// Swap the x and y axes (`out(x, y) = in(y, x)`)
pub fn transpose_image(img: &DynamicImage) -> DynamicImage {
    // clockwise rotation maps (x, y) to (h-1-y, x); the mirror undoes the h-1-y
    img.rotate90().fliph()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use rand::SeedableRng;

    fn gradient_tile(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                img.put_pixel(x, y, Rgb([(x * 40) as u8, (y * 40) as u8, 7]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_transpose_swaps_axes() {
        let img = gradient_tile(3, 2);
        let transposed = transpose_image(&img);

        assert_eq!(transposed.dimensions(), (2, 3));
        for y in 0..2 {
            for x in 0..3 {
                assert_eq!(img.get_pixel(x, y), transposed.get_pixel(y, x));
            }
        }
    }

    #[test]
    fn test_identity_config_leaves_tile_unchanged() {
        let augmenter = TileAugmenter::new(AugmentationConfig::none());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let img = gradient_tile(4, 4);

        for _ in 0..10 {
            let out = augmenter.augment(img.clone(), &mut rng);
            assert_eq!(out.to_rgb8().as_raw(), img.to_rgb8().as_raw());
        }
    }

    #[test]
    fn test_same_seed_same_transform() {
        let augmenter = TileAugmenter::new(AugmentationConfig::train());
        let img = gradient_tile(4, 4);

        let mut a = ChaCha8Rng::seed_from_u64(11);
        let mut b = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..8 {
            let left = augmenter.augment(img.clone(), &mut a);
            let right = augmenter.augment(img.clone(), &mut b);
            assert_eq!(left.to_rgb8().as_raw(), right.to_rgb8().as_raw());
        }
    }

    #[test]
    fn test_train_config_eventually_changes_tile() {
        let augmenter = TileAugmenter::new(AugmentationConfig::train());
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let img = gradient_tile(4, 4);

        let changed = (0..20)
            .map(|_| augmenter.augment(img.clone(), &mut rng))
            .any(|out| out.to_rgb8().as_raw() != img.to_rgb8().as_raw());
        assert!(changed);
    }
}
