//! Synthetic images and a model-free embedder shared by the unit tests.

use crate::core::face::{Embedding, FaceBox, FaceEmbedder, FaceError, crop_face};
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgb};
use std::path::{Path, PathBuf};

const PIXEL_EMBEDDING_SIDE: u32 = 16;

/// Pseudo-random image made of `block`-sized tiles, fully determined by `seed`.
pub(crate) fn block_noise_image(seed: u64, width: u32, height: u32, block: u32) -> DynamicImage {
    let block = block.max(1);
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let v = mix(seed, (x / block) as u64, (y / block) as u64).to_le_bytes();
        Rgb([v[0], v[1], v[2]])
    });
    DynamicImage::ImageRgb8(img)
}

pub(crate) fn gradient_image(width: u32, height: u32) -> DynamicImage {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let intensity = ((x + y) % 256) as u8;
        Rgb([intensity, intensity, intensity])
    });
    DynamicImage::ImageRgb8(img)
}

pub(crate) fn checker_image(width: u32, height: u32, cell: u32) -> DynamicImage {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        if ((x / cell) + (y / cell)) % 2 == 0 {
            Rgb([230u8, 230, 230])
        } else {
            Rgb([20u8, 20, 20])
        }
    });
    DynamicImage::ImageRgb8(img)
}

pub(crate) fn write_png(dir: &Path, name: &str, image: &DynamicImage) -> PathBuf {
    let path = dir.join(name);
    image.save(&path).unwrap();
    path
}

/// Model-free embedder over the raw pixels of the face crop.
///
/// The crop is reduced to a 16×16 grayscale patch, mean-centred and scaled
/// to unit length. Only the same photo of a face lands close to itself.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PixelEmbedder;

impl FaceEmbedder for PixelEmbedder {
    fn embed(&self, image: &DynamicImage, face: &FaceBox) -> Result<Embedding, FaceError> {
        let crop = crop_face(image, face, 0.0)?;
        let patch = crop
            .resize_exact(PIXEL_EMBEDDING_SIDE, PIXEL_EMBEDDING_SIDE, FilterType::Triangle)
            .to_luma8();

        let values: Vec<f32> = patch.as_raw().iter().map(|&p| f32::from(p)).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        Embedding::normalized(values.iter().map(|v| v - mean).collect())
            .ok_or(FaceError::DegenerateCrop)
    }
}

fn mix(seed: u64, x: u64, y: u64) -> u64 {
    let mut z = seed
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(x.wrapping_mul(0xBF58_476D_1CE4_E5B9))
        .wrapping_add(y.wrapping_mul(0x94D0_49BB_1331_11EB));
    z ^= z >> 30;
    z = z.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z ^= z >> 27;
    z = z.wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
