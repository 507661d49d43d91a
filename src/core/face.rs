use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Face model unavailable: {0}")]
    Model(String),

    #[error("Inference failed: {0}")]
    Inference(#[from] ort::Error),

    #[error("Face box {0:?} lies outside the image")]
    OutOfBounds(FaceBox),

    #[error("Face crop has no usable contrast")]
    DegenerateCrop,
}

/// A detected face, in pixel coordinates of the analysed image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f64,
}

impl FaceBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Detector output for one image: its size and the boxes in detector order.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub width: u32,
    pub height: u32,
    pub faces: Vec<FaceBox>,
}

impl Detection {
    pub fn image_area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Face embedding vector. Distances are Euclidean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn distance(&self, other: &Embedding) -> f32 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }

    /// `1 − distance`; meaningful for embeddings whose distances lie in `[0, 2]`.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        1.0 - self.distance(other)
    }

    /// Scale to unit length. `None` for an all-zero vector.
    pub fn normalized(values: Vec<f32>) -> Option<Embedding> {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm < 1e-6 {
            return None;
        }
        Some(Embedding(values.into_iter().map(|v| v / norm).collect()))
    }
}

/// Euclidean distance between two unit vectors with cosine similarity `cosine`.
pub fn distance_for_cosine(cosine: f32) -> f32 {
    (2.0 - 2.0 * cosine.clamp(-1.0, 1.0)).sqrt()
}

/// [`Embedding::similarity`] between two unit vectors with cosine similarity `cosine`.
pub fn similarity_for_cosine(cosine: f32) -> f32 {
    1.0 - distance_for_cosine(cosine)
}

pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, FaceError>;
}

pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, image: &DynamicImage, face: &FaceBox) -> Result<Embedding, FaceError>;
}

/// Crop `face` out of `image`, growing the box by `padding` × its size in
/// total per dimension (half on each side), clamped to the image.
pub fn crop_face(
    image: &DynamicImage,
    face: &FaceBox,
    padding: f32,
) -> Result<DynamicImage, FaceError> {
    let (width, height) = image.dimensions();
    if face.width == 0 || face.height == 0 || face.x >= width || face.y >= height {
        return Err(FaceError::OutOfBounds(*face));
    }

    let pad_x = (face.width as f32 * padding.max(0.0) / 2.0).round() as u32;
    let pad_y = (face.height as f32 * padding.max(0.0) / 2.0).round() as u32;

    let left = face.x.saturating_sub(pad_x);
    let top = face.y.saturating_sub(pad_y);
    let right = (face.x + face.width + pad_x).min(width);
    let bottom = (face.y + face.height + pad_y).min(height);

    Ok(image.crop_imm(left, top, right - left, bottom - top))
}
