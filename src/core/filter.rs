use crate::core::face::{Detection, FaceBox, FaceDetector, FaceError};
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to do with an image holding more than one valid face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiFacePolicy {
    #[default]
    Discard,
    /// Cut the image into per-face crops and judge each on its own.
    Split,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceFilterConfig {
    /// Minimum width and height of a face box, in pixels.
    pub min_face_size: u32,
    pub min_face_ratio: f64,
    pub max_face_ratio: f64,
    pub multi_face_policy: MultiFacePolicy,
    /// Fraction of the face size added around split crops.
    pub split_padding: f32,
}

impl Default for FaceFilterConfig {
    fn default() -> Self {
        Self {
            min_face_size: 80,
            min_face_ratio: 0.05,
            max_face_ratio: 0.8,
            multi_face_policy: MultiFacePolicy::Discard,
            split_padding: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FaceRejection {
    NoFace,
    FaceTooSmall,
    FaceTooLarge,
    /// Valid boxes in detector order.
    MultipleFaces(Vec<FaceBox>),
}

impl fmt::Display for FaceRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaceRejection::NoFace => write!(f, "no face"),
            FaceRejection::FaceTooSmall => write!(f, "face too small"),
            FaceRejection::FaceTooLarge => write!(f, "face too large"),
            FaceRejection::MultipleFaces(faces) => write!(f, "multiple faces ({})", faces.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FaceVerdict {
    Accept(FaceBox),
    Reject(FaceRejection),
}

/// Accepts images showing exactly one reasonably framed face.
#[derive(Debug, Clone, Default)]
pub struct SingleFaceFilter {
    config: FaceFilterConfig,
}

impl SingleFaceFilter {
    pub fn new(config: FaceFilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FaceFilterConfig {
        &self.config
    }

    /// Run `detector` over `image` and classify the result.
    pub fn filter(
        &self,
        detector: &dyn FaceDetector,
        image: &DynamicImage,
    ) -> Result<FaceVerdict, FaceError> {
        let (width, height) = image.dimensions();
        let faces = detector.detect(image)?;
        Ok(self.classify(&Detection {
            width,
            height,
            faces,
        }))
    }

    pub fn classify(&self, detection: &Detection) -> FaceVerdict {
        let min = self.config.min_face_size;
        let valid: Vec<FaceBox> = detection
            .faces
            .iter()
            .filter(|f| f.width >= min && f.height >= min)
            .copied()
            .collect();

        match valid.as_slice() {
            [] if detection.faces.is_empty() => FaceVerdict::Reject(FaceRejection::NoFace),
            [] => FaceVerdict::Reject(FaceRejection::FaceTooSmall),
            [face] => {
                let image_area = detection.image_area();
                if image_area == 0 {
                    return FaceVerdict::Reject(FaceRejection::NoFace);
                }
                let ratio = face.area() as f64 / image_area as f64;
                if ratio < self.config.min_face_ratio {
                    FaceVerdict::Reject(FaceRejection::FaceTooSmall)
                } else if ratio > self.config.max_face_ratio {
                    FaceVerdict::Reject(FaceRejection::FaceTooLarge)
                } else {
                    FaceVerdict::Accept(*face)
                }
            }
            _ => FaceVerdict::Reject(FaceRejection::MultipleFaces(valid)),
        }
    }
}
