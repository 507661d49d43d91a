use crate::core::face::{Embedding, FaceBox, FaceEmbedder, FaceError, crop_face};
use image::DynamicImage;
use image::imageops::FilterType;
use log::{debug, info};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// InsightFace `buffalo_l` recognition model.
pub const MODEL_FILE_NAME: &str = "w600k_r50.onnx";

/// ArcFace models take 112×112 RGB crops.
pub const INPUT_SIDE: u32 = 112;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    /// Context added around the detector box, as a fraction of its size.
    pub padding: f32,
    pub intra_threads: usize,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            padding: 0.2,
            intra_threads: 1,
        }
    }
}

/// ArcFace face embedder running an ONNX model through `ort`.
///
/// Produces unit-length embeddings, so Euclidean distances fall in `[0, 2]`.
pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
    settings: EmbedderSettings,
}

impl ArcFaceEmbedder {
    pub fn from_file(path: &Path, settings: EmbedderSettings) -> Result<Self, FaceError> {
        if !path.is_file() {
            return Err(FaceError::Model(format!(
                "{} not found; fetch {} from the InsightFace buffalo_l pack",
                path.display(),
                MODEL_FILE_NAME
            )));
        }
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(settings.intra_threads.max(1))?
            .commit_from_file(path)?;
        info!("Loaded face embedding model from {}", path.display());
        Ok(Self {
            session: Mutex::new(session),
            settings,
        })
    }

    /// Load the model from `path`, or from the first default location that exists.
    pub fn load(path: Option<&Path>, settings: EmbedderSettings) -> Result<Self, FaceError> {
        let model_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_model_path(),
        };
        Self::from_file(&model_path, settings)
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&self, image: &DynamicImage, face: &FaceBox) -> Result<Embedding, FaceError> {
        let data = face_tensor(image, face, self.settings.padding)?;
        let input = Tensor::from_array((input_shape().to_vec(), data))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![input])?;
        let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;
        debug!("Embedded face {:?} into {} values", face, raw.len());

        Embedding::normalized(raw.to_vec()).ok_or(FaceError::DegenerateCrop)
    }
}

fn input_shape() -> [i64; 4] {
    let side = i64::from(INPUT_SIDE);
    [1, 3, side, side]
}

/// The face crop as a normalised NCHW tensor: RGB planes, `(p − 127.5) / 127.5`.
pub fn face_tensor(image: &DynamicImage, face: &FaceBox, padding: f32) -> Result<Vec<f32>, FaceError> {
    let crop = crop_face(image, face, padding)?
        .resize_exact(INPUT_SIDE, INPUT_SIDE, FilterType::Triangle)
        .to_rgb8();

    let plane = (INPUT_SIDE * INPUT_SIDE) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, pixel) in crop.pixels().enumerate() {
        for (channel, &value) in pixel.0.iter().enumerate() {
            data[channel * plane + i] = (f32::from(value) - 127.5) / 127.5;
        }
    }
    Ok(data)
}

/// `<data dir>/facecull/w600k_r50.onnx`, falling back to InsightFace's own
/// model directory when only that one holds the file.
pub fn default_model_path() -> PathBuf {
    let ours = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facecull")
        .join(MODEL_FILE_NAME);
    if ours.exists() {
        return ours;
    }
    dirs::home_dir()
        .map(|home| {
            home.join(".insightface")
                .join("models")
                .join("buffalo_l")
                .join(MODEL_FILE_NAME)
        })
        .filter(|p| p.exists())
        .unwrap_or(ours)
}
