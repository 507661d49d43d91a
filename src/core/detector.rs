use crate::core::face::{FaceBox, FaceDetector, FaceError};
use image::DynamicImage;
use log::{debug, info, warn};
use rustface::ImageData;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const MODEL_FILE_NAME: &str = "seeta_fd_frontal_v1.0.bin";

const MODEL_URLS: [&str; 2] = [
    "https://github.com/atomashpolskiy/rustface/raw/master/model/seeta_fd_frontal_v1.0.bin",
    "https://raw.githubusercontent.com/atomashpolskiy/rustface/master/model/seeta_fd_frontal_v1.0.bin",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale_factor: f32,
    pub window_step: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_face_size: 40,
            score_threshold: 2.0,
            pyramid_scale_factor: 0.8,
            window_step: 4,
        }
    }
}

/// SeetaFace frontal face detector backed by `rustface`.
///
/// The model is parsed once per call from the bytes held here, which keeps
/// the detector shareable across worker threads.
pub struct RustfaceDetector {
    model: Vec<u8>,
    settings: DetectorSettings,
}

impl RustfaceDetector {
    pub fn from_file(path: &Path, settings: DetectorSettings) -> Result<Self, FaceError> {
        let model = fs::read(path)?;
        rustface::read_model(Cursor::new(&model))
            .map_err(|e| FaceError::Model(format!("{}: {}", path.display(), e)))?;
        info!("Loaded face detection model from {}", path.display());
        Ok(Self { model, settings })
    }

    /// Load the model from `path`, or from the data directory, downloading
    /// it there first if it is missing.
    pub fn load_or_download(
        path: Option<&Path>,
        settings: DetectorSettings,
    ) -> Result<Self, FaceError> {
        let model_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_model_path(),
        };
        if !model_path.exists() {
            download_model(&model_path)?;
        }
        Self::from_file(&model_path, settings)
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, FaceError> {
        let model = rustface::read_model(Cursor::new(&self.model))
            .map_err(|e| FaceError::Model(e.to_string()))?;
        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(self.settings.min_face_size);
        detector.set_score_thresh(self.settings.score_threshold);
        detector.set_pyramid_scale_factor(self.settings.pyramid_scale_factor);
        detector.set_slide_window_step(self.settings.window_step, self.settings.window_step);

        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        let mut image_data = ImageData::new(gray.as_raw(), width, height);

        let faces = detector
            .detect(&mut image_data)
            .into_iter()
            .filter(|face| face.score() >= self.settings.score_threshold)
            .filter_map(|face| {
                let bbox = face.bbox();
                clamp_box(
                    bbox.x(),
                    bbox.y(),
                    bbox.width(),
                    bbox.height(),
                    width,
                    height,
                )
                .map(|mut b| {
                    b.confidence = face.score();
                    b
                })
            })
            .collect::<Vec<_>>();

        debug!("Detected {} face(s) in {}x{} image", faces.len(), width, height);
        Ok(faces)
    }
}

/// Clip a detector rectangle (which may start off-image) to the image.
fn clamp_box(x: i32, y: i32, w: u32, h: u32, width: u32, height: u32) -> Option<FaceBox> {
    let left = x.max(0) as u32;
    let top = y.max(0) as u32;
    let right = (i64::from(x) + i64::from(w)).clamp(0, i64::from(width)) as u32;
    let bottom = (i64::from(y) + i64::from(h)).clamp(0, i64::from(height)) as u32;
    if right <= left || bottom <= top {
        return None;
    }
    Some(FaceBox::new(left, top, right - left, bottom - top))
}

pub fn default_model_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facecull")
        .join(MODEL_FILE_NAME)
}

fn download_model(dest: &Path) -> Result<(), FaceError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut last_error = None;
    for url in MODEL_URLS {
        info!("Downloading face detection model from {}", url);
        match ureq::get(url).call() {
            Ok(response) => {
                let partial = dest.with_extension("part");
                let mut file = fs::File::create(&partial)?;
                let copied = std::io::copy(&mut response.into_reader(), &mut file);
                drop(file);
                match copied {
                    Ok(bytes) => {
                        fs::rename(&partial, dest)?;
                        info!("Model downloaded ({} bytes) to {}", bytes, dest.display());
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = fs::remove_file(&partial);
                        warn!("Model download from {} interrupted: {}", url, e);
                        last_error = Some(e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!("Failed to download model from {}: {}", url, e);
                last_error = Some(e.to_string());
            }
        }
    }

    Err(FaceError::Model(format!(
        "could not download {} (last error: {}); place it at {}",
        MODEL_FILE_NAME,
        last_error.unwrap_or_default(),
        dest.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clamp_box_inside() {
        let b = clamp_box(10, 20, 30, 40, 100, 100).unwrap();
        assert_eq!((b.x, b.y, b.width, b.height), (10, 20, 30, 40));
    }

    #[test]
    fn test_clamp_box_off_edges() {
        let b = clamp_box(-10, -5, 30, 40, 100, 30).unwrap();
        assert_eq!((b.x, b.y, b.width, b.height), (0, 0, 20, 30));
        assert!(clamp_box(120, 0, 10, 10, 100, 100).is_none());
    }

    #[test]
    fn test_missing_model_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let result =
            RustfaceDetector::from_file(&temp_dir.path().join("absent.bin"), DetectorSettings::default());
        assert!(matches!(result, Err(FaceError::Io(_))));
    }

    #[test]
    fn test_default_model_path_names_model() {
        assert!(default_model_path().ends_with(Path::new("facecull").join(MODEL_FILE_NAME)));
    }
}
