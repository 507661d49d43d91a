use crate::config::StoreConfig;
use crate::core::hash::{HashError, content_token};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff"];

/// Length of the content token in accepted file names.
pub const TOKEN_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Hash computation error: {0}")]
    Hash(#[from] HashError),

    #[error("Cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursively walk `dir`, returning image file paths in path order.
pub fn scan_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_image_path(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    images.sort();
    images
}

/// Resize so the longest side is at most `max_side` and at least `min_side`.
pub fn normalize(image: &DynamicImage, config: &StoreConfig) -> DynamicImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    let target = longest.clamp(config.min_side, config.max_side);
    if target == longest || longest == 0 {
        return DynamicImage::ImageRgb8(image.to_rgb8());
    }

    let ratio = target as f32 / longest as f32;
    let (new_width, new_height) = if width >= height {
        (target, ((height as f32 * ratio).round() as u32).max(1))
    } else {
        (((width as f32 * ratio).round() as u32).max(1), target)
    };
    DynamicImage::ImageRgb8(
        image
            .resize_exact(new_width, new_height, FilterType::Lanczos3)
            .to_rgb8(),
    )
}

/// Encode `image` as JPEG next to `path`, then rename it into place.
pub fn write_jpeg(image: &DynamicImage, path: &Path, quality: u8) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = path.with_file_name(format!(".{file_name}.part"));

    let written = (|| -> Result<(), StoreError> {
        let rgb_img = image.to_rgb8();
        let mut output = fs::File::create(&partial)?;
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
        rgb_img.write_with_encoder(encoder)?;
        output.sync_all()?;
        Ok(())
    })();

    match written {
        Ok(()) => {
            fs::rename(&partial, path)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

/// On-disk layout for one subject under the output root.
///
/// ```text
/// <output>/processed/<slug>/<slug>_<token>.jpg
/// <output>/reference_images/<slug>_reference.jpg
/// <output>/temp/<slug>/
/// ```
#[derive(Debug, Clone)]
pub struct SubjectStore {
    slug: String,
    accepted_dir: PathBuf,
    reference_dir: PathBuf,
    temp_dir: PathBuf,
    config: StoreConfig,
}

impl SubjectStore {
    pub fn new(output: &Path, slug: &str, config: StoreConfig) -> Self {
        Self {
            slug: slug.to_string(),
            accepted_dir: output.join("processed").join(slug),
            reference_dir: output.join("reference_images"),
            temp_dir: output.join("temp").join(slug),
            config,
        }
    }

    /// Create the subject's directories.
    pub fn prepare(&self) -> Result<(), StoreError> {
        for dir in [&self.accepted_dir, &self.reference_dir, &self.temp_dir] {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn reference_path(&self) -> PathBuf {
        self.reference_dir.join(format!("{}_reference.jpg", self.slug))
    }

    pub fn accepted_path(&self, token: &str) -> PathBuf {
        self.accepted_dir.join(format!("{}_{}.jpg", self.slug, token))
    }

    pub fn existing_images(&self) -> Vec<PathBuf> {
        if !self.accepted_dir.is_dir() {
            return Vec::new();
        }
        scan_images(&self.accepted_dir)
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
            })
            .collect()
    }

    /// Store `image` (decoded from the candidate at `source`) under a name
    /// derived from the candidate's bytes.
    pub fn save_accepted(&self, image: &DynamicImage, source: &Path) -> Result<PathBuf, StoreError> {
        let token = content_token(source, TOKEN_LEN)?;
        let dest = self.accepted_path(&token);
        if dest.exists() {
            debug!("{} already stored", dest.display());
            return Ok(dest);
        }
        write_jpeg(&normalize(image, &self.config), &dest, self.config.jpeg_quality)?;
        Ok(dest)
    }

    pub fn save_reference(&self, image: &DynamicImage) -> Result<PathBuf, StoreError> {
        let dest = self.reference_path();
        write_jpeg(&normalize(image, &self.config), &dest, self.config.jpeg_quality)?;
        info!("Saved reference exemplar to {}", dest.display());
        Ok(dest)
    }

    pub fn cleanup_temp(&self) {
        if self.temp_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.temp_dir) {
                log::warn!("Failed to remove {}: {}", self.temp_dir.display(), e);
            }
        }
    }
}
