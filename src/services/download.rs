use crate::config::DownloadConfig;
use image::{GenericImageView, ImageReader};
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

const REFERERS: [&str; 3] = [
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://duckduckgo.com/",
];

const IMAGE_CONTENT_TYPES: [&str; 4] = ["jpeg", "jpg", "png", "webp"];

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Not an image content type: {0}")]
    ContentType(String),

    #[error("File size {bytes} bytes outside [{min}, {max}]")]
    Size { bytes: u64, min: u64, max: u64 },

    #[error("Undecodable image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Image {width}x{height} below minimum dimension {min}")]
    TooSmall { width: u32, height: u32, min: u32 },
}

/// Fetches one candidate into a local file.
pub trait Downloader: Send + Sync {
    /// Write the image behind `locator` to `dest` and return its path.
    ///
    /// On failure no partial file is left at `dest`.
    fn fetch(&self, locator: &str, dest: &Path) -> Result<PathBuf, DownloadError>;
}

pub fn is_remote(locator: &str) -> bool {
    let lower = locator.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub fn is_image_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("image/") && IMAGE_CONTENT_TYPES.iter().any(|t| lower.contains(t))
}

/// Checks size bounds, decodability and minimum dimensions of a local file.
pub fn validate_image(path: &Path, config: &DownloadConfig) -> Result<(), DownloadError> {
    let bytes = fs::metadata(path)?.len();
    if bytes < config.min_bytes || bytes > config.max_bytes {
        return Err(DownloadError::Size {
            bytes,
            min: config.min_bytes,
            max: config.max_bytes,
        });
    }

    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let (width, height) = image.dimensions();
    if width < config.min_dimension || height < config.min_dimension {
        return Err(DownloadError::TooSmall {
            width,
            height,
            min: config.min_dimension,
        });
    }
    Ok(())
}

/// Runs `validate_image` and removes `path` if it fails.
fn keep_if_valid(path: &Path, config: &DownloadConfig) -> Result<PathBuf, DownloadError> {
    match validate_image(path, config) {
        Ok(()) => Ok(path.to_path_buf()),
        Err(e) => {
            let _ = fs::remove_file(path);
            Err(e)
        }
    }
}

/// HTTP(S) downloader with retries and content checks.
pub struct HttpDownloader {
    agent: ureq::Agent,
    config: DownloadConfig,
    backoff: Duration,
}

impl HttpDownloader {
    pub fn new(config: DownloadConfig, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(5)
            .build();
        Self {
            agent,
            config,
            backoff: Duration::from_millis(500),
        }
    }

    fn attempt(&self, url: &str, dest: &Path, attempt: usize) -> Result<(), DownloadError> {
        let response = self
            .agent
            .get(url)
            .set("User-Agent", USER_AGENTS[attempt % USER_AGENTS.len()])
            .set("Referer", REFERERS[attempt % REFERERS.len()])
            .set("Accept", "image/webp,image/png,image/jpeg,image/*;q=0.8")
            .call()
            .map_err(|e| DownloadError::Http(e.to_string()))?;

        let content_type = response.content_type().to_string();
        if !is_image_content_type(&content_type) {
            return Err(DownloadError::ContentType(content_type));
        }

        if let Some(length) = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length < self.config.min_bytes || length > self.config.max_bytes {
                return Err(DownloadError::Size {
                    bytes: length,
                    min: self.config.min_bytes,
                    max: self.config.max_bytes,
                });
            }
        }

        let mut reader = response.into_reader().take(self.config.max_bytes + 1);
        let mut file = File::create(dest)?;
        io::copy(&mut reader, &mut file)?;
        Ok(())
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, locator: &str, dest: &Path) -> Result<PathBuf, DownloadError> {
        let attempts = self.config.retries.max(1) as usize;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                thread::sleep(self.backoff * attempt as u32);
            }
            match self.attempt(locator, dest, attempt) {
                Ok(()) => return keep_if_valid(dest, &self.config),
                Err(e) => {
                    let _ = fs::remove_file(dest);
                    debug!("Attempt {} for {} failed: {}", attempt + 1, locator, e);
                    let retryable = matches!(e, DownloadError::Http(_) | DownloadError::Io(_));
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| DownloadError::Http("no attempt made".into()));
        warn!("Download failed for {}: {}", locator, error);
        Err(error)
    }
}

/// Copies candidates that already live on disk.
pub struct LocalCopier {
    config: DownloadConfig,
}

impl LocalCopier {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }
}

impl Downloader for LocalCopier {
    fn fetch(&self, locator: &str, dest: &Path) -> Result<PathBuf, DownloadError> {
        let source = locator.strip_prefix("file://").unwrap_or(locator);
        fs::copy(source, dest)?;
        keep_if_valid(dest, &self.config)
    }
}

/// Sends `http(s)://` locators to [`HttpDownloader`] and the rest to
/// [`LocalCopier`].
pub struct AnyDownloader {
    http: HttpDownloader,
    local: LocalCopier,
}

impl AnyDownloader {
    pub fn new(config: DownloadConfig, timeout: Duration) -> Self {
        Self {
            http: HttpDownloader::new(config.clone(), timeout),
            local: LocalCopier::new(config),
        }
    }

    pub fn dispatch(&self, locator: &str) -> &dyn Downloader {
        if is_remote(locator) {
            &self.http
        } else {
            &self.local
        }
    }
}

impl Downloader for AnyDownloader {
    fn fetch(&self, locator: &str, dest: &Path) -> Result<PathBuf, DownloadError> {
        self.dispatch(locator).fetch(locator, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{block_noise_image, write_png};
    use tempfile::TempDir;

    fn small_files() -> DownloadConfig {
        DownloadConfig {
            min_bytes: 100,
            ..DownloadConfig::default()
        }
    }

    #[test]
    fn test_content_types() {
        assert!(is_image_content_type("image/jpeg"));
        assert!(is_image_content_type("image/PNG"));
        assert!(is_image_content_type("image/webp"));
        assert!(!is_image_content_type("image/gif"));
        assert!(!is_image_content_type("text/html"));
        assert!(!is_image_content_type("application/jpg-archive"));
    }

    #[test]
    fn test_remote_detection() {
        assert!(is_remote("https://example.com/a.jpg"));
        assert!(is_remote("HTTP://example.com/a.jpg"));
        assert!(!is_remote("/tmp/a.jpg"));
        assert!(!is_remote("file:///tmp/a.jpg"));
    }

    #[test]
    fn test_local_copy_of_valid_image() {
        let temp_dir = TempDir::new().unwrap();
        let source = write_png(temp_dir.path(), "src.png", &block_noise_image(1, 200, 180, 4));
        let dest = temp_dir.path().join("copy.png");

        let copier = LocalCopier::new(small_files());
        let fetched = copier.fetch(&source.to_string_lossy(), &dest).unwrap();
        assert_eq!(fetched, dest);
        assert!(dest.exists());
    }

    #[test]
    fn test_local_copy_rejects_small_image_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let source = write_png(temp_dir.path(), "tiny.png", &block_noise_image(2, 120, 300, 2));
        let dest = temp_dir.path().join("copy.png");

        let copier = LocalCopier::new(small_files());
        let result = copier.fetch(&source.to_string_lossy(), &dest);
        assert!(matches!(
            result,
            Err(DownloadError::TooSmall {
                width: 120,
                height: 300,
                min: 150
            })
        ));
        assert!(!dest.exists());
    }

    #[test]
    fn test_local_copy_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("fake.jpg");
        fs::write(&source, vec![7u8; 20_000]).unwrap();
        let dest = temp_dir.path().join("copy.jpg");

        let result = LocalCopier::new(DownloadConfig::default()).fetch(&source.to_string_lossy(), &dest);
        assert!(matches!(result, Err(DownloadError::Image(_))));
        assert!(!dest.exists());
    }

    #[test]
    fn test_size_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let source = write_png(temp_dir.path(), "ok.png", &block_noise_image(3, 200, 200, 4));
        let config = DownloadConfig {
            max_bytes: 50,
            min_bytes: 10,
            ..DownloadConfig::default()
        };
        assert!(matches!(
            validate_image(&source, &config),
            Err(DownloadError::Size { .. })
        ));
    }

    #[test]
    fn test_missing_local_file() {
        let temp_dir = TempDir::new().unwrap();
        let copier = LocalCopier::new(small_files());
        let result = copier.fetch(
            &temp_dir.path().join("absent.jpg").to_string_lossy(),
            &temp_dir.path().join("copy.jpg"),
        );
        assert!(matches!(result, Err(DownloadError::Io(_))));
    }
}
