use crate::core::cluster::ClusterConfig;
use crate::core::detector::DetectorSettings;
use crate::core::embedder::EmbedderSettings;
use crate::core::face::similarity_for_cosine;
use crate::core::filter::FaceFilterConfig;
use crate::core::registry::DuplicateThresholds;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Embedding thresholds are `1 − distance` between unit ArcFace embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub hash_distance: u32,
    pub ssim: f64,
    pub face_duplicate_similarity: f32,
    pub identity_similarity: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        let duplicates = DuplicateThresholds::default();
        Self {
            hash_distance: duplicates.hash_distance,
            ssim: duplicates.ssim,
            face_duplicate_similarity: duplicates.embedding_similarity,
            identity_similarity: similarity_for_cosine(0.4),
        }
    }
}

impl Thresholds {
    pub fn duplicates(&self) -> DuplicateThresholds {
        DuplicateThresholds {
            hash_distance: self.hash_distance,
            ssim: self.ssim,
            embedding_similarity: self.face_duplicate_similarity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Concurrency {
    pub download_concurrency: usize,
    pub compute_concurrency: usize,
    pub subject_concurrency: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            download_concurrency: (cpus * 4).max(4),
            compute_concurrency: (cpus / 2).max(1),
            subject_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub download_secs: u64,
    pub compute_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            download_secs: 15,
            compute_secs: 60,
        }
    }
}

impl Timeouts {
    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn compute(&self) -> Duration {
        Duration::from_secs(self.compute_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub target_count: usize,
    pub max_rounds: usize,
    /// Raw candidates gathered before the reference identity is built.
    pub bootstrap_sample: usize,
    /// Locators requested per alias per round.
    pub round_batch: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            target_count: 100,
            max_rounds: 15,
            bootstrap_sample: 100,
            round_batch: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub retries: u32,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub min_dimension: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            min_bytes: 10_000,
            max_bytes: 10_000_000,
            min_dimension: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_side: u32,
    pub min_side: u32,
    pub jpeg_quality: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_side: 1024,
            min_side: 300,
            jpeg_quality: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub thresholds: Thresholds,
    pub face_filter: FaceFilterConfig,
    pub clustering: ClusterConfig,
    pub detector: DetectorSettings,
    pub embedder: EmbedderSettings,
    pub concurrency: Concurrency,
    pub timeouts: Timeouts,
    pub collection: CollectionConfig,
    pub download: DownloadConfig,
    pub store: StoreConfig,
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            face_filter: FaceFilterConfig::default(),
            clustering: ClusterConfig::default(),
            detector: DetectorSettings::default(),
            embedder: EmbedderSettings::default(),
            concurrency: Concurrency::default(),
            timeouts: Timeouts::default(),
            collection: CollectionConfig::default(),
            download: DownloadConfig::default(),
            store: StoreConfig::default(),
            show_progress: true,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let t = &self.thresholds;
        if t.hash_distance > 64 {
            return invalid("thresholds.hash_distance must be at most 64");
        }
        if !(0.0..=1.0).contains(&t.ssim) {
            return invalid("thresholds.ssim must lie in [0, 1]");
        }
        if !(-1.0..=1.0).contains(&t.face_duplicate_similarity)
            || !(-1.0..=1.0).contains(&t.identity_similarity)
        {
            return invalid("similarity thresholds must lie in [-1, 1]");
        }

        let f = &self.face_filter;
        if f.min_face_size == 0 {
            return invalid("face_filter.min_face_size must be positive");
        }
        if !(0.0..=1.0).contains(&f.min_face_ratio)
            || !(0.0..=1.0).contains(&f.max_face_ratio)
            || f.min_face_ratio > f.max_face_ratio
        {
            return invalid("face_filter ratio window must satisfy 0 <= min <= max <= 1");
        }
        if f.split_padding < 0.0 {
            return invalid("face_filter.split_padding must not be negative");
        }

        if self.embedder.padding < 0.0 {
            return invalid("embedder.padding must not be negative");
        }

        let c = &self.clustering;
        if c.eps <= 0.0 {
            return invalid("clustering.eps must be positive");
        }
        if c.min_samples < 2 {
            return invalid("clustering.min_samples must be at least 2");
        }

        let n = &self.concurrency;
        if n.download_concurrency == 0 || n.compute_concurrency == 0 || n.subject_concurrency == 0 {
            return invalid("concurrency values must be positive");
        }
        if self.timeouts.download_secs == 0 || self.timeouts.compute_secs == 0 {
            return invalid("timeouts must be positive");
        }
        if self.collection.target_count == 0 {
            return invalid("collection.target_count must be positive");
        }
        if self.collection.round_batch == 0 {
            return invalid("collection.round_batch must be positive");
        }
        if self.download.min_bytes > self.download.max_bytes {
            return invalid("download.min_bytes exceeds download.max_bytes");
        }

        let s = &self.store;
        if s.min_side == 0 || s.min_side > s.max_side {
            return invalid("store sides must satisfy 0 < min_side <= max_side");
        }
        if !(1..=100).contains(&s.jpeg_quality) {
            return invalid("store.jpeg_quality must lie in [1, 100]");
        }

        Ok(())
    }
}

/// A person to collect photos of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Subject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
        }
    }

    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Search queries for this subject: the name first, then distinct aliases.
    pub fn queries(&self) -> Vec<&str> {
        let mut queries = vec![self.name.as_str()];
        for alias in &self.aliases {
            if !queries.contains(&alias.as_str()) {
                queries.push(alias);
            }
        }
        queries
    }
}

pub fn load_subjects(path: &Path) -> Result<Vec<Subject>, ConfigError> {
    let text = fs::read_to_string(path)?;
    let subjects: Vec<Subject> = serde_json::from_str(&text)?;
    if let Some(empty) = subjects.iter().find(|s| s.name.trim().is_empty()) {
        return Err(ConfigError::Invalid(format!(
            "subject with empty name (aliases: {:?})",
            empty.aliases
        )));
    }
    Ok(subjects)
}

/// Filesystem-safe form of a name.
pub fn slugify(name: &str) -> String {
    name.trim().replace([' ', '/'], "_")
}

pub fn default_output_dir() -> PathBuf {
    dirs::picture_dir()
        .map(|p| p.join("facecull"))
        .unwrap_or_else(|| PathBuf::from("facecull_dataset"))
}
