use crate::config::PipelineConfig;
use crate::core::hash::HashBank;
use crate::core::registry::{DuplicateReason, DuplicateThresholds, Fingerprint};
use crate::core::ssim::structural_similarity;
use crate::services::store::scan_images;
use log::{info, warn};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Two accepted files of one subject that match under the hash or SSIM tier.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicatePair {
    pub subject: String,
    pub kept: PathBuf,
    pub duplicate: PathBuf,
    pub reason: DuplicateReason,
}

fn compare(
    kept: &(PathBuf, Fingerprint),
    candidate: &Fingerprint,
    thresholds: &DuplicateThresholds,
) -> Option<DuplicateReason> {
    let (path, fingerprint) = kept;
    if let Some((kind, distance)) = candidate
        .hashes
        .matches(&fingerprint.hashes, thresholds.hash_distance)
    {
        return Some(DuplicateReason::Hash {
            kind,
            distance,
            of: path.clone(),
        });
    }
    let score = structural_similarity(&candidate.thumbnail, &fingerprint.thumbnail);
    (score >= thresholds.ssim).then(|| DuplicateReason::Structure {
        score,
        of: path.clone(),
    })
}

fn subject_pairs(dir: &Path, bank: &HashBank, thresholds: &DuplicateThresholds) -> Vec<DuplicatePair> {
    let subject = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let images: Vec<PathBuf> = scan_images(dir)
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();

    let fingerprints: Vec<(PathBuf, Fingerprint)> = images
        .par_iter()
        .filter_map(|path| match Fingerprint::from_path(bank, path) {
            Ok(fingerprint) => Some((path.clone(), fingerprint)),
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                None
            }
        })
        .collect();

    // Each file is compared against the files before it; the first match wins.
    (1..fingerprints.len())
        .into_par_iter()
        .filter_map(|j| {
            let (path, fingerprint) = &fingerprints[j];
            fingerprints[..j].iter().find_map(|kept| {
                compare(kept, fingerprint, thresholds).map(|reason| DuplicatePair {
                    subject: subject.clone(),
                    kept: kept.0.clone(),
                    duplicate: path.clone(),
                    reason,
                })
            })
        })
        .collect()
}

/// Re-check every subject directory under `<output>/processed/` pairwise.
pub fn validate(output: &Path, config: &PipelineConfig) -> Result<Vec<DuplicatePair>, ValidateError> {
    let processed = output.join("processed");
    if !processed.is_dir() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(&processed)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let bank = HashBank::default();
    let thresholds = config.thresholds.duplicates();
    let mut pairs = Vec::new();
    for dir in dirs {
        let found = subject_pairs(&dir, &bank, &thresholds);
        info!("{}: {} duplicate pair(s)", dir.display(), found.len());
        pairs.extend(found);
    }
    Ok(pairs)
}

/// Delete the later member of every pair. Returns the number of files removed.
pub fn delete_duplicates(pairs: &[DuplicatePair]) -> Result<usize, ValidateError> {
    let doomed: BTreeSet<&PathBuf> = pairs.iter().map(|p| &p.duplicate).collect();
    let mut removed = 0;
    for path in doomed {
        if path.exists() {
            fs::remove_file(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
