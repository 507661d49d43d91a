use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Side of the square hash grid; every algorithm yields `HASH_SIDE²` bits.
pub const HASH_SIDE: u32 = 8;

/// Images are normalised to this square RGB size before hashing.
const NORMALIZED_SIDE: u32 = 64;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Perceptual hash algorithms kept per accepted image.
///
/// Each one reacts to a different kind of edit, so a near-duplicate that
/// slips past one of them is usually caught by another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    /// Horizontal gradient (difference) hash.
    DHash,
    /// Mean intensity (average) hash.
    AHash,
    /// Median hash over low-frequency DCT coefficients.
    PHash,
    /// Block-mean hash.
    Blockhash,
}

impl HashKind {
    pub const ALL: [HashKind; 4] = [
        HashKind::DHash,
        HashKind::AHash,
        HashKind::PHash,
        HashKind::Blockhash,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HashKind::DHash => "dhash",
            HashKind::AHash => "ahash",
            HashKind::PHash => "phash",
            HashKind::Blockhash => "blockhash",
        }
    }

    fn hasher(self) -> Hasher {
        let config = HasherConfig::new().hash_size(HASH_SIDE, HASH_SIDE);
        let config = match self {
            HashKind::DHash => config.hash_alg(HashAlg::Gradient),
            HashKind::AHash => config.hash_alg(HashAlg::Mean),
            HashKind::PHash => config.hash_alg(HashAlg::Median).preproc_dct(),
            HashKind::Blockhash => config.hash_alg(HashAlg::Blockhash),
        };
        config.to_hasher()
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The hash set of one image: algorithm → hash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageHashes {
    hashes: BTreeMap<HashKind, ImageHash>,
}

impl ImageHashes {
    pub fn get(&self, kind: HashKind) -> Option<&ImageHash> {
        self.hashes.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Smallest Hamming distance over the algorithms both sets share.
    pub fn closest(&self, other: &ImageHashes) -> Option<(HashKind, u32)> {
        self.hashes
            .iter()
            .filter_map(|(kind, hash)| {
                let theirs = other.hashes.get(kind)?;
                hash_distance(hash, theirs).map(|d| (*kind, d))
            })
            .min_by_key(|(_, distance)| *distance)
    }

    /// First shared algorithm whose distance is within `threshold`.
    pub fn matches(&self, other: &ImageHashes, threshold: u32) -> Option<(HashKind, u32)> {
        self.closest(other).filter(|(_, d)| *d <= threshold)
    }
}

/// Hamming distance between two hashes of the same algorithm.
///
/// `None` when the bit strings differ in length, which only happens when
/// hashes from differently configured hashers are mixed.
pub fn hash_distance(a: &ImageHash, b: &ImageHash) -> Option<u32> {
    let (left, right) = (a.as_bytes(), b.as_bytes());
    if left.len() != right.len() {
        return None;
    }
    Some(
        left.iter()
            .zip(right)
            .map(|(l, r)| (l ^ r).count_ones())
            .sum(),
    )
}

/// Computes every configured perceptual hash of an image.
pub struct HashBank {
    hashers: Vec<(HashKind, Hasher)>,
}

impl HashBank {
    pub fn new(kinds: &[HashKind]) -> Self {
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();
        Self {
            hashers: kinds.into_iter().map(|k| (k, k.hasher())).collect(),
        }
    }

    pub fn compute(&self, image: &DynamicImage) -> ImageHashes {
        let normalized = DynamicImage::ImageRgb8(
            image
                .resize_exact(NORMALIZED_SIDE, NORMALIZED_SIDE, FilterType::Triangle)
                .to_rgb8(),
        );
        let hashes = self
            .hashers
            .iter()
            .map(|(kind, hasher)| (*kind, hasher.hash_image(&normalized)))
            .collect();
        ImageHashes { hashes }
    }

    pub fn compute_path(&self, path: &Path) -> Result<ImageHashes, HashError> {
        Ok(self.compute(&open_image(path)?))
    }
}

impl Default for HashBank {
    fn default() -> Self {
        Self::new(&HashKind::ALL)
    }
}

/// Decode an image, sniffing the format from its content.
pub fn open_image(path: &Path) -> Result<DynamicImage, HashError> {
    Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?)
}

/// BLAKE3 digest of a file's bytes, truncated to `len` hex characters.
pub fn content_token(path: &Path, len: usize) -> Result<String, HashError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let hex = hasher.finalize().to_hex();
    Ok(hex.as_str().chars().take(len).collect())
}

/// BLAKE3 digest of a string, truncated to `len` hex characters.
pub fn text_token(text: &str, len: usize) -> String {
    blake3::hash(text.as_bytes())
        .to_hex()
        .as_str()
        .chars()
        .take(len)
        .collect()
}
