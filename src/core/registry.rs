use crate::core::face::{Embedding, similarity_for_cosine};
use crate::core::hash::{HashBank, HashError, HashKind, ImageHashes, open_image};
use crate::core::ssim::{GrayThumbnail, structural_similarity};
use image::DynamicImage;
use log::debug;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateThresholds {
    /// Maximum Hamming distance, per algorithm, for a hash duplicate.
    pub hash_distance: u32,
    /// Minimum SSIM score for a structural duplicate.
    pub ssim: f64,
    /// Minimum embedding similarity for a face duplicate.
    pub embedding_similarity: f32,
}

impl Default for DuplicateThresholds {
    fn default() -> Self {
        Self {
            hash_distance: 5,
            ssim: 0.85,
            // ArcFace cosine 0.85: another photo of the same moment
            embedding_similarity: similarity_for_cosine(0.85),
        }
    }
}

/// Everything the registry needs to compare an image, computed once.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub hashes: ImageHashes,
    pub thumbnail: GrayThumbnail,
}

impl Fingerprint {
    pub fn new(hashes: ImageHashes, thumbnail: GrayThumbnail) -> Self {
        Self { hashes, thumbnail }
    }

    pub fn from_image(bank: &HashBank, image: &DynamicImage) -> Self {
        Self {
            hashes: bank.compute(image),
            thumbnail: GrayThumbnail::from_image(image),
        }
    }

    pub fn from_path(bank: &HashBank, path: &Path) -> Result<Self, HashError> {
        Ok(Self::from_image(bank, &open_image(path)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

#[derive(Debug, Clone)]
pub struct AcceptedRecord {
    pub id: RecordId,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub embedding: Option<Embedding>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateReason {
    Hash {
        kind: HashKind,
        distance: u32,
        of: PathBuf,
    },
    Structure {
        score: f64,
        of: PathBuf,
    },
    Embedding {
        similarity: f32,
        of: PathBuf,
    },
}

impl fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateReason::Hash { kind, distance, of } => {
                write!(f, "{} distance {} to {}", kind, distance, of.display())
            }
            DuplicateReason::Structure { score, of } => {
                write!(f, "SSIM {:.3} to {}", score, of.display())
            }
            DuplicateReason::Embedding { similarity, of } => {
                write!(f, "face similarity {:.3} to {}", similarity, of.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Unique(RecordId),
    Duplicate(DuplicateReason),
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    records: Vec<AcceptedRecord>,
}

impl Inner {
    fn insert(
        &mut self,
        path: PathBuf,
        fingerprint: Fingerprint,
        embedding: Option<Embedding>,
    ) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        self.records.push(AcceptedRecord {
            id,
            path,
            fingerprint,
            embedding,
        });
        id
    }
}

/// Accepted images of one subject, with an atomic compare-and-insert.
///
/// A candidate is checked against every record, tier by tier: perceptual
/// hashes, then SSIM (only against records whose file still exists), then
/// face embeddings. Comparison and insertion happen under one lock, so two
/// concurrent near-duplicates can never both come back `Unique`.
pub struct DuplicateRegistry {
    thresholds: DuplicateThresholds,
    inner: Mutex<Inner>,
}

impl DuplicateRegistry {
    pub fn new(thresholds: DuplicateThresholds) -> Self {
        Self {
            thresholds,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_or_reject(
        &self,
        path: &Path,
        fingerprint: Fingerprint,
        embedding: Option<Embedding>,
    ) -> Registration {
        let mut inner = self.lock();
        if let Some(reason) = self.find_duplicate(&inner.records, &fingerprint, embedding.as_ref())
        {
            debug!("{} is a duplicate: {}", path.display(), reason);
            return Registration::Duplicate(reason);
        }
        Registration::Unique(inner.insert(path.to_path_buf(), fingerprint, embedding))
    }

    /// Insert without checking, for files accepted by an earlier run.
    pub fn seed(&self, path: PathBuf, fingerprint: Fingerprint, embedding: Option<Embedding>) -> RecordId {
        self.lock().insert(path, fingerprint, embedding)
    }

    pub fn update_path(&self, id: RecordId, path: PathBuf) -> bool {
        let mut inner = self.lock();
        match inner.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.path = path;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: RecordId) -> Option<AcceptedRecord> {
        let mut inner = self.lock();
        let index = inner.records.iter().position(|r| r.id == id)?;
        Some(inner.records.remove(index))
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().records.iter().map(|r| r.path.clone()).collect()
    }

    fn find_duplicate(
        &self,
        records: &[AcceptedRecord],
        candidate: &Fingerprint,
        embedding: Option<&Embedding>,
    ) -> Option<DuplicateReason> {
        for record in records {
            if let Some((kind, distance)) = candidate
                .hashes
                .matches(&record.fingerprint.hashes, self.thresholds.hash_distance)
            {
                return Some(DuplicateReason::Hash {
                    kind,
                    distance,
                    of: record.path.clone(),
                });
            }
        }

        for record in records.iter().filter(|r| r.path.exists()) {
            let score = structural_similarity(&candidate.thumbnail, &record.fingerprint.thumbnail);
            if score >= self.thresholds.ssim {
                return Some(DuplicateReason::Structure {
                    score,
                    of: record.path.clone(),
                });
            }
        }

        let embedding = embedding?;
        records.iter().find_map(|record| {
            let theirs = record.embedding.as_ref()?;
            let similarity = embedding.similarity(theirs);
            (similarity >= self.thresholds.embedding_similarity).then(|| DuplicateReason::Embedding {
                similarity,
                of: record.path.clone(),
            })
        })
    }
}

impl Default for DuplicateRegistry {
    fn default() -> Self {
        Self::new(DuplicateThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{block_noise_image, write_png};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn fingerprint(seed: u64) -> Fingerprint {
        Fingerprint::from_image(&HashBank::default(), &block_noise_image(seed, 160, 160, 8))
    }

    /// Fingerprint with no hashes, so only the later tiers can match.
    fn thumbnail_only(seed: u64) -> Fingerprint {
        Fingerprint::new(
            ImageHashes::default(),
            GrayThumbnail::from_image(&block_noise_image(seed, 160, 160, 8)),
        )
    }

    fn unit(values: &[f32]) -> Embedding {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        Embedding(values.iter().map(|v| v / norm).collect())
    }

    #[test]
    fn test_same_image_is_duplicate_of_itself() {
        let registry = DuplicateRegistry::default();
        let path = Path::new("a.jpg");
        assert!(matches!(
            registry.register_or_reject(path, fingerprint(1), None),
            Registration::Unique(_)
        ));
        match registry.register_or_reject(Path::new("b.jpg"), fingerprint(1), None) {
            Registration::Duplicate(DuplicateReason::Hash { distance, of, .. }) => {
                assert_eq!(distance, 0);
                assert_eq!(of, path);
            }
            other => panic!("expected hash duplicate, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_images_are_unique() {
        let registry = DuplicateRegistry::default();
        for seed in 0..5 {
            let path = PathBuf::from(format!("{seed}.jpg"));
            assert!(matches!(
                registry.register_or_reject(&path, fingerprint(seed), None),
                Registration::Unique(_)
            ));
        }
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_structure_tier_needs_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let registry = DuplicateRegistry::default();

        let missing = temp_dir.path().join("gone.jpg");
        registry.register_or_reject(&missing, thumbnail_only(3), None);
        assert!(matches!(
            registry.register_or_reject(Path::new("c1.jpg"), thumbnail_only(3), None),
            Registration::Unique(_)
        ));

        let present = write_png(temp_dir.path(), "kept.png", &block_noise_image(4, 160, 160, 8));
        registry.register_or_reject(&present, thumbnail_only(4), None);
        match registry.register_or_reject(Path::new("c2.jpg"), thumbnail_only(4), None) {
            Registration::Duplicate(DuplicateReason::Structure { score, of }) => {
                assert!(score > 0.99);
                assert_eq!(of, present);
            }
            other => panic!("expected structural duplicate, got {other:?}"),
        }
    }

    #[test]
    fn test_embedding_tier() {
        let registry = DuplicateRegistry::default();
        let face = unit(&[1.0, 0.0, 0.0]);
        let close = unit(&[1.0, 0.1, 0.0]);
        let far = unit(&[0.0, 1.0, 0.0]);

        registry.register_or_reject(Path::new("a.jpg"), thumbnail_only(10), Some(face));
        assert!(matches!(
            registry.register_or_reject(Path::new("b.jpg"), thumbnail_only(11), Some(close)),
            Registration::Duplicate(DuplicateReason::Embedding { .. })
        ));
        assert!(matches!(
            registry.register_or_reject(Path::new("c.jpg"), thumbnail_only(12), Some(far)),
            Registration::Unique(_)
        ));
        assert!(matches!(
            registry.register_or_reject(Path::new("d.jpg"), thumbnail_only(13), None),
            Registration::Unique(_)
        ));
    }

    #[test]
    fn test_update_path_and_remove() {
        let registry = DuplicateRegistry::default();
        let id = match registry.register_or_reject(Path::new("temp.jpg"), fingerprint(2), None) {
            Registration::Unique(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        assert!(registry.update_path(id, PathBuf::from("final.jpg")));
        assert_eq!(registry.paths(), vec![PathBuf::from("final.jpg")]);

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.path, PathBuf::from("final.jpg"));
        assert!(registry.is_empty());
        assert!(!registry.update_path(id, PathBuf::from("other.jpg")));
    }

    #[test]
    fn test_seeded_records_count_as_accepted() {
        let registry = DuplicateRegistry::default();
        registry.seed(PathBuf::from("old.jpg"), fingerprint(6), None);
        assert!(matches!(
            registry.register_or_reject(Path::new("new.jpg"), fingerprint(6), None),
            Registration::Duplicate(_)
        ));
    }

    #[test]
    fn test_concurrent_near_duplicates_admit_exactly_one() {
        const WORKERS: usize = 8;
        let base = fingerprint(42);
        let face = unit(&[0.3, 0.9, 0.1]);

        for trial in 0..20 {
            let registry = Arc::new(DuplicateRegistry::default());
            let barrier = Arc::new(Barrier::new(WORKERS));

            let handles: Vec<_> = (0..WORKERS)
                .map(|i| {
                    let worker = (i + trial) % WORKERS;
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    let fingerprint = base.clone();
                    let embedding = face.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let path = PathBuf::from(format!("candidate_{worker}.jpg"));
                        registry.register_or_reject(&path, fingerprint, Some(embedding))
                    })
                })
                .collect();

            let unique = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|r| matches!(r, Registration::Unique(_)))
                .count();
            assert_eq!(unique, 1, "trial {trial}");
            assert_eq!(registry.len(), 1);
        }
    }
}
