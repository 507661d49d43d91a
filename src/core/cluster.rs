use crate::core::face::{Embedding, distance_for_cosine};
use linfa::traits::Transformer;
use linfa_clustering::Dbscan;
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// DBSCAN neighbourhood radius, in embedding distance.
    pub eps: f32,
    pub min_samples: usize,
    /// Below this many embeddings no clustering is attempted.
    pub min_embeddings: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            // ArcFace cosine 0.5 between neighbouring photos of one person
            eps: distance_for_cosine(0.5),
            min_samples: 3,
            min_embeddings: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("No embeddings to cluster")]
    Empty,

    #[error("Embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("DBSCAN failed: {0}")]
    Dbscan(String),
}

/// Why no reference identity could be derived.
#[derive(Debug, Error)]
pub enum BootstrapFailure {
    #[error("insufficient sample: {found} embeddings, {required} required")]
    InsufficientSample { found: usize, required: usize },

    #[error("no dense cluster among {sample_size} embeddings")]
    NoDenseCluster { sample_size: usize },

    #[error("clustering failed: {0}")]
    Clustering(#[from] ClusterError),
}

/// The reference identity picked from the dominant cluster.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Index of the medoid in the input slice.
    pub reference_index: usize,
    pub reference: Embedding,
    pub cluster_size: usize,
    pub sample_size: usize,
    pub clusters: usize,
    pub noise: usize,
}

/// DBSCAN cluster label per embedding; `None` marks noise.
pub fn cluster_labels(
    embeddings: &[Embedding],
    config: &ClusterConfig,
) -> Result<Vec<Option<usize>>, ClusterError> {
    let first = embeddings.first().ok_or(ClusterError::Empty)?;
    let dim = first.dim();
    let mut flat = Vec::with_capacity(embeddings.len() * dim);
    for embedding in embeddings {
        if embedding.dim() != dim {
            return Err(ClusterError::DimensionMismatch {
                expected: dim,
                found: embedding.dim(),
            });
        }
        flat.extend_from_slice(embedding.as_slice());
    }

    let dataset = Array2::from_shape_vec((embeddings.len(), dim), flat)
        .map_err(|e| ClusterError::Dbscan(e.to_string()))?;

    let memberships = Dbscan::params(config.min_samples)
        .tolerance(config.eps)
        .transform(&dataset)
        .map_err(|e| ClusterError::Dbscan(e.to_string()))?;
    let labels = memberships.to_vec();

    let mut label_count: BTreeMap<Option<usize>, usize> = BTreeMap::new();
    for &label in &labels {
        *label_count.entry(label).or_insert(0) += 1;
    }
    for (label, count) in label_count {
        match label {
            None => info!(" - {count} noise points"),
            Some(i) => info!(" - {count} points in cluster {i}"),
        }
    }

    Ok(labels)
}

/// Member of `members` with the smallest summed distance to the others.
///
/// Ties go to the earliest member.
pub fn medoid(embeddings: &[Embedding], members: &[usize]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for &candidate in members {
        let total: f32 = members
            .iter()
            .map(|&other| embeddings[candidate].distance(&embeddings[other]))
            .sum();
        if best.is_none_or(|(_, best_total)| total < best_total) {
            best = Some((candidate, total));
        }
    }
    best.map(|(index, _)| index)
}

/// Cluster `embeddings` and return the medoid of the largest cluster.
///
/// Noise points never count. Cluster-size ties go to the lowest label.
pub fn bootstrap_reference(
    embeddings: &[Embedding],
    config: &ClusterConfig,
) -> Result<Bootstrap, BootstrapFailure> {
    let sample_size = embeddings.len();
    if sample_size < config.min_embeddings.max(1) {
        return Err(BootstrapFailure::InsufficientSample {
            found: sample_size,
            required: config.min_embeddings.max(1),
        });
    }

    let labels = cluster_labels(embeddings, config)?;

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, label) in labels.iter().enumerate() {
        if let Some(label) = label {
            clusters.entry(*label).or_default().push(index);
        }
    }
    let noise = labels.iter().filter(|l| l.is_none()).count();

    let mut dominant: Option<&Vec<usize>> = None;
    for members in clusters.values() {
        if dominant.is_none_or(|d| members.len() > d.len()) {
            dominant = Some(members);
        }
    }
    let members = dominant.ok_or(BootstrapFailure::NoDenseCluster { sample_size })?;
    let reference_index =
        medoid(embeddings, members).ok_or(BootstrapFailure::NoDenseCluster { sample_size })?;

    info!(
        "Reference identity: sample {} of {}, cluster of {} ({} clusters, {} noise)",
        reference_index,
        sample_size,
        members.len(),
        clusters.len(),
        noise
    );

    Ok(Bootstrap {
        reference_index,
        reference: embeddings[reference_index].clone(),
        cluster_size: members.len(),
        sample_size,
        clusters: clusters.len(),
        noise,
    })
}

/// `(same, similarity)` of `embedding` against `reference`.
pub fn is_same_identity(embedding: &Embedding, reference: &Embedding, threshold: f32) -> (bool, f32) {
    let similarity = embedding.similarity(reference);
    (similarity >= threshold, similarity)
}

/// Identity check used while collecting.
///
/// Written once before collection starts and only read afterwards.
#[derive(Debug, Clone)]
pub enum IdentityGate {
    Verified { reference: Embedding, threshold: f32 },
    /// No reference could be established; every face passes.
    Permissive,
}

impl IdentityGate {
    /// `Ok(similarity)` when the face passes, `Err(similarity)` otherwise.
    pub fn check(&self, embedding: &Embedding) -> Result<Option<f32>, f32> {
        match self {
            IdentityGate::Verified {
                reference,
                threshold,
            } => match is_same_identity(embedding, reference, *threshold) {
                (true, similarity) => Ok(Some(similarity)),
                (false, similarity) => Err(similarity),
            },
            IdentityGate::Permissive => Ok(None),
        }
    }
}
