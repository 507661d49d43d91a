use crate::config::{PipelineConfig, Subject};
use crate::core::cluster::{IdentityGate, bootstrap_reference};
use crate::core::face::{Embedding, FaceBox, FaceDetector, FaceEmbedder, crop_face};
use crate::core::filter::{FaceRejection, FaceVerdict, MultiFacePolicy, SingleFaceFilter};
use crate::core::hash::{HashBank, HashError, open_image, text_token};
use crate::core::registry::{DuplicateRegistry, Fingerprint, Registration};
use crate::services::download::Downloader;
use crate::services::report::{
    DatasetSummary, IdentityMode, Outcome, RejectKind, Rejection, SubjectReport, SubjectState,
};
use crate::services::source::UrlSource;
use crate::services::store::{StoreError, SubjectStore, is_image_path, write_jpeg};
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const CROP_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker failed: {0}")]
    Worker(String),
}

/// A candidate that passed the face filter, with everything later stages need.
#[derive(Debug)]
pub struct Candidate {
    pub path: PathBuf,
    pub image: DynamicImage,
    pub face: FaceBox,
    pub embedding: Embedding,
    pub fingerprint: Fingerprint,
}

type Analysis = Result<Candidate, Rejection>;

/// CPU-bound per-image work: decode, face filter, embedding and hashes.
pub struct Analyzer {
    hash_bank: HashBank,
    filter: SingleFaceFilter,
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
}

impl Analyzer {
    pub fn new(
        filter: SingleFaceFilter,
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
    ) -> Self {
        Self {
            hash_bank: HashBank::default(),
            filter,
            detector,
            embedder,
        }
    }

    /// Analyse the image at `path`.
    ///
    /// Usually yields one entry. Under the split policy a multi-face image
    /// yields one entry per face crop instead.
    pub fn analyze(&self, path: &Path) -> Vec<Analysis> {
        let image = match open_image(path) {
            Ok(image) => image,
            Err(e) => return vec![Err(Rejection::new(RejectKind::Unreadable, e.to_string()))],
        };

        match self.filter.filter(self.detector.as_ref(), &image) {
            Ok(FaceVerdict::Accept(face)) => vec![self.describe(path.to_path_buf(), image, face)],
            Ok(FaceVerdict::Reject(FaceRejection::MultipleFaces(faces)))
                if self.filter.config().multi_face_policy == MultiFacePolicy::Split =>
            {
                self.split(path, &image, &faces)
            }
            Ok(FaceVerdict::Reject(rejection)) => vec![Err(Rejection::new(
                RejectKind::from(&rejection),
                rejection.to_string(),
            ))],
            Err(e) => vec![Err(Rejection::new(
                RejectKind::Unreadable,
                format!("face detection failed: {e}"),
            ))],
        }
    }

    fn describe(&self, path: PathBuf, image: DynamicImage, face: FaceBox) -> Analysis {
        let embedding = self
            .embedder
            .embed(&image, &face)
            .map_err(|e| Rejection::new(RejectKind::EmbeddingFailure, e.to_string()))?;
        let fingerprint = Fingerprint::from_image(&self.hash_bank, &image);
        Ok(Candidate {
            path,
            image,
            face,
            embedding,
            fingerprint,
        })
    }

    /// Write a padded crop per face next to `path` and judge each crop alone.
    fn split(&self, path: &Path, image: &DynamicImage, faces: &[FaceBox]) -> Vec<Analysis> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "candidate".to_string());
        let padding = self.filter.config().split_padding;
        debug!("Splitting {} into {} face crops", path.display(), faces.len());

        faces
            .iter()
            .enumerate()
            .map(|(i, face)| {
                let unreadable = |e: String| Rejection::new(RejectKind::Unreadable, e);
                let crop = crop_face(image, face, padding).map_err(|e| unreadable(e.to_string()))?;
                let crop_path = path.with_file_name(format!("{stem}_face_{i}.jpg"));
                write_jpeg(&crop, &crop_path, CROP_QUALITY).map_err(|e| unreadable(e.to_string()))?;

                match self.filter.filter(self.detector.as_ref(), &crop) {
                    Ok(FaceVerdict::Accept(face)) => self.describe(crop_path, crop, face),
                    Ok(FaceVerdict::Reject(rejection)) => Err(Rejection::new(
                        RejectKind::from(&rejection),
                        format!("face {i}: {rejection}"),
                    )),
                    Err(e) => Err(unreadable(format!("face detection failed: {e}"))),
                }
            })
            .collect()
    }

    /// Embedding of the single face in `image`, if the filter accepts it.
    fn single_face_embedding(&self, image: &DynamicImage) -> Option<Embedding> {
        match self.filter.filter(self.detector.as_ref(), image) {
            Ok(FaceVerdict::Accept(face)) => self.embedder.embed(image, &face).ok(),
            _ => None,
        }
    }

    /// Fingerprint of a file accepted by an earlier run.
    pub fn fingerprint_stored(
        &self,
        path: &Path,
    ) -> Result<(Fingerprint, Option<Embedding>), HashError> {
        let image = open_image(path)?;
        let embedding = self.single_face_embedding(&image);
        Ok((Fingerprint::from_image(&self.hash_bank, &image), embedding))
    }

    pub fn reference_embedding(&self, path: &Path) -> Option<Embedding> {
        let image = open_image(path).ok()?;
        self.single_face_embedding(&image)
    }
}

/// Per-subject state shared by the worker tasks of one run.
pub struct SubjectSession {
    subject: Subject,
    store: SubjectStore,
    registry: DuplicateRegistry,
    target: usize,
    accepted: AtomicUsize,
    cancellation_token: Arc<AtomicBool>,
    seen: Mutex<HashSet<String>>,
    sequence: AtomicUsize,
}

impl SubjectSession {
    pub fn new(
        subject: Subject,
        store: SubjectStore,
        registry: DuplicateRegistry,
        target: usize,
    ) -> Self {
        Self {
            subject,
            store,
            registry,
            target,
            accepted: AtomicUsize::new(0),
            cancellation_token: Arc::new(AtomicBool::new(false)),
            seen: Mutex::new(HashSet::new()),
            sequence: AtomicUsize::new(0),
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn registry(&self) -> &DuplicateRegistry {
        &self.registry
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// No new candidates are dispatched once this is set.
    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    fn add_accepted(&self, count: usize) {
        let total = self.accepted.fetch_add(count, Ordering::SeqCst) + count;
        if total >= self.target {
            self.cancel();
        }
    }

    /// Drop locators already handed out in this session.
    fn claim(&self, locators: Vec<String>) -> Vec<String> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        locators
            .into_iter()
            .filter(|locator| seen.insert(locator.clone()))
            .collect()
    }

    fn temp_path(&self, locator: &str) -> PathBuf {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let clean = locator.split(['?', '#']).next().unwrap_or(locator);
        let ext = Path::new(clean)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|_| is_image_path(Path::new(clean)))
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "img".to_string());
        self.store
            .temp_dir()
            .join(format!("{n:06}_{}.{ext}", text_token(locator, 12)))
    }

    fn discard(&self, path: &Path) {
        if path.starts_with(self.store.temp_dir()) {
            let _ = fs::remove_file(path);
        }
    }

    /// Identity check, then duplicate check, then storage.
    ///
    /// Blocking; registration and the duplicate comparison share the
    /// registry lock.
    pub fn admit(&self, gate: &IdentityGate, candidate: Candidate) -> Outcome<PipelineError> {
        let Candidate {
            path,
            image,
            embedding,
            fingerprint,
            ..
        } = candidate;

        if let Err(similarity) = gate.check(&embedding) {
            return Outcome::Rejected(Rejection::new(
                RejectKind::WrongIdentity,
                format!("{}: similarity {:.3} to reference", path.display(), similarity),
            ));
        }

        match self
            .registry
            .register_or_reject(&path, fingerprint, Some(embedding))
        {
            Registration::Duplicate(reason) => Outcome::Rejected(Rejection::new(
                RejectKind::from(&reason),
                format!("{}: {}", path.display(), reason),
            )),
            Registration::Unique(id) => match self.store.save_accepted(&image, &path) {
                Ok(dest) => {
                    self.registry.update_path(id, dest.clone());
                    self.add_accepted(1);
                    Outcome::Accepted(dest)
                }
                Err(e) => {
                    self.registry.remove(id);
                    Outcome::Error(PipelineError::Store(e))
                }
            },
        }
    }
}

/// External collaborators plugged into a [`Pipeline`].
pub struct Collaborators {
    pub source: Arc<dyn UrlSource>,
    pub downloader: Arc<dyn Downloader>,
    pub detector: Arc<dyn FaceDetector>,
    pub embedder: Arc<dyn FaceEmbedder>,
}

/// Drives subjects from bootstrap through collection rounds.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    output: PathBuf,
    source: Arc<dyn UrlSource>,
    downloader: Arc<dyn Downloader>,
    analyzer: Arc<Analyzer>,
    download_slots: Arc<Semaphore>,
    compute_slots: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, output: impl Into<PathBuf>, collaborators: Collaborators) -> Self {
        let analyzer = Analyzer::new(
            SingleFaceFilter::new(config.face_filter.clone()),
            collaborators.detector,
            collaborators.embedder,
        );
        Self {
            download_slots: Arc::new(Semaphore::new(config.concurrency.download_concurrency)),
            compute_slots: Arc::new(Semaphore::new(config.concurrency.compute_concurrency)),
            config: Arc::new(config),
            output: output.into(),
            source: collaborators.source,
            downloader: collaborators.downloader,
            analyzer: Arc::new(analyzer),
        }
    }

    pub fn summarize(&self, reports: Vec<SubjectReport>) -> DatasetSummary {
        DatasetSummary::new(self.config.thresholds.clone(), reports)
    }

    /// Run every subject, at most `subject_concurrency` at a time.
    ///
    /// Reports come back in input order.
    pub async fn run_all(&self, subjects: Vec<Subject>) -> Vec<SubjectReport> {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.subject_concurrency));
        let mut tasks = JoinSet::new();
        for (index, subject) in subjects.into_iter().enumerate() {
            let pipeline = self.clone();
            let slots = Arc::clone(&slots);
            tasks.spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                (index, pipeline.run_subject(&subject).await)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Subject task failed: {}", e),
            }
        }
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    pub async fn run_subject(&self, subject: &Subject) -> SubjectReport {
        let target = self.config.collection.target_count;
        let mut report = SubjectReport::new(&subject.name, target);
        let store = SubjectStore::new(&self.output, &subject.slug(), self.config.store.clone());
        let session = Arc::new(SubjectSession::new(
            subject.clone(),
            store,
            DuplicateRegistry::new(self.config.thresholds.duplicates()),
            target,
        ));

        let result = self.collect(&session, &mut report).await;
        session.store.cleanup_temp();

        let accepted = session.accepted_count();
        match result {
            Ok(()) if accepted >= target => report.finish(accepted, SubjectState::Done),
            Ok(()) => report.finish(accepted, SubjectState::Exhausted),
            Err(e) => {
                error!("{}: run aborted: {}", subject.name, e);
                report.error = Some(e.to_string());
                report.finish(accepted, SubjectState::Failed);
            }
        }
        info!(
            "{}: {} / {} accepted ({:?}, {} rejected)",
            subject.name,
            report.accepted_count,
            report.target_count,
            report.state,
            report.total_rejected()
        );
        report
    }

    async fn collect(
        &self,
        session: &Arc<SubjectSession>,
        report: &mut SubjectReport,
    ) -> Result<(), PipelineError> {
        let name = session.subject.name.clone();
        session.store.prepare()?;

        report.resumed = self.resume(session).await?;
        if session.is_cancelled() {
            info!("{}: target already met by stored images", name);
            report.identity = IdentityMode::NotRequired;
            return Ok(());
        }

        info!("{}: bootstrapping reference identity", name);
        let (gate, bootstrap_candidates) = match self.load_reference(session).await {
            Some(gate) => {
                report.identity = IdentityMode::Loaded;
                (gate, Vec::new())
            }
            None => self.bootstrap(session, report).await?,
        };
        let gate = Arc::new(gate);

        info!("{}: collecting", name);
        for candidate in bootstrap_candidates {
            if session.is_cancelled() {
                session.discard(&candidate.path);
                continue;
            }
            let path = candidate.path.clone();
            let outcome = self.admit(session, &gate, candidate).await;
            session.discard(&path);
            record(report, outcome)?;
        }

        for round in 1..=self.config.collection.max_rounds {
            if session.is_cancelled() {
                break;
            }
            let locators = self
                .gather(session, self.config.collection.round_batch, usize::MAX)
                .await;
            if locators.is_empty() {
                info!("{}: candidate source exhausted after {} round(s)", name, round - 1);
                break;
            }
            report.rounds = round;
            self.run_round(session, &gate, locators, round, report)
                .await?;
        }
        Ok(())
    }

    /// Seed the registry with files accepted by an earlier run.
    async fn resume(&self, session: &Arc<SubjectSession>) -> Result<usize, PipelineError> {
        let existing = session.store.existing_images();
        if existing.is_empty() {
            return Ok(0);
        }

        let analyzer = Arc::clone(&self.analyzer);
        let fingerprints = tokio::task::spawn_blocking(move || {
            existing
                .par_iter()
                .map(|path| (path.clone(), analyzer.fingerprint_stored(path)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PipelineError::Worker(e.to_string()))?;

        let mut seeded = 0;
        for (path, result) in fingerprints {
            match result {
                Ok((fingerprint, embedding)) => {
                    session.registry.seed(path, fingerprint, embedding);
                    seeded += 1;
                }
                Err(e) => warn!("Skipping unreadable stored image {}: {}", path.display(), e),
            }
        }
        session.add_accepted(seeded);
        info!("{}: resumed with {} stored image(s)", session.subject.name, seeded);
        Ok(seeded)
    }

    async fn load_reference(&self, session: &Arc<SubjectSession>) -> Option<IdentityGate> {
        let path = session.store.reference_path();
        if !path.exists() {
            return None;
        }
        let analyzer = Arc::clone(&self.analyzer);
        let lookup = path.clone();
        let embedding = self
            .compute(self.config.timeouts.compute(), move || {
                analyzer.reference_embedding(&lookup)
            })
            .await
            .ok()
            .flatten();

        match embedding {
            Some(reference) => {
                info!("Loaded reference identity from {}", path.display());
                Some(IdentityGate::Verified {
                    reference,
                    threshold: self.config.thresholds.identity_similarity,
                })
            }
            None => {
                warn!("Reference {} has no usable face; bootstrapping again", path.display());
                None
            }
        }
    }

    /// Filter an initial sample and derive the reference identity from it.
    ///
    /// Returns the gate plus the sample's face-filtered candidates, which
    /// are admitted afterwards like any other candidate.
    async fn bootstrap(
        &self,
        session: &Arc<SubjectSession>,
        report: &mut SubjectReport,
    ) -> Result<(IdentityGate, Vec<Candidate>), PipelineError> {
        let sample = self.config.collection.bootstrap_sample;
        let locators = self.gather(session, sample, sample).await;
        let progress = self.progress_bar(
            locators.len() as u64,
            format!("{} bootstrap", session.subject.name),
        );

        let mut tasks = JoinSet::new();
        for locator in locators {
            let pipeline = self.clone();
            let session = Arc::clone(session);
            let progress = progress.clone();
            tasks.spawn(async move {
                let analyses = match pipeline.fetch(&session, &locator).await {
                    None => None,
                    Some(Err(rejection)) => Some(vec![Err(rejection)]),
                    Some(Ok(downloaded)) => {
                        let analyses = pipeline.analyze(downloaded.clone()).await;
                        let kept = analyses
                            .iter()
                            .any(|a| a.as_ref().is_ok_and(|c| c.path == downloaded));
                        if !kept {
                            session.discard(&downloaded);
                        }
                        Some(analyses)
                    }
                };
                progress.inc(1);
                analyses
            });
        }

        let mut candidates = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let analyses = joined.map_err(|e| PipelineError::Worker(e.to_string()))?;
            let Some(analyses) = analyses else {
                continue;
            };
            report.candidates += 1;
            for analysis in analyses {
                match analysis {
                    Ok(candidate) => candidates.push(candidate),
                    Err(rejection) => {
                        debug!("Bootstrap rejected {}", rejection);
                        report.record_rejection(rejection.kind);
                    }
                }
            }
        }
        progress.finish_and_clear();
        candidates.sort_by(|a, b| a.path.cmp(&b.path));

        let embeddings: Vec<Embedding> = candidates.iter().map(|c| c.embedding.clone()).collect();
        let clustering = self.config.clustering.clone();
        let result = tokio::task::spawn_blocking(move || bootstrap_reference(&embeddings, &clustering))
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;

        let gate = match result {
            Ok(bootstrap) => {
                report.identity = IdentityMode::Verified {
                    cluster_size: bootstrap.cluster_size,
                    sample_size: bootstrap.sample_size,
                };
                if let Err(e) = session
                    .store
                    .save_reference(&candidates[bootstrap.reference_index].image)
                {
                    warn!("Could not save reference exemplar: {}", e);
                }
                IdentityGate::Verified {
                    reference: bootstrap.reference,
                    threshold: self.config.thresholds.identity_similarity,
                }
            }
            Err(failure) => {
                warn!(
                    "{}: identity check disabled, every face is accepted as the subject: {}",
                    session.subject.name, failure
                );
                report.identity = IdentityMode::permissive(&failure);
                IdentityGate::Permissive
            }
        };
        Ok((gate, candidates))
    }

    async fn run_round(
        &self,
        session: &Arc<SubjectSession>,
        gate: &Arc<IdentityGate>,
        locators: Vec<String>,
        round: usize,
        report: &mut SubjectReport,
    ) -> Result<(), PipelineError> {
        let progress = self.progress_bar(
            locators.len() as u64,
            format!("{} round {}", session.subject.name, round),
        );

        let mut tasks = JoinSet::new();
        for locator in locators {
            let pipeline = self.clone();
            let session = Arc::clone(session);
            let gate = Arc::clone(gate);
            let progress = progress.clone();
            tasks.spawn(async move {
                let outcomes = pipeline.process(&session, &gate, &locator).await;
                progress.inc(1);
                outcomes
            });
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            let outcomes = match joined {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    session.cancel();
                    fatal.get_or_insert(PipelineError::Worker(e.to_string()));
                    continue;
                }
            };
            let Some(outcomes) = outcomes else {
                continue;
            };
            report.candidates += 1;
            for outcome in outcomes {
                if let Err(e) = record(report, outcome) {
                    session.cancel();
                    fatal.get_or_insert(e);
                }
            }
            progress.set_message(format!("{} accepted", session.accepted_count()));
        }
        progress.finish_and_clear();

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Full path of one locator; `None` if it was never dispatched.
    async fn process(
        &self,
        session: &Arc<SubjectSession>,
        gate: &Arc<IdentityGate>,
        locator: &str,
    ) -> Option<Vec<Outcome<PipelineError>>> {
        let downloaded = match self.fetch(session, locator).await? {
            Ok(path) => path,
            Err(rejection) => return Some(vec![Outcome::Rejected(rejection)]),
        };

        let mut outcomes = Vec::new();
        for analysis in self.analyze(downloaded.clone()).await {
            outcomes.push(match analysis {
                Ok(candidate) => {
                    let path = candidate.path.clone();
                    let outcome = self.admit(session, gate, candidate).await;
                    session.discard(&path);
                    outcome
                }
                Err(rejection) => Outcome::Rejected(rejection),
            });
        }
        session.discard(&downloaded);
        Some(outcomes)
    }

    async fn fetch(
        &self,
        session: &Arc<SubjectSession>,
        locator: &str,
    ) -> Option<Result<PathBuf, Rejection>> {
        let permit = Arc::clone(&self.download_slots).acquire_owned().await.ok()?;
        if session.is_cancelled() {
            return None;
        }

        let dest = session.temp_path(locator);
        let downloader = Arc::clone(&self.downloader);
        let owned = locator.to_string();
        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            downloader.fetch(&owned, &dest)
        });

        let budget = self.config.timeouts.download() * self.config.download.retries.max(1);
        Some(match tokio::time::timeout(budget, work).await {
            Ok(Ok(Ok(path))) => Ok(path),
            Ok(Ok(Err(e))) => Err(Rejection::new(
                RejectKind::DownloadFailure,
                format!("{locator}: {e}"),
            )),
            Ok(Err(e)) => Err(Rejection::new(
                RejectKind::DownloadFailure,
                format!("{locator}: download worker failed: {e}"),
            )),
            Err(_) => Err(Rejection::new(
                RejectKind::Timeout,
                format!("{locator}: download exceeded {budget:?}"),
            )),
        })
    }

    async fn analyze(&self, path: PathBuf) -> Vec<Analysis> {
        let analyzer = Arc::clone(&self.analyzer);
        match self
            .compute(self.config.timeouts.compute(), move || analyzer.analyze(&path))
            .await
        {
            Ok(analyses) => analyses,
            Err(rejection) => vec![Err(rejection)],
        }
    }

    async fn admit(
        &self,
        session: &Arc<SubjectSession>,
        gate: &Arc<IdentityGate>,
        candidate: Candidate,
    ) -> Outcome<PipelineError> {
        let permit = match Arc::clone(&self.compute_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => return Outcome::Error(PipelineError::Worker(e.to_string())),
        };
        let session = Arc::clone(session);
        let gate = Arc::clone(gate);
        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            session.admit(&gate, candidate)
        });
        match work.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Error(PipelineError::Worker(e.to_string())),
        }
    }

    /// Run `work` on the blocking pool under a compute slot and a deadline.
    async fn compute<T, F>(&self, limit: Duration, work: F) -> Result<T, Rejection>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.compute_slots)
            .acquire_owned()
            .await
            .map_err(|e| Rejection::new(RejectKind::Unreadable, e.to_string()))?;
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        });
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Rejection::new(
                RejectKind::Unreadable,
                format!("analysis worker failed: {e}"),
            )),
            Err(_) => Err(Rejection::new(
                RejectKind::Timeout,
                format!("analysis exceeded {limit:?}"),
            )),
        }
    }

    /// Ask the source for up to `per_alias` new locators per query, `limit` in total.
    async fn gather(&self, session: &Arc<SubjectSession>, per_alias: usize, limit: usize) -> Vec<String> {
        let mut batch = Vec::new();
        for alias in session.subject.queries() {
            if batch.len() >= limit {
                break;
            }
            let want = per_alias.min(limit - batch.len());
            let source = Arc::clone(&self.source);
            let query = alias.to_string();
            match tokio::task::spawn_blocking(move || source.search(&query, want)).await {
                Ok(Ok(found)) => batch.extend(session.claim(found)),
                Ok(Err(e)) => warn!("Search for '{}' failed: {}", alias, e),
                Err(e) => warn!("Search task for '{}' failed: {}", alias, e),
            }
        }
        batch
    }

    fn progress_bar(&self, len: u64, prefix: String) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        bar.set_prefix(prefix);
        bar
    }
}

fn record(report: &mut SubjectReport, outcome: Outcome<PipelineError>) -> Result<(), PipelineError> {
    match outcome {
        Outcome::Accepted(path) => {
            debug!("Accepted {}", path.display());
            Ok(())
        }
        Outcome::Rejected(rejection) => {
            debug!("Rejected {}", rejection);
            report.record_rejection(rejection.kind);
            Ok(())
        }
        Outcome::Error(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use crate::core::face::FaceError;
    use crate::core::filter::FaceFilterConfig;
    use crate::services::download::{DownloadError, LocalCopier};
    use crate::services::report::write_summary;
    use crate::services::source::DirectorySource;
    use crate::testutil::{PixelEmbedder, block_noise_image, write_png};
    use image::{GenericImageView, Rgb};
    use tempfile::TempDir;

    const DIM: usize = 64;
    const SUBJECT: u8 = 1;
    const CO_STAR: u8 = 2;

    /// Unique background plus two gray marker blocks encoding who is shown.
    fn marked_image(seed: u64, group: u8, index: u8) -> DynamicImage {
        let mut img = block_noise_image(seed, 200, 200, 10).to_rgb8();
        for y in 0..16 {
            for x in 0..32 {
                let v = if x < 16 { group * 60 } else { 10 + index * 6 };
                img.put_pixel(x, y, Rgb([v, v, v]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    struct CentredFace;

    impl FaceDetector for CentredFace {
        fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, FaceError> {
            let (w, h) = image.dimensions();
            Ok(vec![FaceBox::new(w / 4, h / 4, w / 2, h / 2)])
        }
    }

    /// Reads the marker blocks back: subject faces sit near e0, co-star
    /// faces near e40, each on its own perturbation axis.
    struct MarkerEmbedder;

    impl FaceEmbedder for MarkerEmbedder {
        fn embed(&self, image: &DynamicImage, _face: &FaceBox) -> Result<Embedding, FaceError> {
            let gray = image.to_luma8();
            let scale = image.width() as f32 / 200.0;
            let sample = |x: f32, y: f32| {
                i32::from(gray.get_pixel((x * scale) as u32, (y * scale) as u32)[0])
            };
            let group = (sample(8.0, 8.0) + 30) / 60;
            let index = ((sample(24.0, 8.0) - 7) / 6).max(0) as usize;
            let (base, offset) = match group {
                1 => (0, 1 + index),
                2 => (40, 41 + index),
                _ => return Err(FaceError::DegenerateCrop),
            };
            let mut v = vec![0.0f32; DIM];
            v[base] = 1.0;
            v[offset] += 0.2;
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            Ok(Embedding(v.into_iter().map(|x| x / norm).collect()))
        }
    }

    struct SlowDownloader;

    impl Downloader for SlowDownloader {
        fn fetch(&self, _locator: &str, dest: &Path) -> Result<PathBuf, DownloadError> {
            std::thread::sleep(Duration::from_millis(1500));
            Ok(dest.to_path_buf())
        }
    }

    fn test_config(target: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.collection = CollectionConfig {
            target_count: target,
            max_rounds: 5,
            bootstrap_sample: 20,
            round_batch: 50,
        };
        // MarkerEmbedder puts one person's faces 0.28 apart, two people sqrt(2)
        config.thresholds.face_duplicate_similarity = 0.9;
        config.thresholds.identity_similarity = 0.6;
        config.clustering.eps = 0.55;
        config.download.min_bytes = 1;
        config.concurrency.download_concurrency = 4;
        config.concurrency.compute_concurrency = 2;
        config.show_progress = false;
        config
    }

    fn pipeline(config: PipelineConfig, pool: &Path, output: &Path) -> Pipeline {
        let downloader = LocalCopier::new(config.download.clone());
        Pipeline::new(
            config,
            output,
            Collaborators {
                source: Arc::new(DirectorySource::new(pool)),
                downloader: Arc::new(downloader),
                detector: Arc::new(CentredFace),
                embedder: Arc::new(MarkerEmbedder),
            },
        )
    }

    /// 20 bootstrap files (14 subject, 6 co-star) and 16 later files
    /// (10 subject, 6 co-star), named so the bootstrap sample is `b*`.
    fn write_scenario_pool(root: &Path, slug: &str) {
        let dir = root.join(slug);
        fs::create_dir_all(&dir).unwrap();
        let (mut subject, mut co_star, mut seed) = (0u8, 0u8, 100u64);
        let mut write = |name: String, is_co_star: bool| {
            let image = if is_co_star {
                co_star += 1;
                marked_image(seed, CO_STAR, co_star - 1)
            } else {
                subject += 1;
                marked_image(seed, SUBJECT, subject - 1)
            };
            seed += 1;
            write_png(&dir, &name, &image);
        };
        for i in 0..20 {
            write(format!("b{i:02}.png"), [2, 5, 8, 11, 14, 17].contains(&i));
        }
        for i in 0..16 {
            write(format!("c{i:02}.png"), [1, 4, 7, 10, 13, 15].contains(&i));
        }
    }

    #[tokio::test]
    async fn test_co_star_is_rejected_after_bootstrap() {
        let pool = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_scenario_pool(pool.path(), "Jane_Doe");

        let pipeline = pipeline(test_config(30), pool.path(), output.path());
        let report = pipeline.run_subject(&Subject::new("Jane Doe")).await;

        assert_eq!(
            report.identity,
            IdentityMode::Verified {
                cluster_size: 14,
                sample_size: 20
            }
        );
        assert_eq!(report.accepted_count, 24);
        assert_eq!(report.rejected(RejectKind::WrongIdentity), 12);
        assert_eq!(report.total_rejected(), 12);
        assert_eq!(report.candidates, 36);
        assert_eq!(report.state, SubjectState::Exhausted);
        assert_eq!(report.shortfall, 6);

        let stored = SubjectStore::new(output.path(), "Jane_Doe", Default::default());
        assert_eq!(stored.existing_images().len(), 24);
        assert!(stored.reference_path().exists());
        assert!(!stored.temp_dir().exists());
    }

    #[tokio::test]
    async fn test_target_reached_then_resumed() {
        let pool = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_scenario_pool(pool.path(), "Jane_Doe");
        let subject = Subject::new("Jane Doe");

        let first = pipeline(test_config(5), pool.path(), output.path())
            .run_subject(&subject)
            .await;
        assert_eq!(first.state, SubjectState::Done);
        assert_eq!(first.accepted_count, 5);
        assert_eq!(first.rounds, 0);

        let second = pipeline(test_config(8), pool.path(), output.path())
            .run_subject(&subject)
            .await;
        assert_eq!(second.resumed, 5);
        assert_eq!(second.identity, IdentityMode::Loaded);
        assert_eq!(second.state, SubjectState::Done);
        assert!(second.accepted_count >= 8);
        assert!(second.rejection_groups.get("duplicate").copied().unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn test_target_met_by_stored_images_needs_no_identity() {
        let pool = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_scenario_pool(pool.path(), "Jane_Doe");
        let subject = Subject::new("Jane Doe");

        let first = pipeline(test_config(6), pool.path(), output.path())
            .run_subject(&subject)
            .await;
        assert_eq!(first.state, SubjectState::Done);

        let again = pipeline(test_config(4), pool.path(), output.path())
            .run_subject(&subject)
            .await;
        assert_eq!(again.state, SubjectState::Done);
        assert_eq!(again.resumed, first.accepted_count);
        assert_eq!(again.candidates, 0);
        assert_eq!(again.identity, IdentityMode::NotRequired);

        let summary = pipeline(test_config(4), pool.path(), output.path()).summarize(vec![again]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["subjects"][0]["identity"]["mode"], "not_required");
    }

    #[tokio::test]
    async fn test_small_sample_falls_back_to_permissive() {
        let pool = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        for (slug, offset) in [("Ann", 0u64), ("Bob", 10)] {
            let dir = pool.path().join(slug);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..3u8 {
                let image = marked_image(500 + offset + u64::from(i), SUBJECT, i);
                write_png(&dir, &format!("{i}.png"), &image);
            }
        }

        let mut config = test_config(10);
        config.concurrency.subject_concurrency = 2;
        let pipeline = pipeline(config, pool.path(), output.path());
        let reports = pipeline
            .run_all(vec![Subject::new("Ann"), Subject::new("Bob")])
            .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "Ann");
        assert_eq!(reports[1].name, "Bob");
        for report in &reports {
            assert_eq!(report.accepted_count, 3);
            assert_eq!(report.shortfall, 7);
            assert_eq!(report.state, SubjectState::Exhausted);
            match &report.identity {
                IdentityMode::Permissive { cause } => assert!(cause.contains("insufficient")),
                other => panic!("expected permissive identity, got {other:?}"),
            }
        }

        let summary = pipeline.summarize(reports);
        assert_eq!(summary.total_accepted, 6);
        assert!(write_summary(output.path(), &summary).unwrap().exists());
    }

    #[tokio::test]
    async fn test_slow_downloads_count_as_timeouts() {
        let pool = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let dir = pool.path().join("Slow");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..2u8 {
            write_png(&dir, &format!("{i}.png"), &marked_image(900 + u64::from(i), SUBJECT, i));
        }

        let mut config = test_config(5);
        config.timeouts.download_secs = 1;
        config.download.retries = 1;
        let pipeline = Pipeline::new(
            config,
            output.path(),
            Collaborators {
                source: Arc::new(DirectorySource::new(pool.path())),
                downloader: Arc::new(SlowDownloader),
                detector: Arc::new(CentredFace),
                embedder: Arc::new(MarkerEmbedder),
            },
        );

        let report = pipeline.run_subject(&Subject::new("Slow")).await;
        assert_eq!(report.rejected(RejectKind::Timeout), 2);
        assert_eq!(report.accepted_count, 0);
        assert_eq!(report.state, SubjectState::Exhausted);
    }

    #[tokio::test]
    async fn test_unwritable_output_fails_subject() {
        let pool = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        fs::write(output.path().join("processed"), b"in the way").unwrap();

        let report = pipeline(test_config(5), pool.path(), output.path())
            .run_subject(&Subject::new("Jane Doe"))
            .await;
        assert_eq!(report.state, SubjectState::Failed);
        assert!(report.error.is_some());
    }

    /// Two faces on 400px-wide images, one face on anything else.
    struct GroupPhoto;

    impl FaceDetector for GroupPhoto {
        fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, FaceError> {
            let (w, h) = image.dimensions();
            if w == 400 {
                Ok(vec![
                    FaceBox::new(40, 50, 100, 100),
                    FaceBox::new(260, 50, 100, 100),
                ])
            } else {
                Ok(vec![FaceBox::new(w / 8, h / 8, w * 3 / 4, h * 3 / 4)])
            }
        }
    }

    fn analyzer(policy: MultiFacePolicy) -> Analyzer {
        Analyzer::new(
            SingleFaceFilter::new(FaceFilterConfig {
                multi_face_policy: policy,
                ..FaceFilterConfig::default()
            }),
            Arc::new(GroupPhoto),
            Arc::new(PixelEmbedder),
        )
    }

    #[test]
    fn test_split_policy_yields_face_crops() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_png(temp_dir.path(), "group.png", &block_noise_image(77, 400, 200, 5));

        let analyses = analyzer(MultiFacePolicy::Split).analyze(&path);
        assert_eq!(analyses.len(), 2);
        for (i, analysis) in analyses.iter().enumerate() {
            let candidate = analysis.as_ref().unwrap();
            assert_eq!(
                candidate.path,
                temp_dir.path().join(format!("group_face_{i}.jpg"))
            );
            assert!(candidate.path.exists());
            assert_eq!(candidate.image.dimensions(), (150, 150));
        }
    }

    #[test]
    fn test_discard_policy_rejects_group_photo() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_png(temp_dir.path(), "group.png", &block_noise_image(78, 400, 200, 5));

        let analyses = analyzer(MultiFacePolicy::Discard).analyze(&path);
        assert_eq!(analyses.len(), 1);
        assert_eq!(
            analyses[0].as_ref().unwrap_err().kind,
            RejectKind::MultipleFaces
        );
    }

    #[test]
    fn test_unreadable_candidate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.jpg");
        fs::write(&path, b"<html>not an image</html>").unwrap();

        let analyses = analyzer(MultiFacePolicy::Discard).analyze(&path);
        assert_eq!(analyses[0].as_ref().unwrap_err().kind, RejectKind::Unreadable);
    }

    #[test]
    fn test_admit_rejects_wrong_identity_before_registering() {
        let temp_dir = TempDir::new().unwrap();
        let store = SubjectStore::new(temp_dir.path(), "Jane_Doe", Default::default());
        store.prepare().unwrap();
        let session = SubjectSession::new(
            Subject::new("Jane Doe"),
            store,
            DuplicateRegistry::default(),
            10,
        );

        let image = marked_image(1, CO_STAR, 0);
        let path = write_png(session.store.temp_dir(), "c.png", &image);
        let candidate = analyzer(MultiFacePolicy::Discard)
            .analyze(&path)
            .pop()
            .unwrap()
            .unwrap();
        let gate = IdentityGate::Verified {
            reference: Embedding(vec![0.0; candidate.embedding.dim()]),
            threshold: 0.99,
        };

        match session.admit(&gate, candidate) {
            Outcome::Rejected(rejection) => assert_eq!(rejection.kind, RejectKind::WrongIdentity),
            other => panic!("expected wrong identity, got {other:?}"),
        }
        assert!(session.registry().is_empty());
        assert_eq!(session.accepted_count(), 0);
    }
}
