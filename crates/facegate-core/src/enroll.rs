//! Enrollment: one photo in, one identity with a primary and several
//! synthetic embeddings out.
//!
//! ```text
//! RECEIVED → PRIMARY_EMBEDDED → SYNTHESIZING → COMPLETE
//!     └──────────┴──→ FAILED  (primary unusable; nothing is stored)
//! ```
//!
//! The identity is committed with its primary embedding before synthesis
//! starts, so it is matchable while synthetic samples are still being
//! appended. A synthetic sample that fails to embed or store is logged and
//! skipped.

use crate::augment::{sample_seed, Augmenter};
use crate::embedder::{Embedder, EmbeddingError, FaceQuality};
use crate::image::FaceImage;
use crate::store::{IdentityStore, StoreError};
use crate::types::{Embedding, EmbeddingKind, IdentityId};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("primary image rejected: {0}")]
    Primary(#[from] EmbeddingError),
    #[error(
        "primary image has no detected face (center-crop fallback) \
         and degraded enrollments are rejected"
    )]
    DegradedPrimary,
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Lifecycle of one enrollment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentState {
    Received,
    PrimaryEmbedded,
    Synthesizing,
    Complete,
    Failed,
}

impl EnrollmentState {
    pub fn can_advance_to(self, next: EnrollmentState) -> bool {
        use EnrollmentState::*;
        matches!(
            (self, next),
            (Received, PrimaryEmbedded)
                | (Received, Failed)
                | (PrimaryEmbedded, Synthesizing)
                | (PrimaryEmbedded, Failed)
                | (Synthesizing, Complete)
        )
    }
}

/// Tracks and logs the state of a single request.
struct Progress {
    state: EnrollmentState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: EnrollmentState::Received,
        }
    }

    fn advance(&mut self, next: EnrollmentState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal enrollment transition {:?} → {next:?}",
            self.state
        );
        tracing::debug!(from = ?self.state, to = ?next, "enrollment state");
        self.state = next;
    }
}

/// Enrollment tuning.
#[derive(Debug, Clone)]
pub struct EnrollConfig {
    /// Synthetic samples attempted per enrollment.
    pub synthetic_samples: usize,
    /// Threads used for synthesis; 1 runs it on the calling thread.
    pub workers: usize,
    /// Refuse primaries (and skip synthetic samples) flagged as center-crop fallbacks.
    pub reject_degraded: bool,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            synthetic_samples: 5,
            workers: 1,
            reject_degraded: false,
        }
    }
}

/// Shared flag that stops further synthetic sub-steps.
///
/// Clones observe the same flag. Samples already committed stay in the store.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// True when both handles are clones of one flag.
    pub fn same_as(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An identity whose primary embedding is committed and whose synthetic
/// samples have not been generated yet.
#[derive(Debug, Clone)]
pub struct PendingSynthesis {
    pub identity: IdentityId,
    pub quality: FaceQuality,
    source: FaceImage,
    seed: u64,
    samples: usize,
}

impl PendingSynthesis {
    pub fn samples(&self) -> usize {
        self.samples
    }
}

/// Outcome of the synthesis phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SynthesisReport {
    pub attempted: usize,
    pub committed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// What the calling layer gets back from an enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollReport {
    pub identity_id: IdentityId,
    pub primary_embedding_ok: bool,
    pub synthetic_count: usize,
    pub synthetic_attempted: usize,
    pub quality: FaceQuality,
    pub state: EnrollmentState,
}

/// Orchestrates the Augmenter and the Embedder to build gallery entries.
pub struct EnrollmentPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IdentityStore>,
    augmenter: Augmenter,
    config: EnrollConfig,
}

impl EnrollmentPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn IdentityStore>,
        augmenter: Augmenter,
        config: EnrollConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            augmenter,
            config,
        }
    }

    pub fn config(&self) -> &EnrollConfig {
        &self.config
    }

    /// Full enrollment: primary commit followed by synthesis on this call.
    ///
    /// `seed` fixes the augmentation draws; `None` picks a random one.
    /// Raising `cancel` stops the remaining synthetic samples.
    pub fn enroll(
        &self,
        image_bytes: &[u8],
        label: Option<&str>,
        seed: Option<u64>,
        cancel: &CancelFlag,
    ) -> Result<EnrollReport, EnrollError> {
        let image = FaceImage::decode(image_bytes).map_err(EmbeddingError::from);
        let image = match image {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "enrollment failed: unreadable image");
                return Err(e.into());
            }
        };

        self.enroll_image(&image, label, seed, cancel)
    }

    /// [`enroll`](Self::enroll) for an already decoded image.
    pub fn enroll_image(
        &self,
        image: &FaceImage,
        label: Option<&str>,
        seed: Option<u64>,
        cancel: &CancelFlag,
    ) -> Result<EnrollReport, EnrollError> {
        let pending = self.begin(image, label, seed)?;
        let report = self.synthesize(&pending, cancel);

        tracing::info!(
            identity = %pending.identity,
            synthetic = report.committed,
            attempted = report.attempted,
            "enrollment complete"
        );

        Ok(EnrollReport {
            identity_id: pending.identity,
            primary_embedding_ok: true,
            synthetic_count: report.committed,
            synthetic_attempted: report.attempted,
            quality: pending.quality,
            state: EnrollmentState::Complete,
        })
    }

    /// Embed the primary image and commit the identity.
    ///
    /// On error nothing has been written to the store.
    pub fn begin(
        &self,
        image: &FaceImage,
        label: Option<&str>,
        seed: Option<u64>,
    ) -> Result<PendingSynthesis, EnrollError> {
        let mut progress = Progress::new();

        let extraction = match self.embedder.embed(image) {
            Ok(extraction) => extraction,
            Err(e) => {
                progress.advance(EnrollmentState::Failed);
                tracing::warn!(error = %e, "enrollment failed: primary embedding");
                return Err(e.into());
            }
        };
        progress.advance(EnrollmentState::PrimaryEmbedded);

        if let Err(e) = check_embedding(&extraction.embedding) {
            progress.advance(EnrollmentState::Failed);
            tracing::warn!(error = %e, "enrollment failed: primary embedding malformed");
            return Err(e.into());
        }

        if self.config.reject_degraded && extraction.quality.is_degraded() {
            progress.advance(EnrollmentState::Failed);
            tracing::warn!("enrollment failed: degraded primary rejected by policy");
            return Err(EnrollError::DegradedPrimary);
        }

        let identity = match self.store.create_identity(&extraction.embedding, label) {
            Ok(id) => id,
            Err(e) => {
                progress.advance(EnrollmentState::Failed);
                tracing::warn!(error = %e, "enrollment failed: identity not created");
                return Err(e.into());
            }
        };
        tracing::info!(
            identity = %identity,
            quality = ?extraction.quality,
            "identity created with primary embedding"
        );

        Ok(PendingSynthesis {
            identity,
            quality: extraction.quality,
            source: image.clone(),
            seed: seed.unwrap_or_else(rand::random),
            samples: self.config.synthetic_samples,
        })
    }

    /// Generate, embed and append the synthetic samples of a pending identity.
    ///
    /// Never fails: each sub-step that errors contributes nothing.
    pub fn synthesize(&self, pending: &PendingSynthesis, cancel: &CancelFlag) -> SynthesisReport {
        self.run_synthesis(
            &pending.identity,
            &pending.source,
            pending.seed,
            pending.samples,
            cancel,
        )
    }

    /// Append `count` more synthetic samples to an existing identity.
    pub fn extend(
        &self,
        identity: &IdentityId,
        image: &FaceImage,
        count: usize,
        seed: Option<u64>,
        cancel: &CancelFlag,
    ) -> Result<SynthesisReport, EnrollError> {
        let known = self
            .store
            .list_identities()?
            .iter()
            .any(|summary| summary.id == *identity);
        if !known {
            return Err(StoreError::UnknownIdentity(identity.clone()).into());
        }

        let seed = seed.unwrap_or_else(rand::random);
        let report = self.run_synthesis(identity, image, seed, count, cancel);
        tracing::info!(
            identity = %identity,
            synthetic = report.committed,
            attempted = report.attempted,
            "identity extended"
        );
        Ok(report)
    }

    fn run_synthesis(
        &self,
        identity: &IdentityId,
        source: &FaceImage,
        seed: u64,
        total: usize,
        cancel: &CancelFlag,
    ) -> SynthesisReport {
        let mut progress = Progress {
            state: EnrollmentState::PrimaryEmbedded,
        };
        progress.advance(EnrollmentState::Synthesizing);

        let attempted = AtomicUsize::new(0);
        let committed = AtomicUsize::new(0);
        let workers = self.config.workers.clamp(1, total.max(1));

        let run_worker = |worker: usize| {
            for index in (worker..total).step_by(workers) {
                if cancel.is_cancelled() {
                    break;
                }
                attempted.fetch_add(1, Ordering::SeqCst);
                match self.synthesize_one(identity, source, seed, index) {
                    Ok(()) => {
                        committed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => tracing::warn!(
                        identity = %identity,
                        sample = index,
                        error = %e,
                        "synthetic sample dropped"
                    ),
                }
            }
        };

        if workers == 1 {
            run_worker(0);
        } else {
            std::thread::scope(|scope| {
                for worker in 0..workers {
                    let run_worker = &run_worker;
                    scope.spawn(move || run_worker(worker));
                }
            });
        }

        progress.advance(EnrollmentState::Complete);

        let attempted = attempted.into_inner();
        let committed = committed.into_inner();
        SynthesisReport {
            attempted,
            committed,
            failed: attempted - committed,
            cancelled: attempted < total,
        }
    }

    fn synthesize_one(
        &self,
        identity: &IdentityId,
        source: &FaceImage,
        seed: u64,
        index: usize,
    ) -> Result<(), SampleError> {
        let variant = self.augmenter.augment(source, sample_seed(seed, index));
        let extraction = self.embedder.embed(&variant)?;
        check_embedding(&extraction.embedding)?;
        if self.config.reject_degraded && extraction.quality.is_degraded() {
            return Err(SampleError::Degraded);
        }
        self.store
            .append_embedding(identity, &extraction.embedding, EmbeddingKind::Synthetic)?;
        Ok(())
    }
}

fn check_embedding(embedding: &Embedding) -> Result<(), EmbeddingError> {
    if embedding.is_well_formed() {
        return Ok(());
    }
    let detail = match embedding.first_non_finite() {
        Some(idx) => format!("non-finite value at index {idx}"),
        None => "empty vector".to_string(),
    };
    Err(EmbeddingError::MalformedEmbedding(detail))
}

#[derive(Error, Debug)]
enum SampleError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("degraded sample rejected by policy")]
    Degraded,
    #[error(transparent)]
    Store(#[from] StoreError),
}
