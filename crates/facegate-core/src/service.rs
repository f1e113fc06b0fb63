//! Calling-layer API: enroll, recognize and gallery administration over one
//! embedder and one identity store.

use crate::augment::{AugmentConfig, Augmenter};
use crate::embedder::{Embedder, EmbeddingError, FaceQuality};
use crate::enroll::{
    CancelFlag, EnrollConfig, EnrollError, EnrollReport, EnrollmentPipeline, PendingSynthesis,
    SynthesisReport,
};
use crate::image::{FaceImage, ImageError};
use crate::matcher::{CosineMatcher, MatchError, Matcher};
use crate::store::{IdentityStore, StoreError};
use crate::types::{IdentityId, IdentitySummary, MatchResult};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Default similarity threshold for accepting a match.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("probe image rejected: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("gallery unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("match failed: {0}")]
    Match(#[from] MatchError),
}

/// An image as handed over by a caller.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Encoded image file bytes.
    Bytes(Vec<u8>),
    /// Base64 text, optionally a `data:` URL.
    Base64(String),
}

impl ImageInput {
    pub fn decode(&self) -> Result<FaceImage, ImageError> {
        match self {
            ImageInput::Bytes(bytes) => FaceImage::decode(bytes),
            ImageInput::Base64(text) => FaceImage::from_base64(text),
        }
    }
}

/// Recognition outcome for a probe that could be embedded.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    #[serde(flatten)]
    pub result: MatchResult,
    pub quality: FaceQuality,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub model_version: String,
    pub identities: usize,
    pub embeddings: usize,
    /// Embeddings produced by the active model; the rest are never matched.
    pub current_model_embeddings: usize,
}

pub struct FaceService {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IdentityStore>,
    pipeline: EnrollmentPipeline,
    matcher: Box<dyn Matcher>,
}

impl FaceService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn IdentityStore>,
        augment: AugmentConfig,
        enroll: EnrollConfig,
    ) -> Self {
        let pipeline = EnrollmentPipeline::new(
            embedder.clone(),
            store.clone(),
            Augmenter::new(augment),
            enroll,
        );
        Self {
            embedder,
            store,
            pipeline,
            matcher: Box::new(CosineMatcher),
        }
    }

    /// Replace the default cosine matcher.
    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn model_version(&self) -> &str {
        self.embedder.model_version()
    }

    /// Enroll and synthesise on this call. `cancel` belongs to this request.
    pub fn enroll(
        &self,
        image: &ImageInput,
        label: Option<&str>,
        seed: Option<u64>,
        cancel: &CancelFlag,
    ) -> Result<EnrollReport, EnrollError> {
        let image = image.decode().map_err(EmbeddingError::from)?;
        self.pipeline.enroll_image(&image, label, seed, cancel)
    }

    /// Commit the primary embedding only; run [`synthesize`](Self::synthesize) later.
    pub fn begin_enroll(
        &self,
        image: &ImageInput,
        label: Option<&str>,
        seed: Option<u64>,
    ) -> Result<PendingSynthesis, EnrollError> {
        let image = image.decode().map_err(EmbeddingError::from)?;
        self.pipeline.begin(&image, label, seed)
    }

    pub fn synthesize(&self, pending: &PendingSynthesis, cancel: &CancelFlag) -> SynthesisReport {
        self.pipeline.synthesize(pending, cancel)
    }

    pub fn extend(
        &self,
        identity: &IdentityId,
        image: &ImageInput,
        count: usize,
        seed: Option<u64>,
        cancel: &CancelFlag,
    ) -> Result<SynthesisReport, EnrollError> {
        let image = image.decode().map_err(EmbeddingError::from)?;
        self.pipeline.extend(identity, &image, count, seed, cancel)
    }

    /// Embed a probe image and resolve it against a fresh gallery snapshot.
    ///
    /// `Ok` with `matched == false` means the probe was usable but nobody
    /// cleared the threshold; `Err` means the probe itself was unusable.
    pub fn recognize(
        &self,
        image: &ImageInput,
        threshold: f32,
    ) -> Result<Recognition, RecognizeError> {
        let image = image.decode().map_err(EmbeddingError::from)?;
        let extraction = self.embedder.embed(&image)?;
        let gallery = self.store.list_all_embeddings()?;
        let result = self
            .matcher
            .find_best_match(&extraction.embedding, &gallery, threshold)?;

        match &result.identity {
            Some(id) => {
                tracing::info!(identity = %id, similarity = result.similarity, "recognized")
            }
            None => tracing::info!(similarity = result.similarity, "no identity above threshold"),
        }

        Ok(Recognition {
            result,
            quality: extraction.quality,
        })
    }

    pub fn list(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        self.store.list_identities()
    }

    pub fn remove(&self, identity: &IdentityId) -> Result<bool, StoreError> {
        let removed = self.store.remove_identity(identity)?;
        if removed {
            tracing::info!(identity = %identity, "identity removed");
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<ServiceStatus, StoreError> {
        let identities = self.store.list_identities()?.len();
        let gallery = self.store.list_all_embeddings()?;
        let model_version = self.embedder.model_version().to_string();
        let current_model_embeddings = gallery
            .iter()
            .filter(|entry| entry.embedding.model_version() == model_version)
            .count();
        Ok(ServiceStatus {
            model_version,
            identities,
            embeddings: gallery.len(),
            current_model_embeddings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::CenterCropEmbedder;
    use crate::store::MemoryStore;
    use crate::testing::{horizontal_gradient, png, vertical_gradient};
    use crate::types::Embedding;
    use base64::Engine as _;

    fn service(store: Arc<MemoryStore>) -> FaceService {
        FaceService::new(
            Arc::new(CenterCropEmbedder),
            store,
            AugmentConfig::standard(),
            EnrollConfig::default(),
        )
    }

    fn person_x() -> ImageInput {
        ImageInput::Bytes(png(&horizontal_gradient(96, 96)))
    }

    fn stranger() -> ImageInput {
        ImageInput::Bytes(png(&vertical_gradient(96, 96)))
    }

    #[test]
    fn test_enroll_then_recognize_same_person() {
        let svc = service(Arc::new(MemoryStore::new()));
        let report = svc.enroll(&person_x(), Some("x"), Some(7), &CancelFlag::new()).unwrap();

        let recognition = svc.recognize(&person_x(), DEFAULT_THRESHOLD).unwrap();
        assert!(recognition.result.matched);
        assert_eq!(recognition.result.identity, Some(report.identity_id));
        assert!(recognition.result.similarity >= DEFAULT_THRESHOLD);
        assert_eq!(recognition.result.compared, 6);
    }

    #[test]
    fn test_stranger_is_not_matched() {
        let svc = service(Arc::new(MemoryStore::new()));
        svc.enroll(&person_x(), None, Some(7), &CancelFlag::new()).unwrap();

        let recognition = svc.recognize(&stranger(), DEFAULT_THRESHOLD).unwrap();
        assert!(!recognition.result.matched);
        assert!(recognition.result.identity.is_none());
        assert!(recognition.result.similarity < DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let svc = service(Arc::new(MemoryStore::new()));
        let recognition = svc.recognize(&person_x(), DEFAULT_THRESHOLD).unwrap();
        assert!(!recognition.result.matched);
        assert_eq!(recognition.result.compared, 0);
    }

    #[test]
    fn test_unreadable_probe_is_an_error() {
        let svc = service(Arc::new(MemoryStore::new()));
        let err = svc
            .recognize(&ImageInput::Bytes(b"garbage".to_vec()), DEFAULT_THRESHOLD)
            .unwrap_err();
        assert!(matches!(
            err,
            RecognizeError::Embedding(EmbeddingError::UnreadableImage(_))
        ));
    }

    #[test]
    fn test_base64_and_data_url_inputs() {
        let svc = service(Arc::new(MemoryStore::new()));
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(png(&horizontal_gradient(96, 96)));
        let report = svc
            .enroll(&ImageInput::Base64(encoded.clone()), None, Some(1), &CancelFlag::new())
            .unwrap();

        let url = format!("data:image/png;base64,{encoded}");
        let recognition = svc.recognize(&ImageInput::Base64(url), DEFAULT_THRESHOLD).unwrap();
        assert_eq!(recognition.result.identity, Some(report.identity_id));
    }

    #[test]
    fn test_removed_identity_is_no_longer_matched() {
        let svc = service(Arc::new(MemoryStore::new()));
        let report = svc.enroll(&person_x(), None, Some(2), &CancelFlag::new()).unwrap();
        assert!(svc.remove(&report.identity_id).unwrap());
        assert!(!svc.remove(&report.identity_id).unwrap());

        let recognition = svc.recognize(&person_x(), DEFAULT_THRESHOLD).unwrap();
        assert!(!recognition.result.matched);
        assert!(svc.list().unwrap().is_empty());
    }

    #[test]
    fn test_other_model_versions_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let foreign = Embedding::new(vec![1.0; 4096], "some-other-model");
        store.create_identity(&foreign, Some("legacy")).unwrap();
        let svc = service(store);

        let recognition = svc.recognize(&person_x(), -1.0).unwrap();
        assert!(!recognition.result.matched);
        assert_eq!(recognition.result.compared, 0);

        let status = svc.status().unwrap();
        assert_eq!(status.identities, 1);
        assert_eq!(status.embeddings, 1);
        assert_eq!(status.current_model_embeddings, 0);
    }

    #[test]
    fn test_deferred_enrollment() {
        let svc = service(Arc::new(MemoryStore::new()));
        let pending = svc.begin_enroll(&person_x(), None, Some(4)).unwrap();
        assert_eq!(svc.status().unwrap().embeddings, 1);
        assert!(svc.recognize(&person_x(), DEFAULT_THRESHOLD).unwrap().result.matched);

        let report = svc.synthesize(&pending, &CancelFlag::new());
        assert_eq!(report.committed, 5);
        assert_eq!(svc.status().unwrap().embeddings, 6);
    }

    #[test]
    fn test_extend_grows_identity() {
        let svc = service(Arc::new(MemoryStore::new()));
        let report = svc.enroll(&person_x(), None, Some(4), &CancelFlag::new()).unwrap();
        let extended = svc
            .extend(&report.identity_id, &person_x(), 2, Some(99), &CancelFlag::new())
            .unwrap();
        assert_eq!(extended.committed, 2);

        let summary = svc.list().unwrap().remove(0);
        assert_eq!((summary.primary, summary.synthetic), (1, 7));
    }

    #[test]
    fn test_cancelled_request_does_not_poison_the_next() {
        let svc = service(Arc::new(MemoryStore::new()));

        let interrupted = CancelFlag::new();
        interrupted.cancel();
        let first = svc.enroll(&person_x(), None, Some(1), &interrupted).unwrap();
        assert_eq!(first.synthetic_count, 0);

        let second = svc.enroll(&stranger(), None, Some(2), &CancelFlag::new()).unwrap();
        assert_eq!(second.synthetic_count, 5);
        let extended = svc
            .extend(&first.identity_id, &person_x(), 3, Some(3), &CancelFlag::new())
            .unwrap();
        assert_eq!(extended.committed, 3);
        assert_eq!(svc.status().unwrap().embeddings, 1 + 6 + 3);
    }

    #[test]
    fn test_wrong_dimension_entry_does_not_break_recognition() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let stale = Embedding::new(vec![0.5, 0.5, 0.5], svc.model_version());
        store.create_identity(&stale, Some("stale")).unwrap();

        let report = svc.enroll(&person_x(), None, Some(7), &CancelFlag::new()).unwrap();
        let recognition = svc.recognize(&person_x(), DEFAULT_THRESHOLD).unwrap();
        assert!(recognition.result.matched);
        assert_eq!(recognition.result.identity, Some(report.identity_id));
        assert_eq!(recognition.result.compared, 6);
    }
}
