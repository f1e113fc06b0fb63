use crate::config::Config;
use facegate_core::enroll::{EnrollmentState, SynthesisReport};
use facegate_core::{
    AugmentConfig, CancelFlag, EnrollConfig, EnrollError, EnrollReport, FaceService, IdentityId,
    IdentitySummary, ImageInput, LazyEmbedder, RecognizeError, Recognition, ServiceStatus,
    StoreError,
};
use facegate_store::SqliteStore;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Recognize(#[from] RecognizeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine did not answer within {0}s")]
    Timeout(u64),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Engine status as reported to callers.
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub embedder: String,
    pub models_loaded: bool,
    pub deferred_synthesis: bool,
    #[serde(flatten)]
    pub service: ServiceStatus,
}

/// Messages sent from the command surface to the engine thread.
enum EngineRequest {
    Enroll {
        image: ImageInput,
        label: Option<String>,
        seed: Option<u64>,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<EnrollReport, EngineError>>,
    },
    Recognize {
        image: ImageInput,
        threshold: f32,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    Extend {
        identity: IdentityId,
        image: ImageInput,
        count: usize,
        seed: Option<u64>,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<SynthesisReport, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<IdentitySummary>, EngineError>>,
    },
    Remove {
        identity: IdentityId,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
    /// Answered once every earlier request, deferred synthesis included, has finished.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cancel flags of enroll and extend requests that have not finished.
///
/// Each request gets its own flag, so cancelling one never affects a
/// request issued afterwards.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<Vec<CancelFlag>>>);

impl InFlight {
    fn register(&self) -> CancelFlag {
        let flag = CancelFlag::new();
        self.lock().push(flag.clone());
        flag
    }

    fn release(&self, flag: &CancelFlag) {
        self.lock().retain(|f| !f.same_as(flag));
    }

    fn cancel_all(&self) -> usize {
        let flags = self.lock();
        for flag in flags.iter() {
            flag.cancel();
        }
        flags.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CancelFlag>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    in_flight: InFlight,
    timeout: Duration,
}

impl EngineHandle {
    /// Enroll a new identity from one photo.
    pub async fn enroll(
        &self,
        image: ImageInput,
        label: Option<String>,
        seed: Option<u64>,
    ) -> Result<EnrollReport, EngineError> {
        let cancel = self.in_flight.register();
        let result = self
            .call(|reply| EngineRequest::Enroll {
                image,
                label,
                seed,
                cancel: cancel.clone(),
                reply,
            })
            .await;
        self.settle(&cancel, result)
    }

    /// Match a probe photo against the gallery.
    pub async fn recognize(
        &self,
        image: ImageInput,
        threshold: f32,
    ) -> Result<Recognition, EngineError> {
        self.call(|reply| EngineRequest::Recognize {
            image,
            threshold,
            reply,
        })
        .await?
    }

    pub async fn extend(
        &self,
        identity: IdentityId,
        image: ImageInput,
        count: usize,
        seed: Option<u64>,
    ) -> Result<SynthesisReport, EngineError> {
        let cancel = self.in_flight.register();
        let result = self
            .call(|reply| EngineRequest::Extend {
                identity,
                image,
                count,
                seed,
                cancel: cancel.clone(),
                reply,
            })
            .await;
        self.settle(&cancel, result)
    }

    pub async fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await?
    }

    pub async fn remove(&self, identity: IdentityId) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Remove { identity, reply })
            .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await?
    }

    /// Stop issuing synthetic sub-steps for every enroll or extend request
    /// already submitted. Later requests are unaffected.
    pub fn cancel_synthesis(&self) {
        let cancelled = self.in_flight.cancel_all();
        tracing::debug!(requests = cancelled, "synthesis cancelled");
    }

    /// Wait for queued work to drain. Not subject to the request timeout.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// The engine releases a request's flag once it is done with it; a
    /// request it never received is released here.
    fn settle<T>(
        &self,
        cancel: &CancelFlag,
        result: Result<Result<T, EngineError>, EngineError>,
    ) -> Result<T, EngineError> {
        if matches!(result, Err(EngineError::ChannelClosed)) {
            self.in_flight.release(cancel);
        }
        result?
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed),
            Err(_) => Err(EngineError::Timeout(self.timeout.as_secs())),
        }
    }
}

/// State owned by the engine thread.
struct Engine {
    service: FaceService,
    embedder: Arc<LazyEmbedder>,
    defer_synthesis: bool,
    in_flight: InFlight,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the identity store synchronously so a bad database path fails fast.
/// Models are loaded on the first request that needs an embedding.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let store = SqliteStore::open(&config.db_path)?;

    let embedder = Arc::new(LazyEmbedder::new(config.embedder, config.model_dir.clone()));
    tracing::info!(
        embedder = %config.embedder,
        model_dir = %config.model_dir.display(),
        "embedder configured"
    );

    let service = FaceService::new(
        embedder.clone(),
        Arc::new(store),
        AugmentConfig::from(config.augment_profile),
        EnrollConfig {
            synthetic_samples: config.synthetic_samples,
            workers: config.synthesis_workers,
            reject_degraded: config.reject_degraded,
        },
    );

    let in_flight = InFlight::default();
    let engine = Engine {
        service,
        embedder,
        defer_synthesis: config.defer_synthesis,
        in_flight: in_flight.clone(),
    };

    let (tx, rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || engine.run(rx))?;

    Ok(EngineHandle {
        tx,
        in_flight,
        timeout: Duration::from_secs(config.request_timeout_secs),
    })
}

impl Engine {
    fn run(self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!("engine thread started");
        while let Some(req) = rx.blocking_recv() {
            match req {
                EngineRequest::Enroll {
                    image,
                    label,
                    seed,
                    cancel,
                    reply,
                } => {
                    self.handle_enroll(&image, label.as_deref(), seed, &cancel, reply);
                    self.in_flight.release(&cancel);
                }
                EngineRequest::Recognize {
                    image,
                    threshold,
                    reply,
                } => {
                    let result = self.service.recognize(&image, threshold);
                    let _ = reply.send(result.map_err(Into::into));
                }
                EngineRequest::Extend {
                    identity,
                    image,
                    count,
                    seed,
                    cancel,
                    reply,
                } => {
                    let result = self.service.extend(&identity, &image, count, seed, &cancel);
                    self.in_flight.release(&cancel);
                    let _ = reply.send(result.map_err(Into::into));
                }
                EngineRequest::List { reply } => {
                    let _ = reply.send(self.service.list().map_err(Into::into));
                }
                EngineRequest::Remove { identity, reply } => {
                    let _ = reply.send(self.service.remove(&identity).map_err(Into::into));
                }
                EngineRequest::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                EngineRequest::Shutdown { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        tracing::info!("engine thread exiting");
    }

    /// With deferred synthesis the caller is answered right after the
    /// primary commit and the synthetic samples are generated before the
    /// next request is read.
    fn handle_enroll(
        &self,
        image: &ImageInput,
        label: Option<&str>,
        seed: Option<u64>,
        cancel: &CancelFlag,
        reply: oneshot::Sender<Result<EnrollReport, EngineError>>,
    ) {
        if !self.defer_synthesis {
            let result = self.service.enroll(image, label, seed, cancel);
            let _ = reply.send(result.map_err(Into::into));
            return;
        }

        let pending = match self.service.begin_enroll(image, label, seed) {
            Ok(pending) => pending,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let _ = reply.send(Ok(EnrollReport {
            identity_id: pending.identity.clone(),
            primary_embedding_ok: true,
            synthetic_count: 0,
            synthetic_attempted: 0,
            quality: pending.quality,
            state: EnrollmentState::Synthesizing,
        }));

        let report = self.service.synthesize(&pending, cancel);
        tracing::info!(
            identity = %pending.identity,
            synthetic = report.committed,
            attempted = report.attempted,
            cancelled = report.cancelled,
            "deferred synthesis finished"
        );
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            embedder: self.embedder.kind().to_string(),
            models_loaded: self.embedder.is_loaded(),
            deferred_synthesis: self.defer_synthesis,
            service: self.service.status()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{AugmentProfile, EmbedderKind, FaceImage};

    fn config(dir: &tempfile::TempDir, defer_synthesis: bool) -> Config {
        Config {
            embedder: EmbedderKind::CenterCrop,
            model_dir: dir.path().join("models"),
            db_path: dir.path().join("identities.db"),
            similarity_threshold: 0.5,
            synthetic_samples: 4,
            augment_profile: AugmentProfile::Standard,
            synthesis_workers: 2,
            defer_synthesis,
            reject_degraded: false,
            request_timeout_secs: 30,
        }
    }

    fn gradient_png(horizontal: bool) -> ImageInput {
        let size = 64u32;
        let data = (0..size)
            .flat_map(|y| (0..size).map(move |x| ((if horizontal { x } else { y }) * 4) as u8))
            .collect();
        let image = FaceImage::new(data, size, size).unwrap();
        ImageInput::Bytes(image.encode_png().unwrap())
    }

    #[tokio::test]
    async fn test_enroll_recognize_remove() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&config(&dir, false)).unwrap();

        let report = engine
            .enroll(gradient_png(true), Some("x".into()), Some(11))
            .await
            .unwrap();
        assert_eq!(report.synthetic_count, 4);
        assert_eq!(report.state, EnrollmentState::Complete);

        let hit = engine.recognize(gradient_png(true), 0.5).await.unwrap();
        assert_eq!(hit.result.identity.as_ref(), Some(&report.identity_id));

        let miss = engine.recognize(gradient_png(false), 0.5).await.unwrap();
        assert!(!miss.result.matched);

        let listed = engine.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label.as_deref(), Some("x"));

        assert!(engine.remove(report.identity_id.clone()).await.unwrap());
        assert!(engine.list().await.unwrap().is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_synthesis_completes_before_next_request() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&config(&dir, true)).unwrap();

        let report = engine.enroll(gradient_png(true), None, Some(5)).await.unwrap();
        assert_eq!(report.state, EnrollmentState::Synthesizing);
        assert_eq!(report.synthetic_count, 0);

        let status = engine.status().await.unwrap();
        assert_eq!(status.service.identities, 1);
        assert_eq!(status.service.embeddings, 5);
        assert!(status.deferred_synthesis);
        assert_eq!(status.embedder, "center-crop");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&config(&dir, false)).unwrap();

        let err = engine
            .recognize(ImageInput::Bytes(b"nope".to_vec()), 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Recognize(_)));

        let err = engine
            .extend(IdentityId::from("000000"), gradient_png(true), 2, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enroll(EnrollError::Store(StoreError::UnknownIdentity(_)))
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&config(&dir, false)).unwrap();
        engine.shutdown().await.unwrap();

        // The receiver is dropped once the thread leaves its loop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(engine.list().await, Err(EngineError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_cancel_applies_only_to_submitted_requests() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&config(&dir, true)).unwrap();

        // Nothing is in flight, so there is nothing to cancel.
        engine.cancel_synthesis();

        engine.enroll(gradient_png(true), None, Some(1)).await.unwrap();
        engine.enroll(gradient_png(false), None, Some(2)).await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.service.identities, 2);
        assert_eq!(status.service.embeddings, 10);
        assert_eq!(engine.in_flight.len(), 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_synchronous_enroll_after_cancel_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&config(&dir, false)).unwrap();
        engine.cancel_synthesis();

        let report = engine.enroll(gradient_png(true), None, Some(3)).await.unwrap();
        assert_eq!(report.synthetic_count, 4);

        let extended = engine
            .extend(report.identity_id.clone(), gradient_png(true), 2, Some(4))
            .await
            .unwrap();
        assert_eq!(extended.committed, 2);
        assert!(!extended.cancelled);
        assert_eq!(engine.in_flight.len(), 0);
        engine.shutdown().await.unwrap();
    }

    #[test]
    fn test_in_flight_cancels_registered_flags_only() {
        let in_flight = InFlight::default();
        let running = in_flight.register();
        let finished = in_flight.register();
        in_flight.release(&finished);

        assert_eq!(in_flight.cancel_all(), 1);
        assert!(running.is_cancelled());
        assert!(!finished.is_cancelled());

        let later = in_flight.register();
        assert!(!later.is_cancelled());
        in_flight.release(&running);
        in_flight.release(&later);
        assert_eq!(in_flight.len(), 0);
    }
}
