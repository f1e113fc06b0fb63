//! Identity store interface and an in-memory implementation.
//!
//! Each method is one commit: a concurrent reader sees an identity either
//! with its primary embedding or not at all, and appended embeddings appear
//! one at a time.

use crate::types::{Embedding, EmbeddingKind, GalleryEntry, IdentityId, IdentitySummary};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
    #[error("could not allocate a free identity code after {0} attempts")]
    IdExhausted(usize),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
}

/// Refuse vectors that could never be read back or compared: empty ones and
/// ones holding NaN or infinity.
pub fn validate_embedding(embedding: &Embedding) -> Result<(), StoreError> {
    if embedding.values().is_empty() {
        return Err(StoreError::InvalidEmbedding("empty vector".into()));
    }
    if let Some(idx) = embedding.first_non_finite() {
        return Err(StoreError::InvalidEmbedding(format!(
            "non-finite value at index {idx}"
        )));
    }
    Ok(())
}

/// Persistence for identities and their embedding sets.
pub trait IdentityStore: Send + Sync {
    /// Create an identity holding `primary` as its first embedding.
    fn create_identity(
        &self,
        primary: &Embedding,
        label: Option<&str>,
    ) -> Result<IdentityId, StoreError>;

    /// Append one embedding to an existing identity.
    fn append_embedding(
        &self,
        id: &IdentityId,
        embedding: &Embedding,
        kind: EmbeddingKind,
    ) -> Result<(), StoreError>;

    /// Gallery snapshot, ordered by identity code then insertion order.
    fn list_all_embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError>;

    /// Remove an identity and all of its embeddings. Returns false if absent.
    fn remove_identity(&self, id: &IdentityId) -> Result<bool, StoreError>;
}

/// Attempts at drawing an unused identity code before giving up.
pub const ID_ALLOCATION_ATTEMPTS: usize = 16;

#[derive(Debug)]
struct MemoryIdentity {
    label: Option<String>,
    embeddings: Vec<(EmbeddingKind, Embedding)>,
}

type Identities = BTreeMap<IdentityId, MemoryIdentity>;

/// Identity store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: RwLock<Identities>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embeddings of one identity in insertion order.
    pub fn embeddings_of(
        &self,
        id: &IdentityId,
    ) -> Result<Vec<(EmbeddingKind, Embedding)>, StoreError> {
        let map = self.read()?;
        map.get(id)
            .map(|identity| identity.embeddings.clone())
            .ok_or_else(|| StoreError::UnknownIdentity(id.clone()))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Identities>, StoreError> {
        self.identities
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Identities>, StoreError> {
        self.identities
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl IdentityStore for MemoryStore {
    fn create_identity(
        &self,
        primary: &Embedding,
        label: Option<&str>,
    ) -> Result<IdentityId, StoreError> {
        validate_embedding(primary)?;
        let mut map = self.write()?;
        let id = (0..ID_ALLOCATION_ATTEMPTS)
            .map(|_| IdentityId::generate())
            .find(|id| !map.contains_key(id))
            .ok_or(StoreError::IdExhausted(ID_ALLOCATION_ATTEMPTS))?;

        map.insert(
            id.clone(),
            MemoryIdentity {
                label: label.map(str::to_string),
                embeddings: vec![(EmbeddingKind::Primary, primary.clone())],
            },
        );
        Ok(id)
    }

    fn append_embedding(
        &self,
        id: &IdentityId,
        embedding: &Embedding,
        kind: EmbeddingKind,
    ) -> Result<(), StoreError> {
        validate_embedding(embedding)?;
        let mut map = self.write()?;
        let identity = map
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownIdentity(id.clone()))?;
        identity.embeddings.push((kind, embedding.clone()));
        Ok(())
    }

    fn list_all_embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let map = self.read()?;
        Ok(map
            .iter()
            .flat_map(|(id, identity)| {
                identity.embeddings.iter().map(move |(_, embedding)| GalleryEntry {
                    identity: id.clone(),
                    embedding: embedding.clone(),
                })
            })
            .collect())
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let map = self.read()?;
        Ok(map
            .iter()
            .map(|(id, identity)| {
                let primary = identity
                    .embeddings
                    .iter()
                    .filter(|(kind, _)| *kind == EmbeddingKind::Primary)
                    .count();
                IdentitySummary {
                    id: id.clone(),
                    label: identity.label.clone(),
                    primary,
                    synthetic: identity.embeddings.len() - primary,
                    created_at: None,
                }
            })
            .collect())
    }

    fn remove_identity(&self, id: &IdentityId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove(id).is_some())
    }
}
