//! SQLite-backed identity store.
//!
//! Vectors are stored as JSON arrays next to the model version and
//! dimension that produced them. Every trait method runs as one statement or
//! one transaction, so readers never observe an identity without its primary
//! embedding.

use facegate_core::store::{validate_embedding, IdentityStore, StoreError, ID_ALLOCATION_ATTEMPTS};
use facegate_core::types::{Embedding, EmbeddingKind, GalleryEntry, IdentityId, IdentitySummary};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    code        TEXT PRIMARY KEY,
    label       TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_code  TEXT NOT NULL REFERENCES identities(code) ON DELETE CASCADE,
    kind           TEXT NOT NULL CHECK (kind IN ('primary', 'synthetic')),
    model_version  TEXT NOT NULL,
    dim            INTEGER NOT NULL,
    vector_json    TEXT NOT NULL,
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_code, id);
";

/// Identity store persisted in a single SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "identity store opened");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", 1).map_err(backend)?;
        conn.execute_batch(SCHEMA_SQL).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection lock poisoned".into()))
    }
}

impl IdentityStore for SqliteStore {
    fn create_identity(
        &self,
        primary: &Embedding,
        label: Option<&str>,
    ) -> Result<IdentityId, StoreError> {
        let vector_json = encode_vector(primary)?;
        let now = now_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;

        let mut allocated = None;
        for attempt in 0..ID_ALLOCATION_ATTEMPTS {
            let code = IdentityId::generate();
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO identities (code, label, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![code.as_str(), label, now],
                )
                .map_err(backend)?;
            if inserted == 1 {
                allocated = Some(code);
                break;
            }
            tracing::debug!(code = %code, attempt, "identity code collision, retrying");
        }
        let code = allocated.ok_or(StoreError::IdExhausted(ID_ALLOCATION_ATTEMPTS))?;

        tx.execute(
            "INSERT INTO embeddings
                 (identity_code, kind, model_version, dim, vector_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                code.as_str(),
                EmbeddingKind::Primary.as_str(),
                primary.model_version(),
                primary.dim() as i64,
                vector_json,
                now
            ],
        )
        .map_err(backend)?;

        tx.commit().map_err(backend)?;
        Ok(code)
    }

    fn append_embedding(
        &self,
        id: &IdentityId,
        embedding: &Embedding,
        kind: EmbeddingKind,
    ) -> Result<(), StoreError> {
        let vector_json = encode_vector(embedding)?;
        let inserted = self
            .conn()?
            .execute(
                "INSERT INTO embeddings
                     (identity_code, kind, model_version, dim, vector_json, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6
                 WHERE EXISTS (SELECT 1 FROM identities WHERE code = ?1)",
                params![
                    id.as_str(),
                    kind.as_str(),
                    embedding.model_version(),
                    embedding.dim() as i64,
                    vector_json,
                    now_rfc3339()
                ],
            )
            .map_err(backend)?;

        if inserted == 0 {
            return Err(StoreError::UnknownIdentity(id.clone()));
        }
        Ok(())
    }

    fn list_all_embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT identity_code, model_version, dim, vector_json
                 FROM embeddings
                 ORDER BY identity_code, id",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(backend)?;

        let mut gallery = Vec::new();
        for row in rows {
            let (code, model_version, dim, vector_json) = row.map_err(backend)?;
            let embedding = Embedding::from_json(&vector_json, model_version)
                .map_err(|e| StoreError::Corrupt(format!("embedding of {code}: {e}")))?;
            if embedding.dim() as i64 != dim {
                return Err(StoreError::Corrupt(format!(
                    "embedding of {code}: recorded dim {dim}, vector has {}",
                    embedding.dim()
                )));
            }
            gallery.push(GalleryEntry {
                identity: IdentityId::from(code),
                embedding,
            });
        }
        Ok(gallery)
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT i.code, i.label, i.created_at,
                        COALESCE(SUM(e.kind = 'primary'), 0),
                        COALESCE(SUM(e.kind = 'synthetic'), 0)
                 FROM identities i
                 LEFT JOIN embeddings e ON e.identity_code = i.code
                 GROUP BY i.code
                 ORDER BY i.code",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(IdentitySummary {
                    id: IdentityId::from(row.get::<_, String>(0)?),
                    label: row.get(1)?,
                    created_at: row.get(2)?,
                    primary: row.get::<_, i64>(3)?.max(0) as usize,
                    synthetic: row.get::<_, i64>(4)?.max(0) as usize,
                })
            })
            .map_err(backend)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    fn remove_identity(&self, id: &IdentityId) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        tx.execute(
            "DELETE FROM embeddings WHERE identity_code = ?1",
            params![id.as_str()],
        )
        .map_err(backend)?;
        let removed = tx
            .execute("DELETE FROM identities WHERE code = ?1", params![id.as_str()])
            .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(removed > 0)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// JSON has no NaN or infinity, so such vectors are refused before writing.
fn encode_vector(embedding: &Embedding) -> Result<String, StoreError> {
    validate_embedding(embedding)?;
    embedding
        .to_json()
        .map_err(|e| StoreError::Corrupt(format!("vector not serializable: {e}")))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
