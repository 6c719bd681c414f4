use crate::domain::blob::BlobRow;
use crate::domain::{Algorithm, BlobInfo, Digest, DigestHasher};
use crate::error::{AppError, Result};
use crate::storage::ContentStore;
use crate::storage::paths::PathManager;
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs::{self, File, create_dir_all, remove_dir_all, remove_file, rename};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Blob bytes on the local filesystem, blob metadata in the registry
/// database. The database row is written last, so a digest is only ever
/// visible once its bytes are durable.
pub struct FilesystemContentStore {
    paths: PathManager,
    pool: SqlitePool,
}

impl FilesystemContentStore {
    pub fn new(paths: PathManager, pool: SqlitePool) -> Self {
        FilesystemContentStore { paths, pool }
    }

    /// Moves `staged` into place and records the blob in one write
    /// transaction. The insert takes SQLite's write lock before the rename,
    /// and `delete` removes files before it commits, so the two never
    /// interleave into a row without data.
    async fn commit(&self, digest: &Digest, staged: &Path, size: u64, media_type: Option<&str>) -> Result<()> {
        let size = i64::try_from(size).map_err(|e| AppError::SizeInvalid(e.to_string()))?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO blobs (digest, algorithm, size, media_type, created_at) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (digest) DO NOTHING",
        )
        .bind(digest.to_string())
        .bind(digest.algorithm().as_str())
        .bind(size)
        .bind(media_type)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Same digest means same bytes; the row stays, a media type may be added.
        if inserted == 0 {
            if let Some(media_type) = media_type {
                sqlx::query("UPDATE blobs SET media_type = $1 WHERE digest = $2 AND media_type IS NULL")
                    .bind(media_type)
                    .bind(digest.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let target = self.paths.blob_data_path(digest);
        if let Some(parent) = target.parent() {
            create_dir_all(parent).await?;
        }
        rename(staged, &target).await?;
        tx.commit().await?;
        Ok(())
    }

    fn mismatch(claimed: &Digest, computed: &Digest) -> AppError {
        AppError::DigestMismatch {
            claimed: claimed.to_string(),
            computed: computed.to_string(),
        }
    }
}

async fn hash_file(algorithm: Algorithm, path: &Path) -> Result<Digest> {
    let mut file = File::open(path).await?;
    let mut hasher = DigestHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize(algorithm))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!("failed to remove staged file {}: {e}", path.display());
        }
    }
}

#[async_trait::async_trait]
impl ContentStore for FilesystemContentStore {
    async fn verify_and_put(
        &self,
        claimed: &Digest,
        bytes: Bytes,
        media_type: Option<&str>,
    ) -> Result<Digest> {
        let computed = Digest::compute(claimed.algorithm(), &bytes);
        if computed != *claimed {
            return Err(Self::mismatch(claimed, &computed));
        }

        let staged = self.paths.staging_path();
        if let Some(parent) = staged.parent() {
            create_dir_all(parent).await?;
        }
        let stored = match write_synced(&staged, &bytes).await {
            Ok(()) => self.commit(claimed, &staged, bytes.len() as u64, media_type).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            remove_quietly(&staged).await;
            return Err(e);
        }
        tracing::debug!(digest = %claimed, size = bytes.len(), "stored content");
        Ok(computed)
    }

    async fn verify_and_put_file(&self, claimed: &Digest, staged: &Path) -> Result<Digest> {
        let computed = hash_file(claimed.algorithm(), staged).await?;
        if computed != *claimed {
            remove_quietly(staged).await;
            return Err(Self::mismatch(claimed, &computed));
        }

        let file = File::open(staged).await?;
        file.sync_all().await?;
        let size = file.metadata().await?.len();
        drop(file);

        self.commit(claimed, staged, size, None).await?;
        tracing::debug!(digest = %claimed, size, "stored uploaded content");
        Ok(computed)
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        if self.stat(digest).await?.is_none() {
            return Err(AppError::BlobUnknown(digest.to_string()));
        }
        let bytes = fs::read(self.paths.blob_data_path(digest)).await?;
        Ok(Bytes::from(bytes))
    }

    async fn open(&self, digest: &Digest) -> Result<(File, BlobInfo)> {
        let info = self
            .stat(digest)
            .await?
            .ok_or_else(|| AppError::BlobUnknown(digest.to_string()))?;
        let file = File::open(self.paths.blob_data_path(digest)).await?;
        Ok((file, info))
    }

    async fn stat(&self, digest: &Digest) -> Result<Option<BlobInfo>> {
        sqlx::query_as::<_, BlobRow>(
            "SELECT digest, size, media_type, created_at FROM blobs WHERE digest = $1",
        )
        .bind(digest.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(BlobInfo::try_from)
        .transpose()
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let untagged = sqlx::query("DELETE FROM manifest_tags WHERE digest = $1")
            .bind(digest.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let removed = sqlx::query("DELETE FROM blobs WHERE digest = $1")
            .bind(digest.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(AppError::BlobUnknown(digest.to_string()));
        }
        // Files go while the write lock is still held; see `commit`.
        if let Err(e) = remove_dir_all(self.paths.blob_path(digest)).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        tx.commit().await?;
        tracing::info!(%digest, untagged, "deleted content");
        Ok(())
    }
}
