use crate::domain::{BlobInfo, Digest, Resolved, Tag, TagPage};
use crate::error::Result;
use crate::utils::repo_identifier::RepoIdentifier;
use bytes::Bytes;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;

pub mod content;
pub mod paths;
pub mod tag_index;

pub use content::FilesystemContentStore;
pub use paths::PathManager;
pub use tag_index::SqliteTagIndex;

/// Content-addressed bytes. Every successful write is durable before the call
/// returns, and the stored bytes always hash to their key.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    /// Stores `bytes` under the digest computed for `claimed.algorithm()`,
    /// failing with `DigestMismatch` if it differs from `claimed`.
    async fn verify_and_put(
        &self,
        claimed: &Digest,
        bytes: Bytes,
        media_type: Option<&str>,
    ) -> Result<Digest>;

    /// Same contract as [`ContentStore::verify_and_put`] for content already
    /// staged in a file. The file is consumed on success and removed on
    /// mismatch.
    async fn verify_and_put_file(&self, claimed: &Digest, staged: &Path) -> Result<Digest>;

    async fn get(&self, digest: &Digest) -> Result<Bytes>;

    async fn open(&self, digest: &Digest) -> Result<(File, BlobInfo)>;

    async fn stat(&self, digest: &Digest) -> Result<Option<BlobInfo>>;

    /// Removes the content together with every tag that points at it.
    async fn delete(&self, digest: &Digest) -> Result<()>;

    async fn put(&self, bytes: Bytes, media_type: Option<&str>) -> Result<Digest> {
        let digest = Digest::sha256(&bytes);
        self.verify_and_put(&digest, bytes, media_type).await
    }
}

/// Mutable (namespace, name, tag) -> digest pointers.
#[async_trait::async_trait]
pub trait TagIndex: Send + Sync {
    /// Resolves a tag or digest reference. Digest references are looked up in
    /// the content store directly and ignore repository ownership.
    async fn resolve(&self, repo: &RepoIdentifier, reference: &str) -> Result<Resolved>;

    /// Creates or moves a tag. Fails with `InvalidReference` when the digest is
    /// not stored.
    async fn upsert(
        &self,
        repo: &RepoIdentifier,
        tag: &str,
        digest: &Digest,
        content_type: &str,
    ) -> Result<Tag>;

    /// Keyset-paginated listing in ascending case-folded order. `limit == 0`
    /// means the internal maximum.
    async fn list_tags(
        &self,
        repo: &RepoIdentifier,
        limit: usize,
        after: Option<&str>,
    ) -> Result<TagPage>;

    /// Removes the tag row only; the target content is left in place.
    async fn delete_tag(&self, repo: &RepoIdentifier, tag: &str) -> Result<()>;
}

/// Opens (creating if needed) the registry database and applies pending
/// migrations.
pub async fn connect(database_file: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(database_file)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(12)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("database schema is up to date");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub dir: TempDir,
        pub pool: SqlitePool,
        pub content: Arc<FilesystemContentStore>,
    }

    pub(crate) async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect(&dir.path().join("registry.db")).await.unwrap();
        let content = Arc::new(FilesystemContentStore::new(
            PathManager::new(dir.path().join("root")),
            pool.clone(),
        ));
        Fixture { dir, pool, content }
    }
}
