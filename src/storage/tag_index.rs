use crate::domain::tag::sort_key;
use crate::domain::{Digest, Resolved, Tag, TagPage};
use crate::error::{AppError, Result};
use crate::storage::{ContentStore, TagIndex};
use crate::utils::repo_identifier::RepoIdentifier;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(FromRow)]
struct ResolvedRow {
    digest: String,
    content_type: String,
    size: i64,
}

pub struct SqliteTagIndex {
    pool: SqlitePool,
    content: Arc<dyn ContentStore>,
    max_page: usize,
}

impl SqliteTagIndex {
    pub fn new(pool: SqlitePool, content: Arc<dyn ContentStore>, max_page: usize) -> Self {
        SqliteTagIndex {
            pool,
            content,
            max_page: max_page.max(1),
        }
    }

    async fn repository_exists(&self, repo: &RepoIdentifier) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM manifest_tags WHERE namespace = $1 AND name = $2)",
        )
        .bind(repo.namespace_key())
        .bind(&repo.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait::async_trait]
impl TagIndex for SqliteTagIndex {
    async fn resolve(&self, repo: &RepoIdentifier, reference: &str) -> Result<Resolved> {
        if Digest::is_digest_syntax(reference) {
            let digest: Digest = reference.parse()?;
            let info = self
                .content
                .stat(&digest)
                .await?
                .ok_or_else(|| AppError::ManifestUnknown(reference.to_string()))?;
            return Ok(Resolved {
                digest: info.digest,
                content_type: info
                    .media_type
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                size: info.size,
            });
        }

        let row = sqlx::query_as::<_, ResolvedRow>(
            "SELECT t.digest, t.content_type, b.size
               FROM manifest_tags t
               JOIN blobs b ON b.digest = t.digest
              WHERE t.namespace = $1 AND t.name = $2 AND t.tag = $3",
        )
        .bind(repo.namespace_key())
        .bind(&repo.name)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::ManifestUnknown(reference.to_string()))?;

        Ok(Resolved {
            digest: row.digest.parse().map_err(AppError::corrupt_row)?,
            content_type: row.content_type,
            size: u64::try_from(row.size).map_err(AppError::corrupt_row)?,
        })
    }

    async fn upsert(
        &self,
        repo: &RepoIdentifier,
        tag: &str,
        digest: &Digest,
        content_type: &str,
    ) -> Result<Tag> {
        let row = Tag::new(repo, tag, digest, content_type);
        // One statement, so the existence check and the write share an
        // implicit transaction. A different tag with the same sort key trips
        // the second unique constraint and comes back as `Duplicate`.
        let stored = sqlx::query_as::<_, Tag>(
            "INSERT INTO manifest_tags (namespace, name, tag, sort_tag, digest, content_type, updated_at)
             SELECT $1, $2, $3, $4, $5, $6, $7
              WHERE EXISTS (SELECT 1 FROM blobs WHERE digest = $5)
             ON CONFLICT (namespace, name, tag) DO UPDATE SET
                    sort_tag = excluded.sort_tag,
                    digest = excluded.digest,
                    content_type = excluded.content_type,
                    updated_at = excluded.updated_at
             RETURNING id, namespace, name, tag, sort_tag, digest, content_type, updated_at",
        )
        .bind(&row.namespace)
        .bind(&row.name)
        .bind(&row.tag)
        .bind(row.sort_tag())
        .bind(&row.digest)
        .bind(&row.content_type)
        .bind(row.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db(e, format!("tag {}:{}", repo, tag)))?
        .ok_or_else(|| AppError::InvalidReference(digest.to_string()))?;

        tracing::info!(repository = %repo, tag, %digest, "tag updated");
        Ok(stored)
    }

    async fn list_tags(
        &self,
        repo: &RepoIdentifier,
        limit: usize,
        after: Option<&str>,
    ) -> Result<TagPage> {
        let page_size = if limit == 0 {
            self.max_page
        } else {
            limit.min(self.max_page)
        };
        // One extra row tells us whether another page follows.
        let fetch = i64::try_from(page_size + 1).unwrap_or(i64::MAX);

        let mut tags: Vec<String> = match after {
            Some(after) => {
                sqlx::query_scalar(
                    "SELECT tag FROM manifest_tags
                      WHERE namespace = $1 AND name = $2 AND sort_tag > $3
                      ORDER BY sort_tag
                      LIMIT $4",
                )
                .bind(repo.namespace_key())
                .bind(&repo.name)
                .bind(sort_key(after))
                .bind(fetch)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT tag FROM manifest_tags
                      WHERE namespace = $1 AND name = $2
                      ORDER BY sort_tag
                      LIMIT $3",
                )
                .bind(repo.namespace_key())
                .bind(&repo.name)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await?
            }
        };

        if tags.is_empty() && !self.repository_exists(repo).await? {
            return Err(AppError::NameUnknown(repo.full_name()));
        }

        let has_more = tags.len() > page_size;
        tags.truncate(page_size);
        Ok(TagPage { tags, has_more })
    }

    async fn delete_tag(&self, repo: &RepoIdentifier, tag: &str) -> Result<()> {
        let removed = sqlx::query(
            "DELETE FROM manifest_tags WHERE namespace = $1 AND name = $2 AND tag = $3",
        )
        .bind(repo.namespace_key())
        .bind(&repo.name)
        .bind(tag)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(AppError::ManifestUnknown(tag.to_string()));
        }
        tracing::info!(repository = %repo, tag, "tag deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{Fixture, fixture};
    use bytes::Bytes;

    async fn index(fx: &Fixture, max_page: usize) -> SqliteTagIndex {
        SqliteTagIndex::new(fx.pool.clone(), fx.content.clone(), max_page)
    }

    async fn manifest(fx: &Fixture, body: &'static [u8]) -> Digest {
        fx.content
            .put(Bytes::from_static(body), Some("application/vnd.oci.image.manifest.v1+json"))
            .await
            .unwrap()
    }

    async fn row_count(fx: &Fixture) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM manifest_tags")
            .fetch_one(&fx.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_then_resolve() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(Some("library"), "app");
        let digest = manifest(&fx, b"{\"schemaVersion\":2}").await;

        let tag = tags.upsert(&repo, "v1", &digest, "application/vnd.oci.image.manifest.v1+json").await.unwrap();
        assert_eq!(tag.namespace, "library");
        assert_eq!(tag.sort_tag(), "v1");

        let resolved = tags.resolve(&repo, "v1").await.unwrap();
        assert_eq!(resolved.digest, digest);
        assert_eq!(resolved.content_type, "application/vnd.oci.image.manifest.v1+json");
        assert_eq!(resolved.size, 19);
    }

    #[tokio::test]
    async fn test_resolve_by_digest_ignores_repository() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let digest = manifest(&fx, b"{}").await;

        let elsewhere = RepoIdentifier::new(None, "unrelated");
        let resolved = tags.resolve(&elsewhere, &digest.to_string()).await.unwrap();
        assert_eq!(resolved.digest, digest);

        let missing = Digest::sha256(b"missing").to_string();
        assert!(matches!(tags.resolve(&elsewhere, &missing).await, Err(AppError::ManifestUnknown(_))));
        assert!(matches!(tags.resolve(&elsewhere, "md5:abcd").await, Err(AppError::DigestInvalid(_))));
    }

    #[tokio::test]
    async fn test_namespace_is_part_of_the_key() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let digest = manifest(&fx, b"{}").await;

        tags.upsert(&RepoIdentifier::new(Some("team"), "app"), "latest", &digest, "a/b").await.unwrap();
        let bare = RepoIdentifier::new(None, "app");
        assert!(matches!(tags.resolve(&bare, "latest").await, Err(AppError::ManifestUnknown(_))));
        assert!(matches!(tags.list_tags(&bare, 0, None).await, Err(AppError::NameUnknown(_))));
    }

    #[tokio::test]
    async fn test_upsert_requires_stored_digest() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let err = tags
            .upsert(&repo, "v1", &Digest::sha256(b"never stored"), "a/b")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidReference(_)));
        assert_eq!(row_count(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_upsert_moves_tag_in_place() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let d1 = manifest(&fx, b"{\"v\":1}").await;
        let d2 = manifest(&fx, b"{\"v\":2}").await;

        let first = tags.upsert(&repo, "latest", &d1, "a/b").await.unwrap();
        let second = tags.upsert(&repo, "latest", &d2, "a/b").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(row_count(&fx).await, 1);
        assert_eq!(tags.resolve(&repo, "latest").await.unwrap().digest, d2);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_leave_one_row() {
        let fx = fixture().await;
        let tags = Arc::new(index(&fx, 100).await);
        let repo = RepoIdentifier::new(None, "app");
        let d1 = manifest(&fx, b"{\"v\":1}").await;
        let d2 = manifest(&fx, b"{\"v\":2}").await;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tags = tags.clone();
                let repo = repo.clone();
                let digest = if i % 2 == 0 { d1.clone() } else { d2.clone() };
                tokio::spawn(async move { tags.upsert(&repo, "latest", &digest, "a/b").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        tags.upsert(&repo, "latest", &d2, "a/b").await.unwrap();

        assert_eq!(row_count(&fx).await, 1);
        assert_eq!(tags.resolve(&repo, "latest").await.unwrap().digest, d2);
    }

    #[tokio::test]
    async fn test_list_tags_pagination() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let digest = manifest(&fx, b"{}").await;
        for tag in ["c", "a", "b"] {
            tags.upsert(&repo, tag, &digest, "a/b").await.unwrap();
        }

        let first = tags.list_tags(&repo, 2, None).await.unwrap();
        assert_eq!(first.tags, vec!["a", "b"]);
        assert!(first.has_more);

        let second = tags.list_tags(&repo, 2, Some("b")).await.unwrap();
        assert_eq!(second.tags, vec!["c"]);
        assert!(!second.has_more);

        let past_end = tags.list_tags(&repo, 2, Some("c")).await.unwrap();
        assert!(past_end.tags.is_empty());
        assert!(!past_end.has_more);
    }

    #[tokio::test]
    async fn test_list_tags_orders_case_folded() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let digest = manifest(&fx, b"{}").await;
        for tag in ["beta", "Alpha", "gamma", "Delta"] {
            tags.upsert(&repo, tag, &digest, "a/b").await.unwrap();
        }

        let page = tags.list_tags(&repo, 0, None).await.unwrap();
        assert_eq!(page.tags, vec!["Alpha", "beta", "Delta", "gamma"]);

        let after = tags.list_tags(&repo, 0, Some("BETA")).await.unwrap();
        assert_eq!(after.tags, vec!["Delta", "gamma"]);
    }

    #[tokio::test]
    async fn test_tags_differing_only_by_case_conflict() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let d1 = manifest(&fx, b"{\"v\":1}").await;
        let d2 = manifest(&fx, b"{\"v\":2}").await;

        tags.upsert(&repo, "latest", &d1, "a/b").await.unwrap();
        let err = tags.upsert(&repo, "Latest", &d2, "a/b").await.unwrap_err();
        assert!(matches!(err, AppError::Duplicate(_)));
        assert_eq!(row_count(&fx).await, 1);

        // Lookups stay exact; only the original spelling resolves.
        assert_eq!(tags.resolve(&repo, "latest").await.unwrap().digest, d1);
        assert!(matches!(tags.resolve(&repo, "Latest").await, Err(AppError::ManifestUnknown(_))));

        let after = tags.list_tags(&repo, 0, Some("Latest")).await.unwrap();
        assert!(after.tags.is_empty());

        // The same fold key is free in another repository.
        let other = RepoIdentifier::new(None, "other");
        tags.upsert(&other, "Latest", &d2, "a/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_tags_cursor_survives_inserts() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let digest = manifest(&fx, b"{}").await;
        for tag in ["a", "c", "e"] {
            tags.upsert(&repo, tag, &digest, "a/b").await.unwrap();
        }

        let first = tags.list_tags(&repo, 2, None).await.unwrap();
        assert_eq!(first.tags, vec!["a", "c"]);
        tags.upsert(&repo, "b", &digest, "a/b").await.unwrap();
        tags.upsert(&repo, "d", &digest, "a/b").await.unwrap();

        let second = tags.list_tags(&repo, 2, Some("c")).await.unwrap();
        assert_eq!(second.tags, vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_list_tags_zero_limit_is_capped() {
        let fx = fixture().await;
        let tags = index(&fx, 2).await;
        let repo = RepoIdentifier::new(None, "app");
        let digest = manifest(&fx, b"{}").await;
        for tag in ["a", "b", "c"] {
            tags.upsert(&repo, tag, &digest, "a/b").await.unwrap();
        }

        let page = tags.list_tags(&repo, 0, None).await.unwrap();
        assert_eq!(page.tags, vec!["a", "b"]);
        assert!(page.has_more);

        let page = tags.list_tags(&repo, 50, None).await.unwrap();
        assert_eq!(page.tags.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_tag_keeps_content() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let digest = manifest(&fx, b"{}").await;
        tags.upsert(&repo, "v1", &digest, "a/b").await.unwrap();

        tags.delete_tag(&repo, "v1").await.unwrap();
        assert!(matches!(tags.resolve(&repo, "v1").await, Err(AppError::ManifestUnknown(_))));
        assert!(fx.content.stat(&digest).await.unwrap().is_some());
        assert!(matches!(tags.delete_tag(&repo, "v1").await, Err(AppError::ManifestUnknown(_))));
    }

    #[tokio::test]
    async fn test_deleting_content_drops_its_tags() {
        let fx = fixture().await;
        let tags = index(&fx, 100).await;
        let repo = RepoIdentifier::new(None, "app");
        let digest = manifest(&fx, b"{}").await;
        tags.upsert(&repo, "v1", &digest, "a/b").await.unwrap();

        fx.content.delete(&digest).await.unwrap();
        assert_eq!(row_count(&fx).await, 0);
    }
}
