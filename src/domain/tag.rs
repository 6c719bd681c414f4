use crate::domain::digest::Digest;
use crate::error::AppError;
use crate::utils::repo_identifier::RepoIdentifier;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Ordering key for a tag. Lookups match the raw tag exactly, but two tags in
/// one repository may not share a sort key.
pub fn sort_key(tag: &str) -> String {
    tag.to_lowercase()
}

#[derive(Debug, Clone, FromRow)]
pub struct Tag {
    pub id: i64,
    pub namespace: String,
    pub name: String,
    pub tag: String,
    sort_tag: String,
    pub digest: String,
    pub content_type: String,
    pub updated_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(
        repo: &RepoIdentifier,
        tag: impl Into<String>,
        digest: &Digest,
        content_type: impl Into<String>,
    ) -> Self {
        let tag = tag.into();
        Self {
            id: 0,
            namespace: repo.namespace_key().to_string(),
            name: repo.name.clone(),
            sort_tag: sort_key(&tag),
            tag,
            digest: digest.to_string(),
            content_type: content_type.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn sort_tag(&self) -> &str {
        &self.sort_tag
    }

    pub fn target(&self) -> Result<Digest, AppError> {
        self.digest.parse().map_err(AppError::corrupt_row)
    }
}

/// Outcome of resolving a tag or digest reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub digest: Digest,
    pub content_type: String,
    pub size: u64,
}

/// One page of a tag listing in ascending sort order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPage {
    pub tags: Vec<String>,
    pub has_more: bool,
}
