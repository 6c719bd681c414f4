use crate::domain::digest::Digest;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    pub digest: String,
    pub size: i64,
    pub media_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata of a fully persisted blob. Manifests carry a media type, plain
/// layers and configs do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: u64,
    pub media_type: Option<String>,
}

impl TryFrom<BlobRow> for BlobInfo {
    type Error = AppError;

    fn try_from(row: BlobRow) -> Result<Self, Self::Error> {
        Ok(BlobInfo {
            digest: row.digest.parse().map_err(AppError::corrupt_row)?,
            size: u64::try_from(row.size).map_err(AppError::corrupt_row)?,
            media_type: row.media_type,
        })
    }
}
