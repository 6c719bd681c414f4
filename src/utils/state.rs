use crate::config::RegistryConfig;
use crate::error::{AppError, Result};
use crate::service::auth::{Authenticator, HtpasswdFile};
use crate::service::upload::UploadSessionManager;
use crate::storage::{ContentStore, FilesystemContentStore, PathManager, SqliteTagIndex, TagIndex};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Everything a handler needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RegistryConfig>,
    pub content: Arc<dyn ContentStore>,
    pub tags: Arc<dyn TagIndex>,
    pub uploads: Arc<UploadSessionManager>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl AppState {
    pub fn new(config: RegistryConfig, pool: SqlitePool) -> Result<Self> {
        let authenticator: Option<Arc<dyn Authenticator>> = match &config.htpasswd_file {
            Some(path) => {
                let file = HtpasswdFile::load(path).map_err(|e| {
                    AppError::Others(format!("cannot read htpasswd file {}: {e}", path.display()))
                })?;
                if file.is_empty() {
                    tracing::warn!("htpasswd file {} has no usable entries", path.display());
                }
                Some(Arc::new(file))
            }
            None => {
                tracing::warn!("no htpasswd file configured, registry is open to anonymous access");
                None
            }
        };
        Ok(Self::with_authenticator(config, pool, authenticator))
    }

    pub fn with_authenticator(
        config: RegistryConfig,
        pool: SqlitePool,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let paths = PathManager::new(&config.root_dir);
        let content: Arc<dyn ContentStore> =
            Arc::new(FilesystemContentStore::new(paths.clone(), pool.clone()));
        let tags: Arc<dyn TagIndex> = Arc::new(SqliteTagIndex::new(
            pool,
            content.clone(),
            config.max_tag_page,
        ));
        let uploads = Arc::new(UploadSessionManager::new(
            paths,
            content.clone(),
            Duration::from_secs(config.upload_idle_timeout_secs),
        ));

        AppState {
            config: Arc::new(config),
            content,
            tags,
            uploads,
            authenticator,
        }
    }
}
