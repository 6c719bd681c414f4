//! Blob upload sessions.
//!
//! A session moves `Initiated -> Receiving -> Committed`, or to `Aborted` on
//! cancel, digest mismatch, idle expiry, or an interrupted request. Sessions
//! live in an in-memory arena keyed by an opaque id; their bytes are staged
//! under the storage root until commit hands the file to the content store.
//! Terminal sessions are kept as tombstones until the sweeper reaps them, so
//! late requests see `SessionClosed` rather than an unknown id.

use crate::domain::{Digest, DigestHasher};
use crate::error::{AppError, Result};
use crate::storage::{ContentStore, PathManager};
use crate::utils::repo_identifier::RepoIdentifier;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions, create_dir_all, remove_dir_all};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Initiated,
    Receiving,
    Committed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Committed | SessionStatus::Aborted)
    }
}

/// Snapshot of a session returned to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadStatus {
    pub id: String,
    pub repo: RepoIdentifier,
    pub bytes_received: u64,
    pub status: SessionStatus,
}

#[derive(Debug)]
struct Progress {
    status: SessionStatus,
    bytes_received: u64,
    last_activity: Instant,
}

#[derive(Debug)]
struct SessionSlot {
    id: String,
    repo: RepoIdentifier,
    progress: std::sync::Mutex<Progress>,
    // Held for the whole of a PATCH or PUT; the hash state is only ever
    // touched by the current writer.
    writer: Arc<Mutex<DigestHasher>>,
}

impl SessionSlot {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> UploadStatus {
        let progress = self.progress();
        UploadStatus {
            id: self.id.clone(),
            repo: self.repo.clone(),
            bytes_received: progress.bytes_received,
            status: progress.status,
        }
    }

    fn record_chunk(&self, len: u64) {
        let mut progress = self.progress();
        progress.bytes_received += len;
        progress.last_activity = Instant::now();
        if progress.status == SessionStatus::Initiated {
            progress.status = SessionStatus::Receiving;
        }
    }

    /// Moves an open session to `status`. Returns false if it was already
    /// terminal.
    fn transition(&self, status: SessionStatus) -> bool {
        let mut progress = self.progress();
        if progress.status.is_terminal() {
            return false;
        }
        progress.status = status;
        progress.last_activity = Instant::now();
        true
    }
}

/// Exclusive right to write into a session. Dropping it without calling
/// `finish` or `release` aborts the session, which covers both request errors
/// and a client hanging up mid-body.
struct Writer {
    slot: Arc<SessionSlot>,
    hasher: OwnedMutexGuard<DigestHasher>,
    done: bool,
}

impl Writer {
    fn finish(mut self, status: SessionStatus) -> Result<UploadStatus> {
        self.done = true;
        if !self.slot.transition(status) {
            return Err(AppError::SessionClosed(self.slot.id.clone()));
        }
        Ok(self.slot.snapshot())
    }

    fn release(mut self) {
        self.done = true;
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.done && self.slot.transition(SessionStatus::Aborted) {
            tracing::warn!(session_id = %self.slot.id, "upload interrupted, session aborted");
        }
    }
}

pub struct UploadSessionManager {
    paths: PathManager,
    content: Arc<dyn ContentStore>,
    idle_timeout: Duration,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl UploadSessionManager {
    pub fn new(paths: PathManager, content: Arc<dyn ContentStore>, idle_timeout: Duration) -> Self {
        UploadSessionManager {
            paths,
            content,
            idle_timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a session for `repo`. Nothing is written to disk until the first
    /// chunk arrives.
    pub async fn initiate(&self, repo: &RepoIdentifier) -> UploadStatus {
        let id = uuid::Uuid::new_v4().to_string();
        let slot = Arc::new(SessionSlot {
            id: id.clone(),
            repo: repo.clone(),
            progress: std::sync::Mutex::new(Progress {
                status: SessionStatus::Initiated,
                bytes_received: 0,
                last_activity: Instant::now(),
            }),
            writer: Arc::new(Mutex::new(DigestHasher::new())),
        });
        let status = slot.snapshot();
        self.sessions.write().await.insert(id.clone(), slot);
        tracing::debug!(session_id = %id, repository = %repo, "upload session opened");
        status
    }

    /// Appends a request body to the session. When `offset` is given it must
    /// equal the number of bytes already received.
    pub async fn append<S, E>(
        &self,
        id: &str,
        repo: &RepoIdentifier,
        body: S,
        offset: Option<u64>,
    ) -> Result<UploadStatus>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<AppError>,
    {
        let mut writer = self.begin_write(id, repo).await?;
        let received = writer.slot.progress().bytes_received;
        if offset.is_some_and(|offset| offset != received) {
            writer.release();
            return Err(AppError::RangeNotSatisfiable {
                session_id: id.to_string(),
                name: repo.full_name(),
                current_size: received,
            });
        }

        self.write_body(&mut writer, body).await?;
        writer.finish(SessionStatus::Receiving)
    }

    /// Writes the optional final body, then checks everything received against
    /// `claimed` before handing the file to the content store. On mismatch the
    /// session is aborted and its bytes are discarded.
    pub async fn commit<S, E>(
        &self,
        id: &str,
        repo: &RepoIdentifier,
        claimed: &Digest,
        tail: Option<S>,
    ) -> Result<Digest>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<AppError>,
    {
        let mut writer = self.begin_write(id, repo).await?;
        match tail {
            Some(body) => self.write_body(&mut writer, body).await?,
            None => drop(self.open_data(id).await?),
        }

        if writer.slot.progress().status.is_terminal() {
            return Err(AppError::SessionClosed(id.to_string()));
        }

        let computed = writer.hasher.clone().finalize(claimed.algorithm());
        if computed != *claimed {
            writer.finish(SessionStatus::Aborted)?;
            self.discard(id).await;
            return Err(AppError::DigestMismatch {
                claimed: claimed.to_string(),
                computed: computed.to_string(),
            });
        }

        let stored = match self
            .content
            .verify_and_put_file(claimed, &self.paths.upload_data_path(id))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                drop(writer);
                self.discard(id).await;
                return Err(e);
            }
        };
        writer.finish(SessionStatus::Committed)?;
        self.discard(id).await;
        tracing::info!(session_id = %id, repository = %repo, digest = %stored, "upload committed");
        Ok(stored)
    }

    /// Aborts the session and drops its staged bytes. Cancelling a session
    /// that has already finished is a no-op; cancelling one with a request
    /// still writing into it fails with `SessionBusy`.
    pub async fn cancel(&self, id: &str, repo: &RepoIdentifier) -> Result<()> {
        let slot = self.lookup(id, repo).await?;
        let _writer = slot
            .writer
            .clone()
            .try_lock_owned()
            .map_err(|_| AppError::SessionBusy(id.to_string()))?;
        if slot.transition(SessionStatus::Aborted) {
            self.discard(id).await;
            tracing::info!(session_id = %id, repository = %repo, "upload cancelled");
        }
        Ok(())
    }

    pub async fn status(&self, id: &str, repo: &RepoIdentifier) -> Result<UploadStatus> {
        Ok(self.lookup(id, repo).await?.snapshot())
    }

    pub async fn tracked_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Aborts open sessions idle for at least the configured timeout and
    /// forgets terminal ones past the same window. Sessions with a writer in
    /// flight are left alone. Returns how many sessions were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|id, slot| {
                let Ok(_writer) = slot.writer.try_lock() else {
                    return true;
                };
                let mut progress = slot.progress();
                if now.duration_since(progress.last_activity) < self.idle_timeout {
                    return true;
                }
                if !progress.status.is_terminal() {
                    progress.status = SessionStatus::Aborted;
                    tracing::info!(session_id = %id, "upload session expired");
                }
                removed.push(id.clone());
                false
            });
        }

        for id in &removed {
            self.discard(id).await;
        }
        removed.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = self.sweep_expired().await;
                if swept > 0 {
                    tracing::debug!(swept, "upload sessions swept");
                }
            }
        })
    }

    async fn lookup(&self, id: &str, repo: &RepoIdentifier) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|slot| slot.repo == *repo)
            .cloned()
            .ok_or_else(|| AppError::BlobUploadUnknown(id.to_string()))
    }

    async fn begin_write(&self, id: &str, repo: &RepoIdentifier) -> Result<Writer> {
        let slot = self.lookup(id, repo).await?;
        let hasher = slot
            .writer
            .clone()
            .try_lock_owned()
            .map_err(|_| AppError::SessionBusy(id.to_string()))?;
        if slot.progress().status.is_terminal() {
            return Err(AppError::SessionClosed(id.to_string()));
        }
        Ok(Writer {
            slot,
            hasher,
            done: false,
        })
    }

    async fn open_data(&self, id: &str) -> Result<File> {
        let path = self.paths.upload_data_path(id);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        Ok(OpenOptions::new().create(true).append(true).open(path).await?)
    }

    async fn write_body<S, E>(&self, writer: &mut Writer, body: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<AppError>,
    {
        let mut file = self.open_data(&writer.slot.id).await?;
        pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(Into::into)?;
            file.write_all(&chunk).await?;
            writer.hasher.update(&chunk);
            writer.slot.record_chunk(chunk.len() as u64);
        }
        file.flush().await?;
        Ok(())
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = remove_dir_all(self.paths.upload_path(id)).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(session_id = %id, "failed to remove upload data: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{Fixture, fixture};
    use futures::stream;

    fn manager(fx: &Fixture, idle_timeout: Duration) -> UploadSessionManager {
        UploadSessionManager::new(
            PathManager::new(fx.dir.path().join("root")),
            fx.content.clone(),
            idle_timeout,
        )
    }

    fn body(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes>> {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part)))
                .collect::<Vec<_>>(),
        )
    }

    fn no_tail() -> Option<stream::Empty<Result<Bytes>>> {
        None
    }

    fn repo() -> RepoIdentifier {
        RepoIdentifier::new(Some("library"), "app")
    }

    #[tokio::test]
    async fn test_chunked_upload_commits() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));
        let payload: &[u8] = b"first half|second half";
        let digest = Digest::sha256(payload);

        let session = uploads.initiate(&repo()).await;
        assert_eq!(session.status, SessionStatus::Initiated);

        let after_first = uploads
            .append(&session.id, &repo(), body(&[&payload[..11]]), Some(0))
            .await
            .unwrap();
        assert_eq!(after_first.bytes_received, 11);
        assert_eq!(after_first.status, SessionStatus::Receiving);

        uploads
            .append(&session.id, &repo(), body(&[&payload[11..]]), Some(11))
            .await
            .unwrap();

        let stored = uploads.commit(&session.id, &repo(), &digest, no_tail()).await.unwrap();
        assert_eq!(stored, digest);
        assert_eq!(&fx.content.get(&digest).await.unwrap()[..], payload);
        assert_eq!(
            uploads.status(&session.id, &repo()).await.unwrap().status,
            SessionStatus::Committed
        );
    }

    #[tokio::test]
    async fn test_commit_with_wrong_digest_aborts() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));
        let session = uploads.initiate(&repo()).await;
        uploads
            .append(&session.id, &repo(), body(&[b"payload"]), None)
            .await
            .unwrap();

        let wrong = Digest::sha256(b"not the payload");
        let err = uploads
            .commit(&session.id, &repo(), &wrong, no_tail())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DigestMismatch { .. }));
        assert!(matches!(fx.content.get(&wrong).await, Err(AppError::BlobUnknown(_))));
        assert!(fx.content.stat(&Digest::sha256(b"payload")).await.unwrap().is_none());
        assert_eq!(
            uploads.status(&session.id, &repo()).await.unwrap().status,
            SessionStatus::Aborted
        );
        assert!(!PathManager::new(fx.dir.path().join("root")).upload_path(&session.id).exists());
    }

    #[tokio::test]
    async fn test_monolithic_commit_and_empty_blob() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));

        let session = uploads.initiate(&repo()).await;
        let digest = Digest::sha256(b"all at once");
        uploads
            .commit(&session.id, &repo(), &digest, Some(body(&[b"all ", b"at once"])))
            .await
            .unwrap();
        assert_eq!(&fx.content.get(&digest).await.unwrap()[..], b"all at once");

        let empty = uploads.initiate(&repo()).await;
        let digest = Digest::sha256(b"");
        uploads.commit(&empty.id, &repo(), &digest, no_tail()).await.unwrap();
        assert_eq!(fx.content.stat(&digest).await.unwrap().unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_terminal_sessions_reject_writes() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));
        let session = uploads.initiate(&repo()).await;
        uploads
            .commit(&session.id, &repo(), &Digest::sha256(b"x"), Some(body(&[b"x"])))
            .await
            .unwrap();

        let err = uploads
            .append(&session.id, &repo(), body(&[b"more"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SessionClosed(_)));
        let err = uploads
            .commit(&session.id, &repo(), &Digest::sha256(b"x"), no_tail())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_unknown_session_and_wrong_repository() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));
        assert!(matches!(
            uploads.status("nope", &repo()).await,
            Err(AppError::BlobUploadUnknown(_))
        ));

        let session = uploads.initiate(&repo()).await;
        let other = RepoIdentifier::new(None, "other");
        assert!(matches!(
            uploads.append(&session.id, &other, body(&[b"x"]), None).await,
            Err(AppError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn test_offset_mismatch_keeps_session_open() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));
        let session = uploads.initiate(&repo()).await;
        uploads
            .append(&session.id, &repo(), body(&[b"abc"]), Some(0))
            .await
            .unwrap();

        let err = uploads
            .append(&session.id, &repo(), body(&[b"def"]), Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RangeNotSatisfiable { current_size: 3, .. }));

        let status = uploads.status(&session.id, &repo()).await.unwrap();
        assert_eq!(status.status, SessionStatus::Receiving);
        assert_eq!(status.bytes_received, 3);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));
        let session = uploads.initiate(&repo()).await;
        uploads
            .append(&session.id, &repo(), body(&[b"abc"]), None)
            .await
            .unwrap();

        uploads.cancel(&session.id, &repo()).await.unwrap();
        uploads.cancel(&session.id, &repo()).await.unwrap();
        assert_eq!(
            uploads.status(&session.id, &repo()).await.unwrap().status,
            SessionStatus::Aborted
        );
        assert!(matches!(
            uploads.append(&session.id, &repo(), body(&[b"x"]), None).await,
            Err(AppError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_second_writer_is_rejected() {
        let fx = fixture().await;
        let uploads = Arc::new(manager(&fx, Duration::from_secs(60)));
        let session = uploads.initiate(&repo()).await;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes>>(1);
        let first = {
            let uploads = uploads.clone();
            let id = session.id.clone();
            tokio::spawn(async move {
                let body = tokio_stream_from(rx);
                uploads.append(&id, &repo(), body, None).await
            })
        };
        tx.send(Ok(Bytes::from_static(b"part"))).await.unwrap();
        // Wait until the first writer has consumed its chunk and holds the lock.
        while uploads.status(&session.id, &repo()).await.unwrap().bytes_received == 0 {
            tokio::task::yield_now().await;
        }

        let err = uploads
            .append(&session.id, &repo(), body(&[b"other"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SessionBusy(_)));

        drop(tx);
        let status = first.await.unwrap().unwrap();
        assert_eq!(status.bytes_received, 4);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_active_writer() {
        let fx = fixture().await;
        let uploads = Arc::new(manager(&fx, Duration::from_secs(60)));
        let session = uploads.initiate(&repo()).await;
        let digest = Digest::sha256(b"abcdef");

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes>>(1);
        let commit = {
            let uploads = uploads.clone();
            let id = session.id.clone();
            let digest = digest.clone();
            tokio::spawn(async move {
                uploads
                    .commit(&id, &repo(), &digest, Some(tokio_stream_from(rx)))
                    .await
            })
        };
        tx.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        while uploads.status(&session.id, &repo()).await.unwrap().bytes_received == 0 {
            tokio::task::yield_now().await;
        }

        let err = uploads.cancel(&session.id, &repo()).await.unwrap_err();
        assert!(matches!(err, AppError::SessionBusy(_)));

        tx.send(Ok(Bytes::from_static(b"def"))).await.unwrap();
        drop(tx);
        assert_eq!(commit.await.unwrap().unwrap(), digest);
        assert_eq!(&fx.content.get(&digest).await.unwrap()[..], b"abcdef");

        // Once the writer is gone, cancelling the finished session is a no-op.
        uploads.cancel(&session.id, &repo()).await.unwrap();
        assert_eq!(
            uploads.status(&session.id, &repo()).await.unwrap().status,
            SessionStatus::Committed
        );
    }

    #[tokio::test]
    async fn test_failed_body_aborts_session() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(60));
        let session = uploads.initiate(&repo()).await;

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(AppError::Others("connection reset".to_string())),
        ]);
        assert!(uploads.append(&session.id, &repo(), broken, None).await.is_err());
        assert_eq!(
            uploads.status(&session.id, &repo()).await.unwrap().status,
            SessionStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_sessions() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::ZERO);
        let idle = uploads.initiate(&repo()).await;
        uploads
            .append(&idle.id, &repo(), body(&[b"stale"]), None)
            .await
            .unwrap();
        uploads.initiate(&repo()).await;
        assert_eq!(uploads.tracked_sessions().await, 2);

        assert_eq!(uploads.sweep_expired().await, 2);
        assert_eq!(uploads.tracked_sessions().await, 0);
        assert!(matches!(
            uploads.status(&idle.id, &repo()).await,
            Err(AppError::BlobUploadUnknown(_))
        ));
        assert!(!PathManager::new(fx.dir.path().join("root")).upload_path(&idle.id).exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_sessions() {
        let fx = fixture().await;
        let uploads = manager(&fx, Duration::from_secs(3600));
        uploads.initiate(&repo()).await;
        assert_eq!(uploads.sweep_expired().await, 0);
        assert_eq!(uploads.tracked_sessions().await, 1);
    }

    fn tokio_stream_from(
        mut rx: tokio::sync::mpsc::Receiver<Result<Bytes>>,
    ) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}
