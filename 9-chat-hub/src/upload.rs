//! Partial uploads keyed by their `fileId`.
//!
//! Every session streams into its own scratch file under the configured upload
//! directory. A session moves `Started -> Receiving -> Finalized`; once
//! finalized (or aborted, or reclaimed) it is gone from the manager and its
//! token may be reused.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use nanoid::nanoid;
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
    time::Instant,
};
use tracing::{debug, warn};

use crate::{message::FileId, registry::ConnectionId};

const DEFAULT_FILE_NAME: &str = "uploaded.bin";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload {0} is already in progress")]
    AlreadyActive(FileId),
    #[error("no upload in progress for {0}")]
    Unknown(FileId),
    #[error("upload {file_id} belongs to {owner}, not {conn}")]
    NotOwner {
        file_id: FileId,
        owner: ConnectionId,
        conn: ConnectionId,
    },
    #[error("upload {0} is already finalized")]
    Finalized(FileId),
    #[error("i/o failure on upload {file_id}")]
    Io {
        file_id: FileId,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Started,
    Receiving,
    Finalized,
}

struct Destination {
    file: Option<File>,
    received: u64,
    phase: UploadPhase,
}

pub struct UploadSession {
    file_id: FileId,
    name: String,
    owner: ConnectionId,
    expected_size: Option<u64>,
    path: PathBuf,
    destination: Mutex<Destination>,
    last_activity: parking_lot::Mutex<Instant>,
}

impl UploadSession {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn received(&self) -> u64 {
        self.destination.lock().await.received
    }

    pub async fn phase(&self) -> UploadPhase {
        self.destination.lock().await.phase
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    async fn append(&self, bytes: &[u8]) -> Result<u64, UploadError> {
        let mut destination = self.destination.lock().await;
        let Some(file) = destination.file.as_mut() else {
            return Err(UploadError::Finalized(self.file_id.clone()));
        };

        // Count only what reached the file.
        file.write_all(bytes).await.map_err(|source| self.io(source))?;
        file.flush().await.map_err(|source| self.io(source))?;

        destination.received += bytes.len() as u64;
        destination.phase = UploadPhase::Receiving;
        *self.last_activity.lock() = Instant::now();
        Ok(destination.received)
    }

    async fn finalize(&self) -> Result<u64, UploadError> {
        let mut destination = self.destination.lock().await;
        let Some(mut file) = destination.file.take() else {
            return Err(UploadError::Finalized(self.file_id.clone()));
        };
        destination.phase = UploadPhase::Finalized;

        file.flush().await.map_err(|source| self.io(source))?;
        file.sync_all().await.map_err(|source| self.io(source))?;
        Ok(destination.received)
    }

    /// Closes the destination and deletes the scratch file.
    async fn discard(&self) {
        let mut destination = self.destination.lock().await;
        destination.file.take();
        destination.phase = UploadPhase::Finalized;
        drop(destination);

        if let Err(error) = tokio::fs::remove_file(&self.path).await {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(file_id = %self.file_id, path = %self.path.display(), ?error, "failed to remove scratch file");
            }
        }
    }

    fn io(&self, source: io::Error) -> UploadError {
        UploadError::Io {
            file_id: self.file_id.clone(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProgress {
    pub file_id: FileId,
    pub name: String,
    pub received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedUpload {
    pub file_id: FileId,
    pub name: String,
    pub path: PathBuf,
    pub received: u64,
    pub expected_size: Option<u64>,
}

pub struct UploadManager {
    dir: PathBuf,
    sessions: DashMap<FileId, Arc<UploadSession>>,
}

impl UploadManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, file_id: &FileId) -> Option<Arc<UploadSession>> {
        self.sessions
            .get(file_id)
            .map(|session| Arc::clone(session.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Opens the scratch file and registers the session. `size` is advisory;
    /// negative values mean unknown.
    pub async fn start(
        &self,
        owner: ConnectionId,
        file_id: FileId,
        name: &str,
        size: i64,
    ) -> Result<Arc<UploadSession>, UploadError> {
        if self.sessions.contains_key(&file_id) {
            return Err(UploadError::AlreadyActive(file_id));
        }

        let name = display_name(name);
        let path = self
            .dir
            .join(format!("upload-{}-{}", nanoid!(10), scratch_suffix(&name)));
        let file = match create_scratch(&path).await {
            Ok(file) => file,
            Err(source) => return Err(UploadError::Io { file_id, source }),
        };

        let session = Arc::new(UploadSession {
            file_id: file_id.clone(),
            name,
            owner,
            expected_size: u64::try_from(size).ok(),
            path,
            destination: Mutex::new(Destination {
                file: Some(file),
                received: 0,
                phase: UploadPhase::Started,
            }),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        });

        // Lost a race with another start for the same token.
        let inserted = match self.sessions.entry(file_id) {
            Entry::Occupied(entry) => Err(entry.key().clone()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                Ok(())
            }
        };
        if let Err(file_id) = inserted {
            session.discard().await;
            return Err(UploadError::AlreadyActive(file_id));
        }

        debug!(file_id = %session.file_id, path = %session.path.display(), "upload session opened");
        Ok(session)
    }

    /// Appends a chunk sent by `conn`. An I/O failure aborts the upload.
    pub async fn write(
        &self,
        conn: ConnectionId,
        file_id: &FileId,
        bytes: &[u8],
    ) -> Result<WriteProgress, UploadError> {
        let session = self
            .get(file_id)
            .ok_or_else(|| UploadError::Unknown(file_id.clone()))?;
        if session.owner != conn {
            return Err(UploadError::NotOwner {
                file_id: file_id.clone(),
                owner: session.owner,
                conn,
            });
        }

        match session.append(bytes).await {
            Ok(received) => Ok(WriteProgress {
                file_id: file_id.clone(),
                name: session.name.clone(),
                received,
            }),
            Err(error @ UploadError::Io { .. }) => {
                self.abort(file_id).await;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Closes the destination and removes the session.
    pub async fn finish(&self, file_id: &FileId) -> Result<FinishedUpload, UploadError> {
        let (_, session) = self
            .sessions
            .remove(file_id)
            .ok_or_else(|| UploadError::Unknown(file_id.clone()))?;

        match session.finalize().await {
            Ok(received) => Ok(FinishedUpload {
                file_id: session.file_id.clone(),
                name: session.name.clone(),
                path: session.path.clone(),
                received,
                expected_size: session.expected_size,
            }),
            Err(error) => {
                session.discard().await;
                Err(error)
            }
        }
    }

    /// Drops the session and its scratch file. Returns `false` if there was
    /// nothing to abort.
    pub async fn abort(&self, file_id: &FileId) -> bool {
        match self.sessions.remove(file_id) {
            Some((_, session)) => {
                session.discard().await;
                true
            }
            None => false,
        }
    }

    /// Drops every session and deletes its scratch file.
    pub async fn abort_all(&self) -> usize {
        self.reclaim_where(|_| true).await
    }

    /// Reclaims every session owned by `owner`.
    pub async fn reclaim_owned_by(&self, owner: ConnectionId) -> usize {
        self.reclaim_where(|session| session.owner == owner).await
    }

    /// Reclaims sessions whose owner is no longer live and that have been idle
    /// for at least `grace`.
    pub async fn reclaim_orphans<F>(&self, is_live: F, grace: Duration) -> usize
    where
        F: Fn(ConnectionId) -> bool,
    {
        self.reclaim_where(|session| !is_live(session.owner) && session.idle_for() >= grace)
            .await
    }

    async fn reclaim_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&UploadSession) -> bool,
    {
        let candidates: Vec<Arc<UploadSession>> = self
            .sessions
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut reclaimed = 0;
        for session in candidates {
            let removed = self
                .sessions
                .remove_if(&session.file_id, |_, current| Arc::ptr_eq(current, &session));
            if removed.is_some() {
                warn!(
                    file_id = %session.file_id,
                    owner = %session.owner,
                    name = %session.name,
                    "reclaiming abandoned upload"
                );
                session.discard().await;
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// Never reuses an existing file.
async fn create_scratch(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

fn display_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Keeps the scratch file inside the upload directory no matter what the peer
/// named its file.
fn scratch_suffix(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|base| base.to_str())
        .unwrap_or(DEFAULT_FILE_NAME);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(raw: u64) -> ConnectionId {
        ConnectionId::from(raw)
    }

    #[tokio::test]
    async fn chunks_land_in_order_and_counter_tracks_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());
        let file_id = FileId::from("f1");

        let session = uploads
            .start(conn(1), file_id.clone(), "x.bin", 6)
            .await
            .expect("start");
        assert_eq!(session.phase().await, UploadPhase::Started);
        assert_eq!(session.expected_size(), Some(6));

        let first = uploads.write(conn(1), &file_id, b"abc").await.expect("write");
        assert_eq!(first.received, 3);
        assert_eq!(session.phase().await, UploadPhase::Receiving);
        let second = uploads.write(conn(1), &file_id, b"def").await.expect("write");
        assert_eq!(second.received, 6);

        let finished = uploads.finish(&file_id).await.expect("finish");
        assert_eq!(finished.received, 6);
        assert_eq!(finished.name, "x.bin");
        assert_eq!(session.phase().await, UploadPhase::Finalized);
        assert!(uploads.is_empty());

        let contents = tokio::fs::read(&finished.path).await.expect("read upload");
        assert_eq!(contents, b"abcdef");
        assert!(finished.path.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn duplicate_start_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());

        uploads
            .start(conn(1), "f1".into(), "a.txt", -1)
            .await
            .expect("first start");
        let second = uploads.start(conn(1), "f1".into(), "b.txt", -1).await;

        assert!(matches!(second, Err(UploadError::AlreadyActive(_))));
        assert_eq!(uploads.len(), 1);
    }

    #[tokio::test]
    async fn only_the_owner_may_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());
        let file_id = FileId::from("f1");
        let session = uploads
            .start(conn(1), file_id.clone(), "a.txt", 3)
            .await
            .expect("start");

        let result = uploads.write(conn(2), &file_id, b"xyz").await;
        assert!(matches!(result, Err(UploadError::NotOwner { .. })));
        assert_eq!(session.received().await, 0);
    }

    #[tokio::test]
    async fn unknown_token_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());

        let write = uploads.write(conn(1), &"nope".into(), b"x").await;
        assert!(matches!(write, Err(UploadError::Unknown(_))));
        let finish = uploads.finish(&"nope".into()).await;
        assert!(matches!(finish, Err(UploadError::Unknown(_))));
    }

    #[tokio::test]
    async fn failed_open_leaves_no_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path().join("missing"));

        let result = uploads.start(conn(1), "f1".into(), "a.txt", 1).await;
        assert!(matches!(result, Err(UploadError::Io { .. })));
        assert!(uploads.is_empty());
    }

    #[tokio::test]
    async fn write_failure_aborts_the_upload_and_deletes_its_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());
        let file_id = FileId::from("f1");
        let path = dir.path().join("upload-readonly-x.bin");
        tokio::fs::write(&path, b"").await.expect("create scratch");
        let read_only = File::open(&path).await.expect("open read-only");

        uploads.sessions.insert(
            file_id.clone(),
            Arc::new(UploadSession {
                file_id: file_id.clone(),
                name: "x.bin".into(),
                owner: conn(1),
                expected_size: None,
                path: path.clone(),
                destination: Mutex::new(Destination {
                    file: Some(read_only),
                    received: 0,
                    phase: UploadPhase::Started,
                }),
                last_activity: parking_lot::Mutex::new(Instant::now()),
            }),
        );

        let result = uploads.write(conn(1), &file_id, b"abc").await;
        assert!(matches!(result, Err(UploadError::Io { .. })));
        assert!(uploads.get(&file_id).is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn scratch_files_are_never_truncated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("upload-taken-a.txt");
        tokio::fs::write(&path, b"keep me").await.expect("seed file");

        let error = create_scratch(&path).await.expect_err("path is taken");
        assert_eq!(error.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(tokio::fs::read(&path).await.expect("read"), b"keep me");
    }

    #[tokio::test]
    async fn abort_all_clears_every_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());
        let a = uploads.start(conn(1), "a".into(), "a", -1).await.expect("start");
        let b = uploads.start(conn(2), "b".into(), "b", -1).await.expect("start");

        assert_eq!(uploads.abort_all().await, 2);
        assert!(uploads.is_empty());
        assert!(!a.path().exists());
        assert!(!b.path().exists());
    }

    #[tokio::test]
    async fn orphaned_sessions_are_reclaimed_after_grace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());
        let orphan = uploads
            .start(conn(1), "orphan".into(), "a.txt", -1)
            .await
            .expect("start");
        uploads
            .start(conn(2), "live".into(), "b.txt", -1)
            .await
            .expect("start");

        let live = |id: ConnectionId| id == conn(2);
        assert_eq!(uploads.reclaim_orphans(live, Duration::from_secs(3600)).await, 0);
        assert_eq!(uploads.reclaim_orphans(live, Duration::ZERO).await, 1);

        assert!(uploads.get(&"orphan".into()).is_none());
        assert!(uploads.get(&"live".into()).is_some());
        assert!(!orphan.path().exists());
    }

    #[tokio::test]
    async fn reclaim_by_owner_removes_only_that_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = UploadManager::new(dir.path());
        uploads.start(conn(1), "a".into(), "a", -1).await.expect("start");
        uploads.start(conn(1), "b".into(), "b", -1).await.expect("start");
        uploads.start(conn(2), "c".into(), "c", -1).await.expect("start");

        assert_eq!(uploads.reclaim_owned_by(conn(1)).await, 2);
        assert_eq!(uploads.len(), 1);
    }

    #[test]
    fn scratch_names_stay_inside_the_upload_dir() {
        assert_eq!(scratch_suffix("../../etc/passwd"), "passwd");
        assert_eq!(scratch_suffix("my report.pdf"), "my_report.pdf");
        assert_eq!(scratch_suffix(".."), DEFAULT_FILE_NAME);
        assert_eq!(display_name("   "), DEFAULT_FILE_NAME);
    }
}
