//! Filesystem side of the engine: the app directory watcher and pledge/state
//! persistence.
//!
//! Layout under the app directory:
//!
//! ```text
//! <dir>/<anything>.lighthouse-project      project files, user-managed
//! <dir>/<hex project id>/                  per-project data, engine-managed
//!     <hex sha256>.lighthouse-pledge       verified pledges
//!     status.claimed                       {"claim_tx_hash": ...} once claimed
//! ```
//!
//! Only the DiskManager writes here. Writes are atomic: a temp file in the
//! same directory followed by a rename. The watcher polls directory
//! snapshots and emits debounced Added/Removed/Replaced events onto the
//! engine queue; files are the user's, so rejected pledges are never
//! deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pledge::Pledge;

pub const PROJECT_EXT: &str = "lighthouse-project";
pub const PLEDGE_EXT: &str = "lighthouse-pledge";
pub const CLAIM_STATUS_FILE: &str = "status.claimed";

/// Quiet period a file must survive unchanged before its event is emitted.
pub const DEBOUNCE: Duration = Duration::from_millis(150);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Filesystem changes delivered to the engine.
#[derive(Debug, Clone)]
pub enum DiskEvent {
    ProjectFile { path: PathBuf, bytes: Vec<u8> },
    ProjectFileRemoved { path: PathBuf },
    PledgeFile { path: PathBuf, bytes: Vec<u8> },
    PledgeFileRemoved { path: PathBuf },
}

/// Marker persisted once a project is claimed so CLAIMED survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimStatus {
    pub claim_tx_hash: String,
}

#[derive(Clone, PartialEq, Eq)]
struct FileStamp {
    mtime: SystemTime,
    len: u64,
}

/// Watches the app directory and owns every write into it.
#[derive(Clone)]
pub struct DiskManager {
    dir: PathBuf,
}

impl DiskManager {
    pub async fn open<P: Into<PathBuf>>(dir: P) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding a project's pledges and claim marker.
    pub fn project_dir(&self, project_id: &bitcoin::hashes::sha256::Hash) -> PathBuf {
        self.dir.join(project_id.to_string())
    }

    /// Spawn the watcher task. Emits one event per tracked file on startup,
    /// then debounced change events.
    pub fn start_watcher(&self, events_tx: mpsc::UnboundedSender<DiskEvent>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut known: HashMap<PathBuf, FileStamp> = HashMap::new();
            loop {
                if let Err(e) = manager.poll(&mut known, &events_tx).await {
                    warn!(error = %e, "directory scan failed");
                }
                if events_tx.is_closed() {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
    }

    async fn poll(
        &self,
        known: &mut HashMap<PathBuf, FileStamp>,
        events_tx: &mpsc::UnboundedSender<DiskEvent>,
    ) -> std::io::Result<()> {
        let current = self.snapshot().await?;

        let removed: Vec<PathBuf> =
            known.keys().filter(|p| !current.contains_key(*p)).cloned().collect();
        for path in removed {
            known.remove(&path);
            let event = match classify(&path) {
                Some(FileKind::Project) => DiskEvent::ProjectFileRemoved { path },
                Some(FileKind::Pledge) => DiskEvent::PledgeFileRemoved { path },
                None => continue,
            };
            let _ = events_tx.send(event);
        }

        for (path, stamp) in current {
            if known.get(&path) == Some(&stamp) {
                continue;
            }
            // Debounce: skip files modified less than the quiet period ago;
            // the next poll picks them up once they settle.
            if let Ok(age) = SystemTime::now().duration_since(stamp.mtime) {
                if age < DEBOUNCE {
                    continue;
                }
            }
            let kind = match classify(&path) {
                Some(kind) => kind,
                None => continue,
            };
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "unreadable, retrying");
                    continue;
                }
            };
            known.insert(path.clone(), stamp);
            let event = match kind {
                FileKind::Project => DiskEvent::ProjectFile { path, bytes },
                FileKind::Pledge => DiskEvent::PledgeFile { path, bytes },
            };
            let _ = events_tx.send(event);
        }
        Ok(())
    }

    /// Stat every project file at the top level and every pledge file one
    /// directory down.
    async fn snapshot(&self) -> std::io::Result<HashMap<PathBuf, FileStamp>> {
        let mut stamps = HashMap::new();
        let mut top = fs::read_dir(&self.dir).await?;
        while let Some(entry) = top.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_file() {
                if classify(&path).is_some() {
                    stamps.insert(path, stamp_of(&meta));
                }
            } else if meta.is_dir() {
                let mut sub = fs::read_dir(&path).await?;
                while let Some(inner) = sub.next_entry().await? {
                    let inner_path = inner.path();
                    let inner_meta = inner.metadata().await?;
                    if inner_meta.is_file() && classify(&inner_path) == Some(FileKind::Pledge) {
                        stamps.insert(inner_path, stamp_of(&inner_meta));
                    }
                }
            }
        }
        Ok(stamps)
    }

    /// Write bytes atomically: temp file in the destination directory, then
    /// rename over the target.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent).await?;
        let tmp = parent.join(format!(".tmp-{:08x}", rand::random::<u32>()));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Persist a verified pledge under the project's directory, named by its
    /// canonical hash.
    pub async fn persist_pledge(
        &self,
        project_id: &bitcoin::hashes::sha256::Hash,
        pledge: &Pledge,
    ) -> std::io::Result<PathBuf> {
        let dir = self.project_dir(project_id);
        let path = dir.join(format!("{}.{}", pledge.hash(), PLEDGE_EXT));
        self.write_atomic(&path, &pledge.encode_delimited()).await?;
        Ok(path)
    }

    pub async fn write_claim_status(
        &self,
        project_id: &bitcoin::hashes::sha256::Hash,
        claim_tx_hash: &bitcoin::Txid,
    ) -> std::io::Result<()> {
        let status = ClaimStatus { claim_tx_hash: claim_tx_hash.to_string() };
        let path = self.project_dir(project_id).join(CLAIM_STATUS_FILE);
        let bytes = serde_json::to_vec(&status)?;
        self.write_atomic(&path, &bytes).await
    }

    /// `None` when the project has never been claimed (or the marker is
    /// unreadable).
    pub async fn read_claim_status(
        &self,
        project_id: &bitcoin::hashes::sha256::Hash,
    ) -> Option<ClaimStatus> {
        let path = self.project_dir(project_id).join(CLAIM_STATUS_FILE);
        let bytes = fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Project,
    Pledge,
}

fn classify(path: &Path) -> Option<FileKind> {
    match path.extension()?.to_str()? {
        PROJECT_EXT => Some(FileKind::Project),
        PLEDGE_EXT => Some(FileKind::Pledge),
        _ => None,
    }
}

fn stamp_of(meta: &std::fs::Metadata) -> FileStamp {
    FileStamp {
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        len: meta.len(),
    }
}
