//! Spool directory watcher
//!
//! Turns `<spool_dir>/new` into a deduplicated stream of stable file paths.
//! An OS notifier feeds a pending map; a periodic tick promotes entries
//! whose size and mtime have been unchanged for `stability_wait`. Files
//! already processed (per the journal) are suppressed, which also covers
//! duplicates produced by the overflow rescan.

use crate::config::SpoolConfig;
use crate::state::StateStore;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum NotifyMsg {
    Paths(Vec<PathBuf>),
    Rescan,
}

struct Pending {
    size: u64,
    mtime: SystemTime,
    first_seen: Instant,
}

pub struct SpoolWatcher {
    new_dir: PathBuf,
    archive_dir: Option<PathBuf>,
    stability_wait: Duration,
    check_interval: Duration,
    max_pending_files: usize,
    store: Arc<StateStore>,
}

impl SpoolWatcher {
    /// Create the watcher, making sure the `new/` and archive directories
    /// exist.
    pub fn new(cfg: &SpoolConfig, store: Arc<StateStore>) -> std::io::Result<Self> {
        let new_dir = cfg.spool_dir.join("new");
        std::fs::create_dir_all(&new_dir)?;
        if let Some(archive) = &cfg.archive_dir {
            std::fs::create_dir_all(archive)?;
        }
        Ok(Self {
            new_dir,
            archive_dir: cfg.archive_dir.clone(),
            stability_wait: cfg.stability_wait,
            check_interval: cfg.check_interval,
            max_pending_files: cfg.max_pending_files,
            store,
        })
    }

    pub fn archive_dir(&self) -> Option<&Path> {
        self.archive_dir.as_deref()
    }

    /// Move a decoded file to the archive directory, or delete it when no
    /// archive is configured. A missing file is not an error.
    pub fn archive_file(&self, path: &Path) -> std::io::Result<()> {
        archive_file(self.archive_dir.as_deref(), path)
    }

    /// Run until cancellation, emitting stable paths on `tx`. Closing the
    /// channel signals the workers that no more paths will arrive.
    pub async fn run(&self, tx: mpsc::Sender<PathBuf>, cancel: CancellationToken) {
        let (notify_tx, mut notify_rx) = mpsc::channel::<NotifyMsg>(1024);

        let mut watcher = match self.start_notifier(notify_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                // Degraded mode: periodic rescans still discover files.
                warn!(error = %e, "filesystem notifier unavailable, polling only");
                None
            }
        };

        let mut pending: HashMap<PathBuf, Pending> = HashMap::new();

        // Startup: existing entries follow the same stability discipline;
        // files already past the horizon ship immediately.
        if self
            .scan_dir(&mut pending, &tx, &cancel)
            .await
            .is_err()
        {
            return;
        }

        let mut tick = tokio::time::interval(self.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = notify_rx.recv() => match msg {
                    Some(NotifyMsg::Paths(paths)) => {
                        for path in paths {
                            self.observe(&mut pending, path);
                        }
                    }
                    Some(NotifyMsg::Rescan) => {
                        info!("notifier overflow, rescanning spool directory");
                        if self.scan_dir(&mut pending, &tx, &cancel).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Notifier thread died; keep going on ticks alone.
                        if watcher.take().is_some() {
                            warn!("filesystem notifier stopped, polling only");
                        }
                    }
                },
                _ = tick.tick() => {
                    // Without a notifier the tick is the only discovery path.
                    if watcher.is_none()
                        && self.scan_dir(&mut pending, &tx, &cancel).await.is_err()
                    {
                        break;
                    }
                    if self.promote_stable(&mut pending, &tx, &cancel).await.is_err() {
                        break;
                    }
                }
            }
        }

        drop(watcher);
        debug!("spool watcher stopped");
    }

    fn start_notifier(
        &self,
        notify_tx: mpsc::Sender<NotifyMsg>,
    ) -> notify::Result<RecommendedWatcher> {
        let new_dir = self.new_dir.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let msg = match res {
                    Ok(event) => {
                        if event.need_rescan() {
                            NotifyMsg::Rescan
                        } else {
                            let paths: Vec<PathBuf> = event
                                .paths
                                .into_iter()
                                .filter(|p| p.parent() == Some(new_dir.as_path()))
                                .collect();
                            if paths.is_empty() {
                                return;
                            }
                            NotifyMsg::Paths(paths)
                        }
                    }
                    Err(_) => NotifyMsg::Rescan,
                };
                let _ = notify_tx.blocking_send(msg);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.new_dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Record or refresh a pending entry. The bounded map evicts its oldest
    /// entry when full; the evicted file is rediscovered by a later rescan.
    fn observe(&self, pending: &mut HashMap<PathBuf, Pending>, path: PathBuf) {
        let meta = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => {
                pending.remove(&path);
                return;
            }
        };

        let size = meta.len();
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        match pending.get_mut(&path) {
            Some(entry) => {
                entry.size = size;
                entry.mtime = mtime;
            }
            None => {
                if pending.len() >= self.max_pending_files {
                    if let Some(oldest) = pending
                        .iter()
                        .min_by_key(|(_, e)| e.first_seen)
                        .map(|(p, _)| p.clone())
                    {
                        warn!(path = %oldest.display(), "pending map full, evicting oldest");
                        pending.remove(&oldest);
                    }
                }
                pending.insert(
                    path,
                    Pending {
                        size,
                        mtime,
                        first_seen: Instant::now(),
                    },
                );
            }
        }
    }

    /// Promote entries whose size and mtime have been stable past the wait.
    async fn promote_stable(
        &self,
        pending: &mut HashMap<PathBuf, Pending>,
        tx: &mpsc::Sender<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        let mut ready = Vec::new();
        let now = SystemTime::now();

        pending.retain(|path, entry| {
            let meta = match std::fs::metadata(path) {
                Ok(m) if m.is_file() => m,
                _ => return false,
            };
            let size = meta.len();
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            if size != entry.size || mtime != entry.mtime {
                entry.size = size;
                entry.mtime = mtime;
                return true;
            }

            let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
            if age >= self.stability_wait {
                ready.push(path.clone());
                return false;
            }
            true
        });

        for path in ready {
            if self.store.was_processed(&path).unwrap_or(false) {
                debug!(path = %path.display(), "skipping journaled file");
                continue;
            }
            send_path(tx, cancel, path).await?;
        }
        Ok(())
    }

    /// Enumerate the spool directory: journaled files are skipped, stable
    /// files are emitted (paced by the bounded channel), recent files join
    /// the pending map.
    async fn scan_dir(
        &self,
        pending: &mut HashMap<PathBuf, Pending>,
        tx: &mpsc::Sender<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        let entries = match std::fs::read_dir(&self.new_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to read spool directory");
                return Ok(());
            }
        };

        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            if pending.contains_key(&path) {
                continue;
            }
            if self.store.was_processed(&path).unwrap_or(false) {
                continue;
            }

            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
            if age >= self.stability_wait {
                send_path(tx, cancel, path).await?;
            } else {
                self.observe(pending, path);
            }
        }
        Ok(())
    }
}

async fn send_path(
    tx: &mpsc::Sender<PathBuf>,
    cancel: &CancellationToken,
    path: PathBuf,
) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        sent = tx.send(path) => sent.map_err(|_| ()),
    }
}

/// Move `path` into `archive_dir`, or delete it when archiving is off.
/// Absent files are a non-error: a concurrent cleanup already won.
pub fn archive_file(archive_dir: Option<&Path>, path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match archive_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let dest = dir.join(path.file_name().unwrap_or_default());
            if std::fs::rename(path, &dest).is_err() {
                // Cross-device fallback.
                std::fs::copy(path, &dest)?;
                std::fs::remove_file(path)?;
            }
            Ok(())
        }
        None => match std::fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_file_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"data").unwrap();

        archive_file(None, &file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_archive_file_move() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"data").unwrap();

        archive_file(Some(archive.path()), &file).unwrap();
        assert!(!file.exists());
        assert_eq!(
            std::fs::read(archive.path().join("f.bin")).unwrap(),
            b"data"
        );
    }

    #[test]
    fn test_archive_missing_file_is_ok() {
        archive_file(None, Path::new("/nonexistent/file.bin")).unwrap();
        let archive = tempfile::tempdir().unwrap();
        archive_file(Some(archive.path()), Path::new("/nonexistent/file.bin")).unwrap();
    }
}
