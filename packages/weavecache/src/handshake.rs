//! External build handshake.
//!
//! An out-of-process rebuild and the in-process caches coordinate through a
//! single touch artifact on disk: entering `NeedsExternalBuild` deletes any
//! stale artifact (under a cross-process advisory lock), and a filesystem
//! watch on the artifact's directory reports its recreation by the build
//! tool. The watcher is a producer pushing `BuildCompleted` messages onto a
//! channel; the orchestrator consumes them and fans the reset out, so no
//! callback ever runs under a pipeline lock.
//!
//! If the directory is not writable or the watch cannot be set up the
//! handshake degrades to "never automatically detected": the project stays
//! in `NeedsExternalBuild` until an explicit override query. Reported once.

use crate::error::{PipelineError, Result};
use fs2::FileExt;
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Message pushed by the watcher when the build tool recreates the touch
/// artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    BuildCompleted,
}

/// Filesystem-based signal: a touch artifact plus a cross-process mutex
/// scoped to its path. Presence/absence and timestamp are the only state.
pub struct BuildHandshake {
    artifact_path: PathBuf,
    lock_path: PathBuf,
    available: AtomicBool,
    // Kept alive for the lifetime of the handshake; dropping it stops the
    // watch and closes the channel.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl BuildHandshake {
    pub fn new<P: Into<PathBuf>>(artifact_path: P) -> Self {
        let artifact_path = artifact_path.into();
        let lock_path = artifact_path.with_extension("lock");
        Self {
            artifact_path,
            lock_path,
            available: AtomicBool::new(true),
            watcher: Mutex::new(None),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// False once any filesystem step has failed; recovery is then manual
    /// (an override query).
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Clear any stale "already built" signal left over from a previous
    /// cycle. Called on the `Ready -> NeedsExternalBuild` edge so a later
    /// rebuild can be detected. Degrades instead of failing.
    pub fn clear_signal(&self) {
        if let Err(e) = self.try_clear_signal() {
            self.degrade(&format!("failed to clear build signal: {}", e));
        }
    }

    fn try_clear_signal(&self) -> Result<()> {
        let _lock = self.acquire_lock()?;
        if self.artifact_path.exists() {
            fs::remove_file(&self.artifact_path)?;
            debug!(artifact = %self.artifact_path.display(), "cleared stale build signal");
        }
        Ok(())
    }

    /// Recreate the touch artifact. This is the build-completion signal the
    /// external build tool sends; no payload beyond existence + timestamp.
    pub fn signal_build_completed(&self) -> Result<()> {
        let _lock = self.acquire_lock()?;
        if let Some(parent) = self.artifact_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.artifact_path)?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    /// Watch the artifact's directory and push `BuildCompleted` whenever
    /// the artifact is (re)created.
    pub fn watch(&self, tx: Sender<HandshakeEvent>) -> Result<()> {
        let dir = self
            .artifact_path
            .parent()
            .ok_or_else(|| PipelineError::handshake("touch artifact has no parent directory"))?
            .to_path_buf();
        if let Err(e) = fs::create_dir_all(&dir) {
            self.degrade(&format!("cannot create watch directory: {}", e));
            return Err(e.into());
        }

        let artifact = self.artifact_path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("build signal watcher error: {}", e);
                        return;
                    }
                };
                let is_creation = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
                );
                if is_creation && event.paths.iter().any(|p| p == &artifact) {
                    let _ = tx.send(HandshakeEvent::BuildCompleted);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| {
            self.degrade(&format!("cannot create watcher: {}", e));
            PipelineError::from(e)
        })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive).map_err(|e| {
            self.degrade(&format!("cannot watch build signal directory: {}", e));
            PipelineError::from(e)
        })?;

        *self.watcher.lock() = Some(watcher);
        debug!(dir = %dir.display(), "watching for external build completion");
        Ok(())
    }

    // Cross-process mutex scoped to the artifact path. fs2 releases the
    // advisory lock when the file handle drops.
    fn acquire_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn degrade(&self, reason: &str) {
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(
                "external build handshake degraded, manual rebuild detection required: {}",
                reason
            );
        }
    }
}

/// Force the IDE's own file-watch machinery to re-request analysis for a
/// unit by bumping its modification timestamp. Best effort.
pub fn bump_mtime(path: &Path) {
    let bumped = OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = bumped {
        debug!(path = %path.display(), "could not bump mtime: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_clear_signal_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("build.signal");
        fs::write(&artifact, b"done").unwrap();

        let handshake = BuildHandshake::new(&artifact);
        handshake.clear_signal();

        assert!(!artifact.exists());
        assert!(handshake.is_available());
    }

    #[test]
    fn test_clear_signal_without_artifact_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = BuildHandshake::new(dir.path().join("build.signal"));
        handshake.clear_signal();
        assert!(handshake.is_available());
    }

    #[test]
    fn test_signal_build_completed_creates_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("build.signal");
        let handshake = BuildHandshake::new(&artifact);

        handshake.signal_build_completed().unwrap();
        assert!(artifact.exists());
    }

    #[test]
    fn test_watch_reports_recreated_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("build.signal");
        let handshake = BuildHandshake::new(&artifact);

        let (tx, rx) = mpsc::channel();
        handshake.watch(tx).unwrap();

        handshake.signal_build_completed().unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, HandshakeEvent::BuildCompleted);
    }

    #[test]
    fn test_bump_mtime_touches_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("unit.src");
        fs::write(&file, b"content").unwrap();
        let before = fs::metadata(&file).unwrap().modified().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        bump_mtime(&file);

        let after = fs::metadata(&file).unwrap().modified().unwrap();
        assert!(after >= before);
    }
}
