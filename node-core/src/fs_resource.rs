//! Mount lifecycle of the volume holding the file-backed store.
//!
//! Users take an [`FsLease`] before their first file operation; dropping the
//! lease releases it on every exit path. When the last lease goes away the
//! volume stays mounted for `unmount_delay` so that bursts of reads and
//! writes (boot load followed by a self-healing save, say) pay for a single
//! mount. The pending unmount is a deadline checked by [`FsResourceManager::poll`],
//! which the housekeeping task calls periodically; any new acquire cancels it.

use crate::traits::Volume;
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted { refcount: usize },
    /// Mounted and idle, unmounts once `deadline` passes.
    Lingering { deadline: Instant },
}

pub struct FsResourceManager {
    volume: Box<dyn Volume>,
    state: Mutex<MountState>,
    unmount_delay: Duration,
    lock_timeout: Duration,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
}

impl FsResourceManager {
    pub fn new(volume: impl Volume + 'static, unmount_delay: Duration, lock_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            volume: Box::new(volume),
            state: Mutex::new(MountState::Unmounted),
            unmount_delay,
            lock_timeout,
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.volume.root()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MountState>> {
        self.state
            .try_lock_for(self.lock_timeout)
            .ok_or(Error::LockTimeout("volume mount state"))
    }

    /// Takes a reference on the volume, mounting it first if needed.
    ///
    /// A failed mount leaves the state untouched and is returned to the caller.
    pub fn acquire(self: &Arc<Self>) -> Result<FsLease> {
        let mut state = self.lock_state()?;
        *state = match *state {
            MountState::Unmounted => {
                tracing::debug!(root = %self.root().display(), "Mounting volume");
                self.volume.mount().map_err(|source| Error::Mount {
                    root: self.root().to_path_buf(),
                    source,
                })?;
                self.mounts.fetch_add(1, Ordering::Relaxed);
                MountState::Mounted { refcount: 1 }
            }
            MountState::Lingering { .. } => {
                tracing::trace!("Deferred unmount cancelled by new acquire");
                MountState::Mounted { refcount: 1 }
            }
            MountState::Mounted { refcount } => MountState::Mounted { refcount: refcount + 1 },
        };
        Ok(FsLease {
            manager: Arc::clone(self),
        })
    }

    // Unbounded wait: a dropped release would pin the volume mounted.
    fn release(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            MountState::Mounted { refcount: 1 } => {
                tracing::trace!(delay = ?self.unmount_delay, "Last lease released, arming deferred unmount");
                MountState::Lingering {
                    deadline: Instant::now() + self.unmount_delay,
                }
            }
            MountState::Mounted { refcount } => MountState::Mounted { refcount: refcount - 1 },
            other => {
                tracing::warn!(state = ?other, "Release without a matching acquire");
                other
            }
        };
    }

    /// Unmounts the volume if the deferred-unmount deadline has passed at `now`.
    /// Returns whether an unmount happened.
    pub fn poll(&self, now: Instant) -> bool {
        let mut state = match self.lock_state() {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("Skipping unmount check: {}", e);
                return false;
            }
        };
        match *state {
            MountState::Lingering { deadline } if deadline <= now => {
                self.unmount_locked(&mut state);
                true
            }
            _ => false,
        }
    }

    /// Unmounts immediately when no lease is outstanding.
    pub fn unmount_now(&self) -> Result<bool> {
        let mut state = self.lock_state()?;
        match *state {
            MountState::Lingering { .. } => {
                self.unmount_locked(&mut state);
                Ok(true)
            }
            MountState::Mounted { refcount } => {
                tracing::warn!(refcount, "Volume still in use, not unmounting");
                Ok(false)
            }
            MountState::Unmounted => Ok(false),
        }
    }

    fn unmount_locked(&self, state: &mut MountState) {
        tracing::debug!(root = %self.root().display(), "Unmounting idle volume");
        if let Err(e) = self.volume.unmount() {
            tracing::error!("Volume unmount failed: {}", e);
        }
        self.unmounts.fetch_add(1, Ordering::Relaxed);
        *state = MountState::Unmounted;
    }

    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::Relaxed)
    }

    pub fn unmount_count(&self) -> usize {
        self.unmounts.load(Ordering::Relaxed)
    }

    /// Spawns the housekeeping tick that drives deferred unmounts.
    pub fn spawn_housekeeping(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.poll(Instant::now());
            }
        })
    }
}

/// Scoped reference on the mounted volume.
pub struct FsLease {
    manager: Arc<FsResourceManager>,
}

impl FsLease {
    pub fn root(&self) -> &Path {
        self.manager.root()
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.root().join(file_name)
    }
}

impl Drop for FsLease {
    fn drop(&mut self) {
        self.manager.release();
    }
}

/// A directory used as the store volume.
///
/// Mounting checks that the directory exists and is writable, creating it
/// when `create_if_missing` is set; unmounting flushes directory metadata.
#[derive(Debug, Clone)]
pub struct DirectoryVolume {
    root: PathBuf,
    create_if_missing: bool,
}

impl DirectoryVolume {
    pub fn new(root: impl Into<PathBuf>, create_if_missing: bool) -> Self {
        Self {
            root: root.into(),
            create_if_missing,
        }
    }
}

impl Volume for DirectoryVolume {
    fn root(&self) -> &Path {
        &self.root
    }

    fn mount(&self) -> io::Result<()> {
        if !self.root.exists() && self.create_if_missing {
            tracing::info!(root = %self.root.display(), "Formatting empty volume directory");
            std::fs::create_dir_all(&self.root)?;
        }
        let metadata = std::fs::metadata(&self.root)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", self.root.display()),
            ));
        }
        if metadata.permissions().readonly() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is read-only", self.root.display()),
            ));
        }
        Ok(())
    }

    fn unmount(&self) -> io::Result<()> {
        std::fs::File::open(&self.root)?.sync_all()
    }
}
