//! Exclusively leased cache directories for the CI runner.
//!
//! The runner keeps a download cache keyed by directory and is not safe for
//! concurrent use of one directory. The pool hands each worker its own slot;
//! an exhausted pool degrades instead of blocking (see [`OverflowPolicy`]).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, warn};

use crate::io::config::OverflowPolicy;

const SHARED_SLOT: &str = "shared";

/// Which kind of directory a lease holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Pool slot with this index.
    Pool(usize),
    /// Single shared fallback directory.
    Shared,
    /// Fresh directory deleted on release.
    Ephemeral,
}

#[derive(Debug)]
pub struct CachePool {
    root: PathBuf,
    slots: Vec<PathBuf>,
    busy: Mutex<Vec<bool>>,
    overflow: OverflowPolicy,
}

impl CachePool {
    /// Create `size` slot directories under `root`. A size of zero yields a
    /// pool that only hands out ephemeral slots.
    pub fn new(root: &Path, size: usize, overflow: OverflowPolicy) -> Result<Arc<Self>> {
        fs::create_dir_all(root).with_context(|| format!("create cache root {}", root.display()))?;
        let slots: Vec<PathBuf> = (0..size)
            .map(|index| root.join(format!("slot-{index}")))
            .collect();
        for slot in &slots {
            fs::create_dir_all(slot)
                .with_context(|| format!("create cache slot {}", slot.display()))?;
        }
        Ok(Arc::new(Self {
            root: root.to_path_buf(),
            busy: Mutex::new(vec![false; slots.len()]),
            slots,
            overflow,
        }))
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pool slots currently leased.
    pub fn leased(&self) -> usize {
        self.lock_or_recover().iter().filter(|busy| **busy).count()
    }

    /// Lease the first free slot, or an overflow slot when none is free.
    pub fn acquire(self: &Arc<Self>) -> Result<CacheLease> {
        if self.slots.is_empty() {
            return self.ephemeral();
        }

        let free = {
            let mut busy = self.lock_or_recover();
            let free = busy.iter().position(|taken| !*taken);
            if let Some(index) = free {
                busy[index] = true;
            }
            free
        };

        match (free, self.overflow) {
            (Some(index), _) => {
                debug!(slot = index, "cache slot leased");
                Ok(CacheLease {
                    pool: Arc::clone(self),
                    kind: SlotKind::Pool(index),
                    path: self.slots[index].clone(),
                })
            }
            (None, OverflowPolicy::Shared) => {
                warn!(size = self.slots.len(), "cache pool exhausted, using shared slot");
                let path = self.root.join(SHARED_SLOT);
                fs::create_dir_all(&path)
                    .with_context(|| format!("create shared slot {}", path.display()))?;
                Ok(CacheLease {
                    pool: Arc::clone(self),
                    kind: SlotKind::Shared,
                    path,
                })
            }
            (None, OverflowPolicy::Ephemeral) => {
                warn!(size = self.slots.len(), "cache pool exhausted, using ephemeral slot");
                self.ephemeral()
            }
        }
    }

    fn ephemeral(self: &Arc<Self>) -> Result<CacheLease> {
        loop {
            let path = self.root.join(format!("ephemeral-{}", generate_short_id()));
            match fs::create_dir(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "ephemeral cache slot created");
                    return Ok(CacheLease {
                        pool: Arc::clone(self),
                        kind: SlotKind::Ephemeral,
                        path,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create ephemeral slot {}", path.display()));
                }
            }
        }
    }

    fn release(&self, kind: SlotKind, path: &Path) {
        match kind {
            SlotKind::Pool(index) => {
                let mut busy = self.lock_or_recover();
                if let Some(slot) = busy.get_mut(index) {
                    *slot = false;
                }
                debug!(slot = index, "cache slot released");
            }
            SlotKind::Shared => {}
            SlotKind::Ephemeral => {
                if let Err(err) = fs::remove_dir_all(path) {
                    warn!(path = %path.display(), error = %err, "failed to delete ephemeral slot");
                }
            }
        }
    }

    /// Bookkeeping must be restored even if a worker panicked while leasing.
    fn lock_or_recover(&self) -> MutexGuard<'_, Vec<bool>> {
        match self.busy.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}

/// A leased cache directory; released on drop.
#[derive(Debug)]
pub struct CacheLease {
    pool: Arc<CachePool>,
    kind: SlotKind,
    path: PathBuf,
}

impl CacheLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.pool.release(self.kind, &self.path);
    }
}

pub(crate) fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_pool_hands_out_ephemeral_slots() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = CachePool::new(temp.path(), 0, OverflowPolicy::Ephemeral).expect("pool");
        let lease = pool.acquire().expect("acquire");
        assert_eq!(lease.kind(), SlotKind::Ephemeral);
        let path = lease.path().to_path_buf();
        assert!(path.is_dir());
        drop(lease);
        assert!(!path.exists());
    }

    #[test]
    fn shared_overflow_reuses_one_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = CachePool::new(temp.path(), 1, OverflowPolicy::Shared).expect("pool");
        let _held = pool.acquire().expect("acquire");
        let a = pool.acquire().expect("acquire");
        let b = pool.acquire().expect("acquire");
        assert_eq!(a.kind(), SlotKind::Shared);
        assert_eq!(a.path(), b.path());
        let shared = a.path().to_path_buf();
        drop(a);
        assert!(shared.is_dir());
    }

    #[test]
    fn released_pool_slot_keeps_its_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = CachePool::new(temp.path(), 1, OverflowPolicy::Ephemeral).expect("pool");
        let lease = pool.acquire().expect("acquire");
        fs::write(lease.path().join("cached.bin"), b"x").expect("write");
        let path = lease.path().to_path_buf();
        drop(lease);
        assert_eq!(pool.leased(), 0);
        assert!(path.join("cached.bin").exists());
    }
}
