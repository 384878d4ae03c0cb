use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// An advisory lock granted by the metadata server.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FileLock {
    pub owner: u64,
    pub pid: u32,
    pub start: u64,
    /// Zero means "through end of file".
    pub length: u64,
    pub kind: LockKind,
}

/// Granted locks of one flavour (fcntl or flock) held through a handle.
///
/// Conflict detection belongs to the lock-request path; this only remembers what was granted so
/// close can tell the server what to drop.
#[derive(Debug, Default, Clone)]
pub struct LockTable {
    held: BTreeMap<(u64, u64), FileLock>,
}

impl LockTable {
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Records a grant, replacing any lock the same owner held at the same offset.
    pub fn insert(&mut self, lock: FileLock) -> Option<FileLock> {
        self.held.insert((lock.owner, lock.start), lock)
    }

    pub fn remove(&mut self, owner: u64, start: u64) -> Option<FileLock> {
        self.held.remove(&(owner, start))
    }

    pub fn remove_owner(&mut self, owner: u64) -> Vec<FileLock> {
        let keys = self
            .held
            .range((owner, 0)..=(owner, u64::MAX))
            .map(|(&key, _)| key)
            .collect::<Vec<_>>();

        keys.into_iter()
            .filter_map(|key| self.held.remove(&key))
            .collect()
    }

    pub fn held_by(&self, owner: u64) -> impl Iterator<Item = &FileLock> + '_ {
        self.held
            .range((owner, 0)..=(owner, u64::MAX))
            .map(|(_, lock)| lock)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileLock> + '_ {
        self.held.values()
    }

    pub fn drain(&mut self) -> Vec<FileLock> {
        std::mem::take(&mut self.held).into_values().collect()
    }
}
