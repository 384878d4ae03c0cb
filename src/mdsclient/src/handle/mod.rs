use std::{fmt, sync::Arc};

use bitflags::bitflags;
use generational_arena::Index;
use parking_lot::Mutex;

use crate::{
    ids::MdsRank,
    inode::{AsyncErrorSlot, InodeRef},
};

mod cursor;
mod locks;

pub use cursor::{Cursor, CursorGuard};
pub use locks::{FileLock, LockKind, LockTable};

pub type HandleRef = Arc<OpenHandle>;

// === Flags === //

bitflags! {
    /// `open(2)` flags as passed by the caller. Read-only is the absence of both access bits.
    #[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const NONBLOCK = 0o4000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW = 0o400000;
    }

    #[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
    pub struct FileMode: u32 {
        const READ = 1;
        const WRITE = 2;
        const LAZY = 4;
    }
}

impl FileMode {
    pub fn from_open_flags(flags: OpenFlags) -> Self {
        if flags.contains(OpenFlags::RDWR) {
            Self::READ | Self::WRITE
        } else if flags.contains(OpenFlags::WRONLY) {
            Self::WRITE
        } else {
            Self::READ
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct UserPerm {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl UserPerm {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

// === OpenHandle === //

#[derive(Debug, Default)]
struct FileLocks {
    fcntl: Option<Box<LockTable>>,
    flock: Option<Box<LockTable>>,
}

impl FileLocks {
    fn any_held(&self) -> bool {
        [&self.fcntl, &self.flock]
            .into_iter()
            .flatten()
            .any(|table| !table.is_empty())
    }
}

/// One open of a file.
///
/// Positional I/O through the handle is serialized by its [`Cursor`]. Write-back errors for the
/// inode land in the handle's async-error slot and stay there until someone takes them.
pub struct OpenHandle {
    inode: InodeRef,
    perms: UserPerm,
    flags: OpenFlags,
    mode: FileMode,
    gen: u64,
    mds: MdsRank,
    cursor: Cursor,
    locks: Mutex<FileLocks>,
    async_error: Arc<AsyncErrorSlot>,
    error_slot: Index,
}

impl fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenHandle")
            .field("ino", &self.inode.ino())
            .field("flags", &self.flags)
            .field("mode", &self.mode)
            .field("gen", &self.gen)
            .field("mds", &self.mds)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl OpenHandle {
    pub fn open(
        inode: InodeRef,
        flags: OpenFlags,
        mode: FileMode,
        gen: u64,
        perms: UserPerm,
        mds: MdsRank,
    ) -> HandleRef {
        let async_error = Arc::new(AsyncErrorSlot::default());
        let error_slot = inode.attach_handle(async_error.clone());

        tracing::debug!(
            ino = %inode.ino(),
            ?flags,
            ?mode,
            %mds,
            open_handles = inode.open_handle_count(),
            "Opened handle",
        );

        Arc::new(Self {
            inode,
            perms,
            flags,
            mode,
            gen,
            mds,
            cursor: Cursor::default(),
            locks: Mutex::default(),
            async_error,
            error_slot,
        })
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    pub fn perms(&self) -> &UserPerm {
        &self.perms
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn gen(&self) -> u64 {
        self.gen
    }

    pub fn mds(&self) -> MdsRank {
        self.mds
    }

    // === Cursor === //

    /// Waits in line for the file position. Callers are served in the order they arrived.
    pub fn lock_cursor(&self) -> CursorGuard<'_> {
        self.cursor.lock()
    }

    pub fn cursor_waiters(&self) -> u64 {
        self.cursor.waiters()
    }

    pub fn is_cursor_locked(&self) -> bool {
        self.cursor.is_locked()
    }

    pub fn position(&self) -> i64 {
        self.cursor.position()
    }

    // === Advisory locks === //

    pub fn has_any_file_locks(&self) -> bool {
        self.locks.lock().any_held()
    }

    pub fn with_fcntl_locks<R>(&self, f: impl FnOnce(&mut LockTable) -> R) -> R {
        f(self.locks.lock().fcntl.get_or_insert_with(Box::default))
    }

    pub fn with_flock_locks<R>(&self, f: impl FnOnce(&mut LockTable) -> R) -> R {
        f(self.locks.lock().flock.get_or_insert_with(Box::default))
    }

    /// Drops both lock tables and returns everything they held so the caller can unlock it on
    /// the server.
    pub fn release_file_locks(&self) -> Vec<FileLock> {
        let mut locks = self.locks.lock();
        let tables = [locks.fcntl.take(), locks.flock.take()];

        tables
            .into_iter()
            .flatten()
            .flat_map(|mut table| table.drain())
            .collect()
    }

    // === Async errors === //

    pub fn record_async_error(&self, err: i32) {
        self.async_error.record(err);
    }

    /// Returns the pending write-back error, if any, and clears it.
    pub fn take_async_error(&self) -> i32 {
        self.async_error.take()
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        let locks = self.locks.get_mut();
        if locks.any_held() {
            tracing::warn!(
                ino = %self.inode.ino(),
                "Closing handle that still holds advisory locks",
            );
        }

        self.inode.detach_handle(self.error_slot);
    }
}
