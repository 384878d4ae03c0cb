use std::{
    fmt,
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Arc,
    },
};

use generational_arena::{Arena, Index};
use parking_lot::Mutex;

use crate::ids::InodeId;

pub type InodeRef = Arc<Inode>;

// === AsyncErrorSlot === //

/// Sticky write-back error for one open handle.
///
/// The first non-zero error wins until someone takes it; taking swaps in zero atomically, so a
/// recorded error is handed to exactly one taker.
#[derive(Debug, Default)]
pub struct AsyncErrorSlot(AtomicI32);

impl AsyncErrorSlot {
    pub fn record(&self, err: i32) {
        if err == 0 {
            return;
        }

        let _ = self
            .0
            .compare_exchange(0, err, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn take(&self) -> i32 {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub fn peek(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }
}

// === Inode === //

/// The slice of an inode that open handles depend on: its id, how many handles are open on it
/// and where to deliver write-back errors.
pub struct Inode {
    ino: InodeId,
    open_handles: AtomicUsize,
    error_slots: Mutex<Arena<Arc<AsyncErrorSlot>>>,
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("open_handles", &self.open_handle_count())
            .finish_non_exhaustive()
    }
}

impl Inode {
    pub fn new(ino: InodeId) -> InodeRef {
        Arc::new(Self {
            ino,
            open_handles: AtomicUsize::new(0),
            error_slots: Mutex::default(),
        })
    }

    pub fn ino(&self) -> InodeId {
        self.ino
    }

    pub fn open_handle_count(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    /// Delivers a failed write-back to every handle currently open on this inode, whichever
    /// handle the dirty data came through. Returns the number of handles notified.
    pub fn record_writeback_error(&self, err: i32) -> usize {
        if err == 0 {
            return 0;
        }

        let slots = self.error_slots.lock();
        for (_, slot) in slots.iter() {
            slot.record(err);
        }

        tracing::debug!(ino = %self.ino, err, handles = slots.len(), "Recorded write-back error");
        slots.len()
    }

    pub(crate) fn attach_handle(&self, slot: Arc<AsyncErrorSlot>) -> Index {
        let index = self.error_slots.lock().insert(slot);
        self.open_handles.fetch_add(1, Ordering::AcqRel);
        index
    }

    pub(crate) fn detach_handle(&self, index: Index) {
        let removed = self.error_slots.lock().remove(index);
        assert!(removed.is_some(), "{}: handle detached twice", self.ino);

        let prev = self.open_handles.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "{}: open handle count underflow", self.ino);
    }
}
