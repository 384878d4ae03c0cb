use std::error::Error;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    id_list::IdList,
    ids::{CapId, InodeId, MdsRank},
};

pub type SinkError = Box<dyn Error + Send + Sync>;

/// One capability the client is giving back to a metadata server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct CapReleaseItem {
    pub ino: InodeId,
    pub cap_id: CapId,
    pub issue_seq: u32,
    pub migrate_seq: u32,
}

/// A release message's worth of records, handed to the network layer for encoding.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CapReleaseBatch {
    pub rank: MdsRank,
    pub items: Vec<CapReleaseItem>,
    pub osd_epoch_barrier: u32,
}

/// Consumer of pending release batches, normally the session's outgoing message queue.
pub trait CapReleaseSink {
    fn send_cap_release(&self, batch: CapReleaseBatch) -> Result<(), SinkError>;
}

impl CapReleaseSink for crossbeam_channel::Sender<CapReleaseBatch> {
    fn send_cap_release(&self, batch: CapReleaseBatch) -> Result<(), SinkError> {
        self.send(batch).map_err(|err| err.to_string().into())
    }
}

// === PendingReleases === //

/// Unflushed release records, at most one per inode, in enqueue order.
#[derive(Debug, Default)]
pub(crate) struct PendingReleases {
    order: IdList<InodeId>,
    items: FxHashMap<InodeId, CapReleaseItem>,
    osd_epoch_barrier: u32,
}

impl PendingReleases {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns `true` if an earlier unflushed record for the same inode was superseded.
    pub fn push(&mut self, item: CapReleaseItem, osd_epoch_barrier: u32) -> bool {
        let superseded = self.order.remove(&item.ino);
        self.order.push_back(item.ino);
        self.items.insert(item.ino, item);
        self.osd_epoch_barrier = self.osd_epoch_barrier.max(osd_epoch_barrier);
        superseded
    }

    pub fn osd_epoch_barrier(&self) -> u32 {
        self.osd_epoch_barrier
    }

    /// Records in enqueue order, oldest first, without removing them.
    pub fn peek(&self, max: usize) -> Vec<CapReleaseItem> {
        self.order
            .iter()
            .take(max)
            .map(|ino| self.items[&ino])
            .collect()
    }

    /// Drops records that were handed to the transport. A record superseded while it was in
    /// flight is kept, since the transport only saw the older values.
    pub fn remove_sent(&mut self, sent: &[CapReleaseItem]) -> usize {
        let mut removed = 0;

        for item in sent {
            if self.items.get(&item.ino) == Some(item) {
                self.items.remove(&item.ino);
                self.order.remove(&item.ino);
                removed += 1;
            }
        }

        if self.is_empty() {
            self.osd_epoch_barrier = 0;
        }

        removed
    }

    pub fn take_all(&mut self) -> (Vec<CapReleaseItem>, u32) {
        let items = self.peek(self.len());
        let barrier = self.osd_epoch_barrier;
        self.clear();
        (items, barrier)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.items.clear();
        self.osd_epoch_barrier = 0;
    }
}
