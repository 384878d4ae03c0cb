use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    config::SessionConfig,
    id_list::IdList,
    ids::{CapId, ConnectionHandle, InodeId, MdsRank, Tid},
};

use super::{Session, SessionDump, SessionError, SessionRef};

// === SessionTracking === //

/// Per-session membership lists for caps, flushing inodes and requests.
///
/// The entities themselves live in the client core's arenas; these lists only hold their ids.
/// Nothing here is locked. Access goes through `&mut SessionTable`, so whatever lock the client
/// core wraps its table in is the lock that serializes these lists.
#[derive(Debug, Default)]
pub struct SessionTracking {
    pub caps: IdList<CapId>,
    pub flushing_caps: IdList<InodeId>,
    pub requests: IdList<Tid>,
    pub unsafe_requests: IdList<Tid>,
    pub flushing_cap_tids: BTreeSet<Tid>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct TrackingDump {
    pub caps: usize,
    pub flushing_caps: usize,
    pub requests: usize,
    pub unsafe_requests: usize,
    pub flushing_cap_tids: usize,
}

impl SessionTracking {
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
            && self.flushing_caps.is_empty()
            && self.requests.is_empty()
            && self.unsafe_requests.is_empty()
            && self.flushing_cap_tids.is_empty()
    }

    pub fn dump(&self) -> TrackingDump {
        TrackingDump {
            caps: self.caps.len(),
            flushing_caps: self.flushing_caps.len(),
            requests: self.requests.len(),
            unsafe_requests: self.unsafe_requests.len(),
            flushing_cap_tids: self.flushing_cap_tids.len(),
        }
    }
}

// === SessionTable === //

struct SessionSlot {
    session: SessionRef,
    tracking: SessionTracking,
}

/// Every session a client holds, keyed by rank.
///
/// The table is meant to live behind the client-wide lock; that is the lock the tracking lists
/// rely on.
pub struct SessionTable {
    config: Arc<SessionConfig>,
    slots: BTreeMap<MdsRank, SessionSlot>,
}

impl SessionTable {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
            slots: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ranks(&self) -> impl Iterator<Item = MdsRank> + '_ {
        self.slots.keys().copied()
    }

    /// Registers a session for a newly established connection. The table keeps the initial
    /// reference; release it with [`SessionTable::put_session`].
    pub fn open_session(
        &mut self,
        rank: MdsRank,
        con: ConnectionHandle,
        addrs: Vec<String>,
    ) -> Result<SessionRef, SessionError> {
        if self.slots.contains_key(&rank) {
            return Err(SessionError::AlreadyExists { rank });
        }

        let session = Arc::new(Session::new(rank, con, addrs, self.config.clone()));
        self.slots.insert(
            rank,
            SessionSlot {
                session: session.clone(),
                tracking: SessionTracking::default(),
            },
        );

        tracing::info!(%rank, %con, "Opening session");
        Ok(session)
    }

    /// Peeks at a session without taking a reference.
    pub fn session(&self, rank: MdsRank) -> Option<&SessionRef> {
        self.slots.get(&rank).map(|slot| &slot.session)
    }

    /// Takes a counted reference to a session.
    pub fn get_session(&self, rank: MdsRank) -> Option<SessionRef> {
        let slot = self.slots.get(&rank)?;
        slot.session.get();
        Some(slot.session.clone())
    }

    /// Drops a counted reference and returns how many remain. A session whose count reaches
    /// zero is finalized right away if nothing is tracked against it, otherwise on a later
    /// [`SessionTable::reap`].
    pub fn put_session(&mut self, rank: MdsRank) -> Option<usize> {
        let slot = self.slots.get(&rank)?;
        let remaining = slot.session.put();

        if remaining == 0 {
            if slot.tracking.is_empty() {
                self.finalize(rank);
            } else {
                tracing::debug!(
                    %rank,
                    tracking = ?slot.tracking.dump(),
                    "Deferring finalization of session with live members",
                );
            }
        }

        Some(remaining)
    }

    pub fn tracking(&self, rank: MdsRank) -> Option<&SessionTracking> {
        self.slots.get(&rank).map(|slot| &slot.tracking)
    }

    pub fn tracking_mut(&mut self, rank: MdsRank) -> Option<&mut SessionTracking> {
        self.slots.get_mut(&rank).map(|slot| &mut slot.tracking)
    }

    /// Finalizes every unreferenced session whose tracking lists have drained.
    pub fn reap(&mut self) -> Vec<MdsRank> {
        let doomed = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.session.ref_count() == 0 && slot.tracking.is_empty())
            .map(|(&rank, _)| rank)
            .collect::<Vec<_>>();

        for &rank in &doomed {
            self.finalize(rank);
        }

        doomed
    }

    pub fn dump(&self) -> Vec<SessionDump> {
        self.slots
            .values()
            .map(|slot| SessionDump {
                tracking: Some(slot.tracking.dump()),
                ..slot.session.dump()
            })
            .collect()
    }

    fn finalize(&mut self, rank: MdsRank) {
        if let Some(slot) = self.slots.remove(&rank) {
            tracing::info!(
                %rank,
                state = %slot.session.state(),
                "Finalized session",
            );
        }
    }
}
