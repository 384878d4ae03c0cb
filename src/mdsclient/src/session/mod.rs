use std::{
    error::Error,
    fmt, mem,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::SessionConfig,
    ids::{CapId, ConnectionHandle, InodeId, MdsRank},
    state_ref::{RwRef, RwRefState},
    util::FmtDebugUsingDisplay,
};

mod release;
mod state;
mod table;

pub use release::{CapReleaseBatch, CapReleaseItem, CapReleaseSink, SinkError};
pub use state::{ReclaimState, SessionState, SessionStatePolicy};
pub use table::{SessionTable, SessionTracking, TrackingDump};

use release::PendingReleases;

pub type SessionRef = Arc<Session>;

pub type OpenWaiter = Box<dyn FnOnce(Result<(), SessionError>) + Send>;

// === Errors === //

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("{rank}: invalid session transition {from} -> {to}")]
    InvalidTransition {
        rank: MdsRank,
        from: SessionState,
        to: SessionState,
    },

    #[error("{rank}: reclaim not possible while session is {state} and reclaim is {reclaim}")]
    InvalidReclaim {
        rank: MdsRank,
        state: SessionState,
        reclaim: ReclaimState,
    },

    #[error("{rank}: session was rejected by the metadata server")]
    Rejected { rank: MdsRank },

    #[error("{rank}: session is closed")]
    Closed { rank: MdsRank },

    #[error("{rank}: session is {state}, not open")]
    NotOpen { rank: MdsRank, state: SessionState },

    #[error("{rank}: a session for this rank already exists")]
    AlreadyExists { rank: MdsRank },

    #[error("{rank}: failed to hand capability releases to the transport")]
    Transport {
        rank: MdsRank,
        #[source]
        source: Arc<dyn Error + Send + Sync>,
    },
}

// === Session === //

/// The client's relationship with a single metadata server.
///
/// The session state doubles as the authoritative value of an [`RwRefState`] gate. Code that
/// needs the session to stay open for the duration of an operation enters the gate as a reader
/// through [`Session::enter_open`]; every state change is a writer entry so the network layer
/// can wait for those readers to drain before tearing down dependent state.
pub struct Session {
    rank: MdsRank,
    con: ConnectionHandle,
    addrs: Vec<String>,
    config: Arc<SessionConfig>,
    gate: RwRefState<SessionStatePolicy>,
    status: Mutex<Status>,
    releases: Mutex<PendingReleases>,
    flushing: Mutex<()>,
    refs: AtomicUsize,
    seq: AtomicU64,
}

struct Status {
    state: SessionState,
    reclaim: ReclaimState,
    mds_state: i32,
    mds_features: u64,
    readonly: bool,
    cap_gen: u64,
    cap_renew_seq: u64,
    cap_ttl: Option<Instant>,
    last_cap_renew_request: Option<Instant>,
    waiting_for_open: Vec<OpenWaiter>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.lock();

        f.debug_struct("Session")
            .field("rank", &self.rank)
            .field("con", &self.con)
            .field("state", &FmtDebugUsingDisplay(status.state))
            .field("reclaim", &FmtDebugUsingDisplay(status.reclaim))
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDump {
    pub rank: MdsRank,
    pub con: ConnectionHandle,
    pub addrs: Vec<String>,
    pub state: SessionState,
    pub reclaim_state: ReclaimState,
    pub mds_state: i32,
    pub readonly: bool,
    pub seq: u64,
    pub cap_gen: u64,
    pub cap_renew_seq: u64,
    pub pending_releases: usize,
    pub refs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackingDump>,
}

impl Session {
    /// Creates a session for a freshly established connection. It starts out `Opening` with one
    /// reference held by the caller.
    pub fn new(
        rank: MdsRank,
        con: ConnectionHandle,
        addrs: Vec<String>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            rank,
            con,
            addrs,
            config,
            gate: RwRefState::new(SessionState::Opening.code(), SessionStatePolicy),
            status: Mutex::new(Status {
                state: SessionState::Opening,
                reclaim: ReclaimState::None,
                mds_state: 0,
                mds_features: 0,
                readonly: false,
                cap_gen: 0,
                cap_renew_seq: 0,
                cap_ttl: None,
                last_cap_renew_request: None,
                waiting_for_open: Vec::new(),
            }),
            releases: Mutex::default(),
            flushing: Mutex::new(()),
            refs: AtomicUsize::new(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn rank(&self) -> MdsRank {
        self.rank
    }

    pub fn con(&self) -> ConnectionHandle {
        self.con
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().state
    }

    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    pub fn reclaim_state(&self) -> ReclaimState {
        self.status.lock().reclaim
    }

    // === Reference counting === //

    pub fn get(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one logical reference and returns how many remain. Whoever sees zero is responsible
    /// for finalizing the session (see [`SessionTable::put_session`]).
    pub fn put(&self) -> usize {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => panic!("{}: session reference count underflow", self.rank),
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    // === State machine === //

    /// Enters the session gate as a reader that requires the session to be open.
    pub fn enter_open(&self) -> RwRef<'_, SessionStatePolicy> {
        self.gate.read(SessionState::Open.code())
    }

    /// Moves the session to `to`.
    ///
    /// Re-entering the current state is accepted as a no-op whose transition reports
    /// `is_first_writer() == false`, which lets several threads report the same failure.
    pub fn transition(&self, to: SessionState) -> Result<SessionTransition<'_>, SessionError> {
        let mut status = self.status.lock();
        let from = status.state;

        if from == to {
            return Ok(SessionTransition {
                from,
                to,
                writer: self.gate.write(to.code()),
            });
        }

        if !from.can_transition_to(to) {
            tracing::warn!(rank = %self.rank, %from, %to, "Refusing invalid session transition");
            return Err(SessionError::InvalidTransition {
                rank: self.rank,
                from,
                to,
            });
        }

        let writer = self.gate.write(to.code());
        status.state = to;

        if from == SessionState::Open && to == SessionState::Stale {
            // Invalidates every cap issued under the previous generation.
            status.cap_gen += 1;
            status.cap_ttl = None;
        }

        if status.reclaim == ReclaimState::Reclaiming
            && matches!(
                to,
                SessionState::Stale
                    | SessionState::Rejected
                    | SessionState::Closing
                    | SessionState::Closed
            )
        {
            tracing::warn!(rank = %self.rank, %to, "Reclaim interrupted by session state change");
            status.reclaim = ReclaimState::ReclaimFail;
        }

        let outcome = match to {
            SessionState::Open => Some(Ok(())),
            SessionState::Rejected => Some(Err(SessionError::Rejected { rank: self.rank })),
            SessionState::Closed => Some(Err(SessionError::Closed { rank: self.rank })),
            _ => None,
        };
        let waiters = match outcome {
            Some(_) => mem::take(&mut status.waiting_for_open),
            None => Vec::new(),
        };

        if to == SessionState::Rejected {
            let dropped = self.releases.lock().take_all().0.len();
            if dropped > 0 {
                tracing::debug!(rank = %self.rank, dropped, "Dropped pending cap releases");
            }
        }

        drop(status);

        tracing::info!(rank = %self.rank, %from, %to, "Session state changed");

        if let Some(outcome) = outcome {
            for waiter in waiters {
                waiter(outcome.clone());
            }
        }

        Ok(SessionTransition { from, to, writer })
    }

    /// Runs `waiter` once the session opens, or with an error once it can no longer open.
    pub fn wait_for_open(&self, waiter: impl FnOnce(Result<(), SessionError>) + Send + 'static) {
        let mut status = self.status.lock();

        let outcome = match status.state {
            SessionState::Open => Ok(()),
            SessionState::Rejected => Err(SessionError::Rejected { rank: self.rank }),
            SessionState::Closing | SessionState::Closed => {
                Err(SessionError::Closed { rank: self.rank })
            }
            SessionState::New | SessionState::Opening | SessionState::Stale => {
                status.waiting_for_open.push(Box::new(waiter));
                return;
            }
        };

        drop(status);
        waiter(outcome);
    }

    // === Reclaim === //

    pub fn begin_reclaim(&self) -> Result<(), SessionError> {
        let mut status = self.status.lock();

        if !matches!(status.state, SessionState::Opening | SessionState::Open)
            || status.reclaim != ReclaimState::None
        {
            return Err(SessionError::InvalidReclaim {
                rank: self.rank,
                state: status.state,
                reclaim: status.reclaim,
            });
        }

        status.reclaim = ReclaimState::Reclaiming;
        tracing::debug!(rank = %self.rank, "Began client reclaim");
        Ok(())
    }

    pub fn finish_reclaim(&self, succeeded: bool) -> Result<ReclaimState, SessionError> {
        let mut status = self.status.lock();

        if status.reclaim != ReclaimState::Reclaiming {
            return Err(SessionError::InvalidReclaim {
                rank: self.rank,
                state: status.state,
                reclaim: status.reclaim,
            });
        }

        status.reclaim = if succeeded {
            ReclaimState::ReclaimOk
        } else {
            ReclaimState::ReclaimFail
        };

        tracing::debug!(rank = %self.rank, reclaim = %status.reclaim, "Finished client reclaim");
        Ok(status.reclaim)
    }

    // === Capability releases === //

    /// Queues a capability release for the next flush. A later release for the same inode
    /// replaces an unflushed earlier one.
    pub fn enqueue_cap_release(
        &self,
        ino: InodeId,
        cap_id: CapId,
        issue_seq: u32,
        migrate_seq: u32,
        osd_epoch_barrier: u32,
    ) -> Result<(), SessionError> {
        let status = self.status.lock();

        match status.state {
            SessionState::Rejected => return Err(SessionError::Rejected { rank: self.rank }),
            SessionState::Closed => return Err(SessionError::Closed { rank: self.rank }),
            _ => {}
        }

        let superseded = self.releases.lock().push(
            CapReleaseItem {
                ino,
                cap_id,
                issue_seq,
                migrate_seq,
            },
            osd_epoch_barrier,
        );
        drop(status);

        if superseded {
            tracing::trace!(rank = %self.rank, %ino, "Superseded pending cap release");
        }

        Ok(())
    }

    pub fn pending_cap_releases(&self) -> usize {
        self.releases.lock().len()
    }

    /// Takes the whole pending batch, regardless of session state.
    pub fn take_cap_releases(&self) -> Option<CapReleaseBatch> {
        let (items, osd_epoch_barrier) = self.releases.lock().take_all();

        (!items.is_empty()).then_some(CapReleaseBatch {
            rank: self.rank,
            items,
            osd_epoch_barrier,
        })
    }

    /// Hands pending releases to `sink` in messages of at most `max_caps_per_release` records.
    ///
    /// The session must be open; releases stay buffered otherwise. The release queue is not
    /// locked while the sink runs, so enqueues and state changes proceed during a slow send. If
    /// the sink fails, the records it did not accept stay pending. The sink must not flush this
    /// session itself.
    pub fn flush_cap_releases(&self, sink: &dyn CapReleaseSink) -> Result<usize, SessionError> {
        let open = self.enter_open();
        if !open.is_state_satisfied() {
            return Err(SessionError::NotOpen {
                rank: self.rank,
                state: self.state(),
            });
        }

        // Concurrent flushers would hand out the same records twice.
        let _flushing = self.flushing.lock();

        let max = self.config.max_caps_per_release.max(1);
        let mut sent = 0;

        loop {
            let (items, osd_epoch_barrier) = {
                let pending = self.releases.lock();
                (pending.peek(max), pending.osd_epoch_barrier())
            };

            if items.is_empty() {
                break;
            }

            sink.send_cap_release(CapReleaseBatch {
                rank: self.rank,
                items: items.clone(),
                osd_epoch_barrier,
            })
            .map_err(|err| {
                tracing::error!(rank = %self.rank, "Failed to send cap release: {err}");
                SessionError::Transport {
                    rank: self.rank,
                    source: Arc::from(err),
                }
            })?;

            self.releases.lock().remove_sent(&items);
            sent += items.len();
        }

        if sent > 0 {
            tracing::debug!(rank = %self.rank, sent, "Flushed cap releases");
        }

        Ok(sent)
    }

    // === Capability leases === //

    pub fn cap_gen(&self) -> u64 {
        self.status.lock().cap_gen
    }

    pub fn cap_renew_seq(&self) -> u64 {
        self.status.lock().cap_renew_seq
    }

    pub fn cap_ttl(&self) -> Option<Instant> {
        self.status.lock().cap_ttl
    }

    pub fn last_cap_renew_request(&self) -> Option<Instant> {
        self.status.lock().last_cap_renew_request
    }

    /// Records that a renewal request is about to be sent and returns its sequence number.
    pub fn note_cap_renew_request(&self, now: Instant) -> u64 {
        let mut status = self.status.lock();
        status.last_cap_renew_request = Some(now);
        status.cap_renew_seq += 1;
        status.cap_renew_seq
    }

    /// Handles the server's renewal acknowledgement. Returns `true` if the caps had expired
    /// before this renewal, in which case waiters on those caps need a kick.
    pub fn handle_cap_renew_ack(&self, seq: u64, now: Instant) -> bool {
        let mut status = self.status.lock();

        if seq != status.cap_renew_seq {
            tracing::debug!(
                rank = %self.rank,
                seq,
                expected = status.cap_renew_seq,
                "Ignoring out-of-date cap renewal ack",
            );
            return false;
        }

        let Some(requested) = status.last_cap_renew_request else {
            return false;
        };

        let was_stale = !status.cap_ttl.is_some_and(|ttl| now < ttl);

        let Some(ttl) = requested.checked_add(self.config.session_timeout) else {
            tracing::warn!(
                rank = %self.rank,
                timeout = ?self.config.session_timeout,
                "Session timeout overflows the clock; leaving caps unrenewed",
            );
            return was_stale;
        };

        status.cap_ttl = Some(ttl);
        was_stale
    }

    /// Whether `renew_interval` has passed since the last renewal request, or none was ever sent.
    pub fn cap_renew_due(&self, now: Instant) -> bool {
        let status = self.status.lock();

        match status.last_cap_renew_request {
            Some(requested) => requested
                .checked_add(self.config.renew_interval)
                .is_some_and(|due| now >= due),
            None => true,
        }
    }

    pub fn caps_valid(&self, cap_gen: u64, now: Instant) -> bool {
        let status = self.status.lock();
        cap_gen == status.cap_gen && status.cap_ttl.is_some_and(|ttl| now < ttl)
    }

    // === Misc bookkeeping === //

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Counts one more message received from the server and returns the new sequence.
    pub fn bump_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn mds_state(&self) -> i32 {
        self.status.lock().mds_state
    }

    pub fn set_mds_state(&self, mds_state: i32) {
        self.status.lock().mds_state = mds_state;
    }

    pub fn mds_features(&self) -> u64 {
        self.status.lock().mds_features
    }

    pub fn set_mds_features(&self, features: u64) {
        self.status.lock().mds_features = features;
    }

    pub fn is_readonly(&self) -> bool {
        self.status.lock().readonly
    }

    pub fn set_readonly(&self) {
        self.status.lock().readonly = true;
    }

    pub fn dump(&self) -> SessionDump {
        let status = self.status.lock();

        SessionDump {
            rank: self.rank,
            con: self.con,
            addrs: self.addrs.clone(),
            state: status.state,
            reclaim_state: status.reclaim,
            mds_state: status.mds_state,
            readonly: status.readonly,
            seq: self.seq(),
            cap_gen: status.cap_gen,
            cap_renew_seq: status.cap_renew_seq,
            pending_releases: self.releases.lock().len(),
            refs: self.ref_count(),
            tracking: None,
        }
    }
}

// === SessionTransition === //

/// The writer side of a state change, handed back so the caller can wait out readers that
/// entered while the previous state was authoritative.
#[derive(Debug)]
#[must_use]
pub struct SessionTransition<'a> {
    from: SessionState,
    to: SessionState,
    writer: RwRef<'a, SessionStatePolicy>,
}

impl SessionTransition<'_> {
    pub fn from(&self) -> SessionState {
        self.from
    }

    pub fn to(&self) -> SessionState {
        self.to
    }

    pub fn is_first_writer(&self) -> bool {
        self.writer.is_first_writer()
    }

    pub fn wait_for_readers_drained(&self) {
        self.writer.wait_for_readers_drained();
    }
}

// === Tests === //

#[cfg(all(test, not(loom)))]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;

    fn session() -> Session {
        session_with(SessionConfig::default())
    }

    fn session_with(config: SessionConfig) -> Session {
        Session::new(
            MdsRank(0),
            ConnectionHandle(7),
            vec!["10.0.0.1:6800".to_owned()],
            Arc::new(config),
        )
    }

    fn open_session() -> Session {
        let session = session();
        let _ = session.transition(SessionState::Open).unwrap();
        session
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<CapReleaseBatch>>,
        fail_after: Option<usize>,
    }

    impl CapReleaseSink for RecordingSink {
        fn send_cap_release(&self, batch: CapReleaseBatch) -> Result<(), SinkError> {
            let mut batches = self.batches.lock();
            if self.fail_after.is_some_and(|limit| batches.len() >= limit) {
                return Err("connection reset".into());
            }
            batches.push(batch);
            Ok(())
        }
    }

    struct BlockingSink {
        entered: crossbeam_channel::Sender<()>,
        proceed: crossbeam_channel::Receiver<()>,
        batches: Mutex<Vec<CapReleaseBatch>>,
    }

    impl CapReleaseSink for BlockingSink {
        fn send_cap_release(&self, batch: CapReleaseBatch) -> Result<(), SinkError> {
            self.entered.send(())?;
            self.proceed.recv()?;
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    struct RejectingSink<'a> {
        session: &'a Session,
        sent: AtomicUsize,
    }

    impl CapReleaseSink for RejectingSink<'_> {
        fn send_cap_release(&self, batch: CapReleaseBatch) -> Result<(), SinkError> {
            let _ = self.session.transition(SessionState::Rejected)?;
            self.sent.fetch_add(batch.items.len(), Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn starts_opening_with_one_ref() {
        let session = session();

        assert_eq!(session.state(), SessionState::Opening);
        assert_eq!(session.state_name(), "opening");
        assert_eq!(session.reclaim_state(), ReclaimState::None);
        assert_eq!(session.ref_count(), 1);
    }

    #[test]
    fn stale_round_trip_bumps_cap_gen() {
        let session = open_session();
        let now = Instant::now();

        let seq = session.note_cap_renew_request(now);
        session.handle_cap_renew_ack(seq, now);
        assert!(session.caps_valid(0, now));

        let _ = session.transition(SessionState::Stale).unwrap();
        assert_eq!(session.cap_gen(), 1);
        assert!(!session.caps_valid(0, now));

        let _ = session.transition(SessionState::Open).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.cap_gen(), 1);
    }

    #[test]
    fn invalid_transitions_leave_state_alone() {
        let session = session();

        let err = session.transition(SessionState::Closed).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                from: SessionState::Opening,
                to: SessionState::Closed,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Opening);
    }

    #[test]
    fn closed_is_terminal() {
        let session = open_session();
        let _ = session.transition(SessionState::Closing).unwrap();
        let _ = session.transition(SessionState::Closed).unwrap();

        for to in [
            SessionState::Open,
            SessionState::Opening,
            SessionState::Stale,
            SessionState::Rejected,
        ] {
            assert!(session.transition(to).is_err());
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn repeated_failure_reports_have_one_first_writer() {
        let session = open_session();

        let first = session.transition(SessionState::Stale).unwrap();
        let second = session.transition(SessionState::Stale).unwrap();

        assert!(first.is_first_writer());
        assert!(!second.is_first_writer());
        assert_eq!(session.cap_gen(), 1);
    }

    #[test]
    fn rejected_session_refuses_releases() {
        let session = open_session();
        session
            .enqueue_cap_release(InodeId(1), CapId(1), 1, 0, 0)
            .unwrap();

        let _ = session.transition(SessionState::Rejected).unwrap();
        assert_eq!(session.pending_cap_releases(), 0);

        let err = session
            .enqueue_cap_release(InodeId(2), CapId(2), 1, 0, 0)
            .unwrap_err();
        assert!(matches!(err, SessionError::Rejected { .. }));
        assert_eq!(session.pending_cap_releases(), 0);
        assert!(session.take_cap_releases().is_none());
    }

    #[test]
    fn closed_session_refuses_releases() {
        let session = open_session();
        let _ = session.transition(SessionState::Closing).unwrap();
        session
            .enqueue_cap_release(InodeId(1), CapId(1), 1, 0, 0)
            .unwrap();
        let _ = session.transition(SessionState::Closed).unwrap();

        assert!(matches!(
            session.enqueue_cap_release(InodeId(2), CapId(2), 1, 0, 0),
            Err(SessionError::Closed { .. })
        ));
    }

    #[test]
    fn open_flush_delivers_one_record_per_inode() {
        let session = session();
        let _ = session.transition(SessionState::Open).unwrap();

        session
            .enqueue_cap_release(InodeId(10), CapId(1), 4, 0, 0)
            .unwrap();
        session
            .enqueue_cap_release(InodeId(20), CapId(2), 9, 1, 12)
            .unwrap();

        let sink = RecordingSink::default();
        assert_eq!(session.flush_cap_releases(&sink).unwrap(), 2);

        let batches = sink.batches.into_inner();
        assert_eq!(batches.len(), 1);

        let batch = &batches[0];
        assert_eq!(batch.rank, MdsRank(0));
        assert_eq!(batch.osd_epoch_barrier, 12);
        assert_eq!(
            batch.items.iter().map(|item| item.ino).collect::<Vec<_>>(),
            [InodeId(10), InodeId(20)]
        );
        assert_eq!(session.pending_cap_releases(), 0);
    }

    #[test]
    fn superseded_release_keeps_latest_values() {
        let session = open_session();

        session
            .enqueue_cap_release(InodeId(10), CapId(1), 1, 0, 0)
            .unwrap();
        session
            .enqueue_cap_release(InodeId(20), CapId(2), 1, 0, 0)
            .unwrap();
        session
            .enqueue_cap_release(InodeId(10), CapId(3), 5, 2, 0)
            .unwrap();

        let batch = session.take_cap_releases().unwrap();
        assert_eq!(
            batch.items,
            [
                CapReleaseItem {
                    ino: InodeId(20),
                    cap_id: CapId(2),
                    issue_seq: 1,
                    migrate_seq: 0,
                },
                CapReleaseItem {
                    ino: InodeId(10),
                    cap_id: CapId(3),
                    issue_seq: 5,
                    migrate_seq: 2,
                },
            ]
        );
    }

    #[test]
    fn flush_splits_and_survives_transport_failure() {
        let session = session_with(SessionConfig {
            max_caps_per_release: 2,
            ..SessionConfig::default()
        });
        let _ = session.transition(SessionState::Open).unwrap();

        for ino in 1..=5 {
            session
                .enqueue_cap_release(InodeId(ino), CapId(ino), 1, 0, 0)
                .unwrap();
        }

        let failing = RecordingSink {
            fail_after: Some(1),
            ..RecordingSink::default()
        };
        assert!(matches!(
            session.flush_cap_releases(&failing),
            Err(SessionError::Transport { .. })
        ));
        assert_eq!(failing.batches.lock().len(), 1);
        assert_eq!(session.pending_cap_releases(), 3);

        let sink = RecordingSink::default();
        assert_eq!(session.flush_cap_releases(&sink).unwrap(), 3);

        let sizes = sink
            .batches
            .lock()
            .iter()
            .map(|batch| batch.items.len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, [2, 1]);
    }

    #[test]
    fn slow_sink_does_not_stall_other_callers() {
        let session = open_session();
        session
            .enqueue_cap_release(InodeId(1), CapId(1), 1, 0, 0)
            .unwrap();

        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (proceed_tx, proceed_rx) = crossbeam_channel::unbounded();
        let sink = BlockingSink {
            entered: entered_tx,
            proceed: proceed_rx,
            batches: Mutex::default(),
        };

        thread::scope(|s| {
            let (session, sink) = (&session, &sink);
            let flusher = s.spawn(move || session.flush_cap_releases(sink));
            entered_rx.recv().unwrap();

            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            s.spawn(move || {
                session
                    .enqueue_cap_release(InodeId(2), CapId(2), 1, 0, 0)
                    .unwrap();
                session
                    .enqueue_cap_release(InodeId(1), CapId(3), 2, 0, 0)
                    .unwrap();
                done_tx.send(session.state()).unwrap();
            });

            let state = done_rx.recv_timeout(Duration::from_secs(5));
            for _ in 0..2 {
                proceed_tx.send(()).unwrap();
            }
            assert_eq!(state, Ok(SessionState::Open));

            assert_eq!(flusher.join().unwrap().unwrap(), 3);
        });

        // The record superseded mid-send went out again with its new values.
        let batches = sink.batches.into_inner();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].items[0].cap_id, CapId(1));
        assert_eq!(
            batches[1]
                .items
                .iter()
                .map(|item| (item.ino, item.cap_id))
                .collect::<Vec<_>>(),
            [(InodeId(2), CapId(2)), (InodeId(1), CapId(3))]
        );
        assert_eq!(session.pending_cap_releases(), 0);
    }

    #[test]
    fn sink_may_reject_the_session() {
        let session = open_session();
        session
            .enqueue_cap_release(InodeId(1), CapId(1), 1, 0, 0)
            .unwrap();

        let sink = RejectingSink {
            session: &session,
            sent: AtomicUsize::new(0),
        };

        assert_eq!(session.flush_cap_releases(&sink).unwrap(), 1);
        assert_eq!(sink.sent.load(Ordering::Relaxed), 1);
        assert_eq!(session.state(), SessionState::Rejected);
        assert_eq!(session.pending_cap_releases(), 0);
    }

    #[test]
    fn flush_requires_open_session() {
        let session = session();
        session
            .enqueue_cap_release(InodeId(1), CapId(1), 1, 0, 0)
            .unwrap();

        let sink = RecordingSink::default();
        assert!(matches!(
            session.flush_cap_releases(&sink),
            Err(SessionError::NotOpen {
                state: SessionState::Opening,
                ..
            })
        ));
        assert_eq!(session.pending_cap_releases(), 1);
        assert!(sink.batches.lock().is_empty());
    }

    #[test]
    fn concurrent_enqueues_are_all_kept() {
        let session = open_session();

        thread::scope(|s| {
            for worker in 0..8u64 {
                let session = &session;
                s.spawn(move || {
                    for i in 0..32 {
                        let ino = InodeId(worker * 100 + i);
                        session
                            .enqueue_cap_release(ino, CapId(ino.0), 1, 0, 0)
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(session.pending_cap_releases(), 8 * 32);
    }

    #[test]
    fn open_waiters_are_resolved() {
        let session = session();
        let opened = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let opened = opened.clone();
            session.wait_for_open(move |res| {
                assert!(res.is_ok());
                opened.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(opened.load(Ordering::Relaxed), 0);

        let _ = session.transition(SessionState::Open).unwrap();
        assert_eq!(opened.load(Ordering::Relaxed), 2);

        let immediate = opened.clone();
        session.wait_for_open(move |res| {
            assert!(res.is_ok());
            immediate.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(opened.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn open_waiters_fail_on_reject() {
        let session = session();
        let failed = Arc::new(AtomicBool::new(false));

        session.wait_for_open({
            let failed = failed.clone();
            move |res| {
                assert!(matches!(res, Err(SessionError::Rejected { .. })));
                failed.store(true, Ordering::Relaxed);
            }
        });

        let _ = session.transition(SessionState::Rejected).unwrap();
        assert!(failed.load(Ordering::Relaxed));
    }

    #[test]
    fn reclaim_only_while_opening_or_open() {
        let session = session();
        session.begin_reclaim().unwrap();
        assert!(session.begin_reclaim().is_err());
        assert_eq!(session.finish_reclaim(true).unwrap(), ReclaimState::ReclaimOk);
        assert!(session.finish_reclaim(true).is_err());

        let stale = open_session();
        let _ = stale.transition(SessionState::Stale).unwrap();
        assert!(matches!(
            stale.begin_reclaim(),
            Err(SessionError::InvalidReclaim {
                state: SessionState::Stale,
                reclaim: ReclaimState::None,
                ..
            })
        ));
    }

    #[test]
    fn stale_during_reclaim_fails_it() {
        let session = open_session();
        session.begin_reclaim().unwrap();

        let _ = session.transition(SessionState::Stale).unwrap();
        assert_eq!(session.reclaim_state(), ReclaimState::ReclaimFail);
        assert!(session.finish_reclaim(true).is_err());

        // Reclaim state is independent of reconnection.
        let _ = session.transition(SessionState::Open).unwrap();
        assert_eq!(session.reclaim_state(), ReclaimState::ReclaimFail);
    }

    #[test]
    fn leaving_while_reclaiming_fails_reclaim() {
        let rejected = open_session();
        rejected.begin_reclaim().unwrap();
        let _ = rejected.transition(SessionState::Rejected).unwrap();
        assert_eq!(rejected.reclaim_state(), ReclaimState::ReclaimFail);

        let opening = session();
        opening.begin_reclaim().unwrap();
        let _ = opening.transition(SessionState::Rejected).unwrap();
        assert_eq!(opening.reclaim_state(), ReclaimState::ReclaimFail);

        let closing = open_session();
        closing.begin_reclaim().unwrap();
        let _ = closing.transition(SessionState::Closing).unwrap();
        assert_eq!(closing.reclaim_state(), ReclaimState::ReclaimFail);

        // Closed is only reachable through Closing, which already failed the reclaim.
        let _ = closing.transition(SessionState::Closed).unwrap();
        assert_eq!(closing.reclaim_state(), ReclaimState::ReclaimFail);
        assert!(closing.begin_reclaim().is_err());
    }

    #[test]
    fn finished_reclaim_survives_state_changes() {
        let session = open_session();
        session.begin_reclaim().unwrap();
        session.finish_reclaim(true).unwrap();

        let _ = session.transition(SessionState::Closing).unwrap();
        let _ = session.transition(SessionState::Closed).unwrap();
        assert_eq!(session.reclaim_state(), ReclaimState::ReclaimOk);
    }

    #[test]
    fn renewal_falls_due_after_interval() {
        let session = open_session();
        let t0 = Instant::now();

        assert!(session.cap_renew_due(t0));
        session.note_cap_renew_request(t0);
        assert!(!session.cap_renew_due(t0 + Duration::from_secs(19)));
        assert!(session.cap_renew_due(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn oversized_timeout_leaves_caps_unrenewed() {
        let session = session_with(SessionConfig {
            session_timeout: Duration::MAX,
            renew_interval: Duration::MAX,
            ..SessionConfig::default()
        });
        let _ = session.transition(SessionState::Open).unwrap();
        let now = Instant::now();

        let seq = session.note_cap_renew_request(now);
        assert!(session.handle_cap_renew_ack(seq, now));
        assert_eq!(session.cap_ttl(), None);
        assert!(!session.caps_valid(0, now));
        assert!(!session.cap_renew_due(now + Duration::from_secs(3600)));
    }

    #[test]
    fn renew_ack_extends_ttl() {
        let session = open_session();
        let t0 = Instant::now();

        let stale_seq = session.note_cap_renew_request(t0);
        let seq = session.note_cap_renew_request(t0);
        assert_eq!(seq, stale_seq + 1);

        assert!(!session.handle_cap_renew_ack(stale_seq, t0));
        assert_eq!(session.cap_ttl(), None);

        assert!(session.handle_cap_renew_ack(seq, t0));
        assert_eq!(session.cap_ttl(), Some(t0 + Duration::from_secs(60)));
        assert!(session.caps_valid(0, t0 + Duration::from_secs(59)));
        assert!(!session.caps_valid(0, t0 + Duration::from_secs(60)));

        assert!(!session.handle_cap_renew_ack(seq, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn get_put_report_remaining() {
        let session = session();

        assert_eq!(session.get(), 2);
        assert_eq!(session.put(), 1);
        assert_eq!(session.put(), 0);
    }

    #[test]
    #[should_panic(expected = "session reference count underflow")]
    fn put_underflow_is_fatal() {
        let session = session();
        session.put();
        session.put();
    }

    #[test]
    fn transition_waits_for_open_readers() {
        let session = open_session();
        let entered = Barrier::new(2);
        let reader_done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                let reader = session.enter_open();
                assert!(reader.is_state_satisfied());
                entered.wait();

                thread::sleep(Duration::from_millis(20));
                reader_done.store(true, Ordering::Release);
            });

            entered.wait();

            let transition = session.transition(SessionState::Stale).unwrap();
            assert!(!session.enter_open().is_state_satisfied());

            transition.wait_for_readers_drained();
            assert!(reader_done.load(Ordering::Acquire));
        });
    }

    #[test]
    fn dump_serializes() {
        let session = open_session();
        session.bump_seq();
        session.set_mds_state(13);

        let json = serde_json::to_value(session.dump()).unwrap();
        assert_eq!(json["rank"], 0);
        assert_eq!(json["state"], "open");
        assert_eq!(json["reclaim_state"], "none");
        assert_eq!(json["seq"], 1);
        assert_eq!(json["mds_state"], 13);
        assert!(json.get("tracking").is_none());
    }
}
