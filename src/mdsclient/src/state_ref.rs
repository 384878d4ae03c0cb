use std::fmt;

use derive_where::derive_where;

use crate::sync::{Condvar, Mutex};

// === StatePolicy === //

/// Decides what a state value means for a particular [`RwRefState`].
///
/// `check_state` answers "may a reader that requires `required` proceed while the authoritative
/// state is `current`?". Writers use the same predicate to find out whether they are the first
/// to move away from a compatible state.
pub trait StatePolicy: Send + Sync {
    fn is_valid_state(&self, state: i64) -> bool;

    fn check_state(&self, current: i64, required: i64) -> bool;
}

/// Readers are satisfied only by an exact match, e.g. an epoch or a session state code.
#[derive(Debug, Copy, Clone, Default)]
pub struct EqualState;

impl StatePolicy for EqualState {
    fn is_valid_state(&self, _state: i64) -> bool {
        true
    }

    fn check_state(&self, current: i64, required: i64) -> bool {
        current == required
    }
}

/// Monotonic generations: a reader that needs generation `n` is happy with anything newer.
#[derive(Debug, Copy, Clone, Default)]
pub struct AtLeastState;

impl StatePolicy for AtLeastState {
    fn is_valid_state(&self, state: i64) -> bool {
        state >= 0
    }

    fn check_state(&self, current: i64, required: i64) -> bool {
        current >= required
    }
}

/// Ad-hoc policy built from a pair of closures.
#[derive(Clone)]
pub struct FnPolicy<V, C> {
    valid: V,
    check: C,
}

impl<V, C> FnPolicy<V, C>
where
    V: Fn(i64) -> bool + Send + Sync,
    C: Fn(i64, i64) -> bool + Send + Sync,
{
    pub fn new(valid: V, check: C) -> Self {
        Self { valid, check }
    }
}

impl<V, C> fmt::Debug for FnPolicy<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPolicy").finish_non_exhaustive()
    }
}

impl<V, C> StatePolicy for FnPolicy<V, C>
where
    V: Fn(i64) -> bool + Send + Sync,
    C: Fn(i64, i64) -> bool + Send + Sync,
{
    fn is_valid_state(&self, state: i64) -> bool {
        (self.valid)(state)
    }

    fn check_state(&self, current: i64, required: i64) -> bool {
        (self.check)(current, required)
    }
}

// === RwRefState === //

/// Shared, versioned state that readers validate against and writers replace.
pub struct RwRefState<P: StatePolicy> {
    shared: Mutex<Shared>,
    drained: Condvar,
    policy: P,
}

#[derive(Debug)]
struct Shared {
    state: i64,
    reader_count: u64,
}

impl<P: StatePolicy> fmt::Debug for RwRefState<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();

        f.debug_struct("RwRefState")
            .field("state", &shared.state)
            .field("reader_count", &shared.reader_count)
            .finish_non_exhaustive()
    }
}

impl<P: StatePolicy> RwRefState<P> {
    pub fn new(initial: i64, policy: P) -> Self {
        assert!(
            policy.is_valid_state(initial),
            "invalid initial state {initial}"
        );

        Self {
            shared: Mutex::new(Shared {
                state: initial,
                reader_count: 0,
            }),
            drained: Condvar::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn state(&self) -> i64 {
        self.shared.lock().state
    }

    pub fn reader_count(&self) -> u64 {
        self.shared.lock().reader_count
    }

    pub fn read(&self, required: i64) -> RwRef<'_, P> {
        RwRef::enter_as_reader(self, required)
    }

    pub fn write(&self, required: i64) -> RwRef<'_, P> {
        RwRef::enter_as_writer(self, required)
    }
}

// === RwRef === //

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Reader,
    Writer,
}

/// A scoped reader or writer token on an [`RwRefState`].
///
/// A reader that was not satisfied holds no interest and may simply be dropped. A writer never
/// blocks on construction; call [`RwRef::wait_for_readers_drained`] before doing anything that
/// assumes no readers remain.
#[derive_where(Debug)]
#[must_use]
pub struct RwRef<'a, P: StatePolicy> {
    state: &'a RwRefState<P>,
    satisfied: bool,
    first_writer: bool,
    role: Role,
}

impl<'a, P: StatePolicy> RwRef<'a, P> {
    pub fn enter_as_reader(state: &'a RwRefState<P>, required: i64) -> Self {
        assert!(
            state.policy.is_valid_state(required),
            "reader required an invalid state {required}"
        );

        let mut shared = state.shared.lock();
        let satisfied = state.policy.check_state(shared.state, required);
        if satisfied {
            shared.reader_count += 1;
        }
        drop(shared);

        Self {
            state,
            satisfied,
            first_writer: false,
            role: Role::Reader,
        }
    }

    pub fn enter_as_writer(state: &'a RwRefState<P>, required: i64) -> Self {
        assert!(
            state.policy.is_valid_state(required),
            "writer required an invalid state {required}"
        );

        let mut shared = state.shared.lock();
        let first_writer = !state.policy.check_state(shared.state, required);
        let previous = std::mem::replace(&mut shared.state, required);
        drop(shared);

        tracing::trace!(previous, required, first_writer, "RwRef writer entered");

        Self {
            state,
            satisfied: true,
            first_writer,
            role: Role::Writer,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_state_satisfied(&self) -> bool {
        self.satisfied
    }

    pub fn is_first_writer(&self) -> bool {
        self.first_writer
    }

    pub fn update_state(&self, new_state: i64) {
        assert_eq!(
            self.role,
            Role::Writer,
            "`update_state` called on a reader guard"
        );
        assert!(
            self.state.policy.is_valid_state(new_state),
            "writer attempted to publish invalid state {new_state}"
        );

        self.state.shared.lock().state = new_state;
    }

    pub fn wait_for_readers_drained(&self) {
        assert_eq!(
            self.role,
            Role::Writer,
            "`wait_for_readers_drained` called on a reader guard"
        );

        let shared = self.state.shared.lock();
        let _shared = self
            .state
            .drained
            .wait_while(shared, |shared| shared.reader_count != 0);
    }
}

impl<P: StatePolicy> Drop for RwRef<'_, P> {
    fn drop(&mut self) {
        if self.role != Role::Reader || !self.satisfied {
            return;
        }

        let mut shared = self.state.shared.lock();
        shared.reader_count = shared
            .reader_count
            .checked_sub(1)
            .expect("RwRefState reader count underflowed");

        if shared.reader_count == 0 {
            drop(shared);
            self.state.drained.notify_all();
        }
    }
}

// === Tests === //


#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;

    use loom::sync::Arc;

    #[test]
    fn drain_terminates_loom() {
        loom::model(|| {
            let state = Arc::new(RwRefState::new(0, EqualState));

            let reader = loom::thread::spawn({
                let state = state.clone();

                move || {
                    let guard = state.read(0);
                    drop(guard);
                }
            });

            let writer = state.write(1);
            writer.wait_for_readers_drained();
            assert_eq!(state.reader_count(), 0);
            drop(writer);

            reader.join().unwrap();
        });
    }

    #[test]
    fn single_first_writer_loom() {
        loom::model(|| {
            let state = Arc::new(RwRefState::new(0, EqualState));

            let other = loom::thread::spawn({
                let state = state.clone();
                move || state.write(1).is_first_writer()
            });

            let mine = state.write(1).is_first_writer();
            let theirs = other.join().unwrap();

            assert!(mine ^ theirs);
        });
    }
}
