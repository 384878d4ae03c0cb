use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use crate::sync::{Condvar, Mutex};

// === Cursor === //

/// A file position that is handed out to one thread at a time, in arrival order.
///
/// Threads draw a ticket and wait until it is served, so a steady stream of small operations
/// cannot starve a large sequential reader that got in line first.
#[derive(Debug, Default)]
pub struct Cursor {
    state: Mutex<CursorState>,
    turn: Condvar,
}

#[derive(Debug, Default)]
struct CursorState {
    position: i64,
    next_ticket: u64,
    now_serving: u64,
}

impl Cursor {
    pub fn new(position: i64) -> Self {
        Self {
            state: Mutex::new(CursorState {
                position,
                next_ticket: 0,
                now_serving: 0,
            }),
            turn: Condvar::new(),
        }
    }

    pub fn lock(&self) -> CursorGuard<'_> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let state = self
            .turn
            .wait_while(state, |state| state.now_serving != ticket);

        CursorGuard {
            cursor: self,
            position: state.position,
        }
    }

    /// Last position published by a released guard.
    pub fn position(&self) -> i64 {
        self.state.lock().position
    }

    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.next_ticket != state.now_serving
    }

    /// Threads queued behind the current holder.
    pub fn waiters(&self) -> u64 {
        let state = self.state.lock();
        (state.next_ticket - state.now_serving).saturating_sub(1)
    }
}

// === CursorGuard === //

/// Exclusive access to a [`Cursor`]'s position. The position is written back on release.
#[must_use]
pub struct CursorGuard<'a> {
    cursor: &'a Cursor,
    position: i64,
}

impl fmt::Debug for CursorGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorGuard")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl CursorGuard<'_> {
    pub fn seek(&mut self, position: i64) {
        self.position = position;
    }

    pub fn advance(&mut self, delta: i64) -> i64 {
        self.position += delta;
        self.position
    }

    pub fn unlock(self) {
        drop(self);
    }
}

impl Deref for CursorGuard<'_> {
    type Target = i64;

    fn deref(&self) -> &i64 {
        &self.position
    }
}

impl DerefMut for CursorGuard<'_> {
    fn deref_mut(&mut self) -> &mut i64 {
        &mut self.position
    }
}

impl Drop for CursorGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.cursor.state.lock();
        state.position = self.position;
        state.now_serving += 1;
        drop(state);

        self.cursor.turn.notify_all();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::thread;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn position_is_published_on_release() {
        let cursor = Cursor::new(10);

        let mut guard = cursor.lock();
        assert!(cursor.is_locked());
        assert_eq!(guard.advance(5), 15);
        assert_eq!(cursor.position(), 10);

        guard.unlock();
        assert!(!cursor.is_locked());
        assert_eq!(cursor.position(), 15);

        let mut guard = cursor.lock();
        guard.seek(0);
        *guard += 3;
        drop(guard);
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let cursor = Cursor::new(0);
        let order = Mutex::new(Vec::new());

        let held = cursor.lock();

        thread::scope(|s| {
            for id in 1..=3u64 {
                let (cursor, order) = (&cursor, &order);
                s.spawn(move || {
                    let mut guard = cursor.lock();
                    order.lock().push(id);
                    guard.advance(1);
                });

                while cursor.waiters() < id {
                    thread::yield_now();
                }
            }

            drop(held);
        });

        assert_eq!(*order.lock(), [1, 2, 3]);
        assert_eq!(cursor.position(), 3);
        assert_eq!(cursor.waiters(), 0);
    }

    #[test]
    fn contended_increments_are_not_lost() {
        let cursor = Cursor::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let mut guard = cursor.lock();
                        let seen = *guard;
                        thread::yield_now();
                        *guard = seen + 1;
                    }
                });
            }
        });

        assert_eq!(cursor.position(), 4000);
    }
}

#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;

    use loom::sync::Arc;

    #[test]
    fn exclusive_read_modify_write_loom() {
        loom::model(|| {
            let cursor = Arc::new(Cursor::new(0));

            let other = loom::thread::spawn({
                let cursor = cursor.clone();
                move || {
                    let mut guard = cursor.lock();
                    let seen = *guard;
                    *guard = seen + 1;
                }
            });

            {
                let mut guard = cursor.lock();
                let seen = *guard;
                *guard = seen + 1;
            }

            other.join().unwrap();
            assert_eq!(cursor.position(), 2);
        });
    }
}
