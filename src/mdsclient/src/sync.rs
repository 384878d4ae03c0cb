use std::fmt;

// === Blocking primitives === //

// Everything that blocks a thread in this crate goes through these wrappers so the guard and
// cursor logic can be model-checked under `--cfg loom`. The API is the small subset of
// `parking_lot` we actually use, with `wait_while` taking the guard by value to paper over the
// differing condvar signatures.

cfgenius::cond! {
    if cfg(loom) {
        mod imp {
            pub use loom::sync::MutexGuard;

            pub struct Mutex<T>(loom::sync::Mutex<T>);

            impl<T> Mutex<T> {
                pub fn new(value: T) -> Self {
                    Self(loom::sync::Mutex::new(value))
                }

                pub fn lock(&self) -> MutexGuard<'_, T> {
                    self.0.lock().unwrap()
                }
            }

            pub struct Condvar(loom::sync::Condvar);

            impl Condvar {
                pub fn new() -> Self {
                    Self(loom::sync::Condvar::new())
                }

                pub fn wait_while<'a, T>(
                    &self,
                    mut guard: MutexGuard<'a, T>,
                    mut condition: impl FnMut(&mut T) -> bool,
                ) -> MutexGuard<'a, T> {
                    while condition(&mut *guard) {
                        guard = self.0.wait(guard).unwrap();
                    }
                    guard
                }

                pub fn notify_all(&self) {
                    self.0.notify_all();
                }
            }
        }
    } else {
        mod imp {
            pub use parking_lot::MutexGuard;

            pub struct Mutex<T>(parking_lot::Mutex<T>);

            impl<T> Mutex<T> {
                pub fn new(value: T) -> Self {
                    Self(parking_lot::Mutex::new(value))
                }

                pub fn lock(&self) -> MutexGuard<'_, T> {
                    self.0.lock()
                }
            }

            pub struct Condvar(parking_lot::Condvar);

            impl Condvar {
                pub fn new() -> Self {
                    Self(parking_lot::Condvar::new())
                }

                pub fn wait_while<'a, T>(
                    &self,
                    mut guard: MutexGuard<'a, T>,
                    condition: impl FnMut(&mut T) -> bool,
                ) -> MutexGuard<'a, T> {
                    self.0.wait_while(&mut guard, condition);
                    guard
                }

                pub fn notify_all(&self) {
                    self.0.notify_all();
                }
            }
        }
    }
}

pub use imp::*;

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
