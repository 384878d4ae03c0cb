use std::fmt;

// === Formatting Helpers === //

pub struct FmtDebugUsingDisplay<T>(pub T);

impl<T: fmt::Display> fmt::Debug for FmtDebugUsingDisplay<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
