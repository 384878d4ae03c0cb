use std::fmt;

use serde::Serialize;

use crate::state_ref::StatePolicy;

// === SessionState === //

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Opening,
    Open,
    Closing,
    Closed,
    Stale,
    Rejected,
}

impl SessionState {
    pub const ALL: [Self; 7] = [
        Self::New,
        Self::Opening,
        Self::Open,
        Self::Closing,
        Self::Closed,
        Self::Stale,
        Self::Rejected,
    ];

    pub const fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Stale => "stale",
            Self::Rejected => "rejected",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Rejected)
    }

    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::New, Self::Opening)
            | (Self::Opening, Self::Open)
            | (Self::Open, Self::Stale)
            | (Self::Open, Self::Closing)
            | (Self::Stale, Self::Open)
            | (Self::Closing, Self::Closed) => true,
            (from, Self::Rejected) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// === ReclaimState === //

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimState {
    None,
    Reclaiming,
    ReclaimOk,
    ReclaimFail,
}

impl ReclaimState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Reclaiming => "reclaiming",
            Self::ReclaimOk => "reclaim_ok",
            Self::ReclaimFail => "reclaim_fail",
        }
    }
}

impl fmt::Display for ReclaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// === SessionStatePolicy === //

/// Gate policy for a session: readers ask for an exact [`SessionState`].
#[derive(Debug, Copy, Clone, Default)]
pub struct SessionStatePolicy;

impl StatePolicy for SessionStatePolicy {
    fn is_valid_state(&self, state: i64) -> bool {
        SessionState::from_code(state).is_some()
    }

    fn check_state(&self, current: i64, required: i64) -> bool {
        current == required
    }
}
