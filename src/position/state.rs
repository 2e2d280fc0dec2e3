//! CDM position state definitions
//!
//! State IDs are designed for SMALLINT storage. Allowed transitions:
//! Executed -> Formed -> Settled; Executed -> Cancelled; any non-Closed
//! state -> Closed. Everything else is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// CDM trade-lifecycle position state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum PositionState {
    Executed = 10,
    Formed = 20,
    Settled = 30,
    Cancelled = -10,
    Closed = -20,
}

impl PositionState {
    /// Check the transition DAG. `from = None` models the first write for a
    /// partition, which must land on Executed. An identity write on a
    /// non-Closed state is allowed: a new lot folding into the position
    /// re-writes the blob without moving through the lifecycle.
    pub fn can_transition(from: Option<PositionState>, to: PositionState) -> bool {
        use PositionState::*;
        match from {
            None => to == Executed,
            Some(Closed) => false,
            Some(s) if s == to => true,
            Some(_) if to == Closed => true,
            Some(Executed) => matches!(to, Formed | Cancelled),
            Some(Formed) => to == Settled,
            Some(Settled) | Some(Cancelled) => false,
        }
    }

    /// No further transitions besides Closed
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            10 => Some(PositionState::Executed),
            20 => Some(PositionState::Formed),
            30 => Some(PositionState::Settled),
            -10 => Some(PositionState::Cancelled),
            -20 => Some(PositionState::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Executed => "EXECUTED",
            PositionState::Formed => "FORMED",
            PositionState::Settled => "SETTLED",
            PositionState::Cancelled => "CANCELLED",
            PositionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for PositionState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        PositionState::from_id(value).ok_or(())
    }
}
