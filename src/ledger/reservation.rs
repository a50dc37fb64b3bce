//! Reservations and their single terminal transition.

use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::ReservationId;
use crate::core::time::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Pending,
    Committed,
    RolledBack,
    Expired,
}

impl ReservationState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending claim on stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub sku: String,
    pub qty: u64,
    pub user_id: String,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub state: ReservationState,
    /// When the terminal transition happened.
    #[serde(default)]
    pub settled_at: Option<Timestamp>,
}

impl Reservation {
    pub fn is_pending(&self) -> bool {
        self.state == ReservationState::Pending
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now.is_at_or_after(self.expires_at)
    }

    /// Reject anything but `pending`.
    pub fn ensure_pending(&self) -> CoreResult<()> {
        if self.state.is_terminal() {
            return Err(CoreError::terminal("reservation", self.id, self.state));
        }
        Ok(())
    }

    /// Move to a terminal state exactly once.
    pub fn settle(&mut self, to: ReservationState, at: Timestamp) -> CoreResult<()> {
        self.ensure_pending()?;
        if !to.is_terminal() {
            return Err(CoreError::internal("reservation cannot return to pending"));
        }
        self.state = to;
        self.settled_at = Some(at);
        Ok(())
    }
}
