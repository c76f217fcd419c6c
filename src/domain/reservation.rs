use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::order_number::OrderNumber;
use crate::{Result, ReservationError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Completed,
    Failed,
    Canceled,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Compare-and-set rule for moving from `self` to `target`.
    pub fn transition_to(self, target: ReservationStatus) -> StatusChange {
        if self == target {
            StatusChange::Unchanged
        } else if self.is_terminal() {
            StatusChange::Rejected
        } else {
            StatusChange::Apply
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Apply,
    Unchanged,
    Rejected,
}

/// When the space is used: a whole day or a time slot, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageWindow {
    Day {
        use_date: NaiveDate,
    },
    Slot {
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub order_number: OrderNumber,
    pub space_id: String,
    pub space_name: String,
    pub user_id: String,
    pub user_name: String,
    pub payment_id: Option<i64>,
    pub status: ReservationStatus,
    pub reservation_date: NaiveDateTime,
    pub usage: UsageWindow,
}

/// Reservation request as handed over by the HTTP layer, before an order
/// number has been allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReservation {
    pub space_id: String,
    pub space_name: String,
    pub user_id: String,
    pub user_name: String,
    pub usage: UsageWindow,
}

impl NewReservation {
    pub fn validate(&self) -> Result<()> {
        if self.space_id.trim().is_empty() || self.user_id.trim().is_empty() {
            return Err(ReservationError::InvalidArgument(
                "space_id and user_id are required".to_string(),
            ));
        }
        if let UsageWindow::Slot { start_time, end_time } = &self.usage {
            if end_time <= start_time {
                return Err(ReservationError::InvalidArgument(format!(
                    "end_time {} must be after start_time {}",
                    end_time, start_time
                )));
            }
        }
        Ok(())
    }

    /// Pending reservation; the id is assigned by the store on insert.
    pub fn into_pending(self, order_number: OrderNumber, now: NaiveDateTime) -> Reservation {
        Reservation {
            id: 0,
            order_number,
            space_id: self.space_id,
            space_name: self.space_name,
            user_id: self.user_id,
            user_name: self.user_name,
            payment_id: None,
            status: ReservationStatus::Pending,
            reservation_date: now,
            usage: self.usage,
        }
    }
}

/// Result of a state machine request that found its reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Unchanged,
    Rejected { current: ReservationStatus },
}
