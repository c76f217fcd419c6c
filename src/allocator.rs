use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::order_number::{day_prefix, MAX_SEQUENCE};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::ReservationStore;
use crate::{Metrics, NewReservation, OrderNumber, Reservation, ReservationError, Result};

/// Hands out day-scoped order numbers. Uniqueness is enforced by the store
/// rejecting a second insert of the same day and sequence; callers retry the
/// allocation and the insert together through [`create_reservation`].
///
/// [`create_reservation`]: OrderNumberAllocator::create_reservation
#[derive(Clone)]
pub struct OrderNumberAllocator {
    store: Arc<dyn ReservationStore>,
    retry: RetryConfig,
    metrics: Metrics,
}

impl OrderNumberAllocator {
    pub fn new(store: Arc<dyn ReservationStore>, retry: RetryConfig, metrics: Metrics) -> Self {
        Self { store, retry, metrics }
    }

    /// Next order number for `now`: the latest sequence of the same day plus
    /// one, or `0000` for the first reservation of the day.
    pub async fn allocate(&self, now: NaiveDateTime) -> Result<OrderNumber> {
        let day = day_prefix(now);

        let sequence = match self.store.latest_order_number(&day).await? {
            Some(last) if last.sequence() >= MAX_SEQUENCE => {
                self.metrics.allocation_exhausted.inc();
                return Err(ReservationError::AllocationExhausted { day });
            }
            Some(last) => last.sequence() + 1,
            None => 0,
        };

        OrderNumber::new(now, sequence)
    }

    /// Allocate and insert a pending reservation as one unit, retrying on
    /// order number conflicts up to the configured attempt count.
    pub async fn create_reservation(&self, now: NaiveDateTime, draft: NewReservation) -> Result<Reservation> {
        draft.validate()?;

        let reservation = retry_with_backoff(
            &self.retry,
            "order number allocation",
            |e| matches!(e, ReservationError::Conflict(_)),
            || {
                let draft = draft.clone();
                async move {
                    let order_number = self.allocate(now).await?;
                    match self.store.insert(draft.into_pending(order_number, now)).await {
                        Err(ReservationError::Conflict(taken)) => {
                            self.metrics.allocation_conflicts.inc();
                            warn!("Order number {} was taken concurrently", taken);
                            Err(ReservationError::Conflict(taken))
                        }
                        other => other,
                    }
                }
            },
        )
        .await?;

        self.metrics.reservations_created.inc();
        info!(
            "Created reservation {} for user {} (space {})",
            reservation.order_number, reservation.user_id, reservation.space_id
        );
        Ok(reservation)
    }
}
