use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::ReservationStore;
use crate::{
    Metrics, OrderNumber, ReservationError, ReservationStatus, Result, StatusChange,
    TransitionOutcome,
};

/// Applies status changes and payment attachments to a single reservation.
///
/// Each request runs as one locked read-modify-write: the current row is read
/// under the store's row lock, compared against the request and either
/// committed or rolled back. Requests are idempotent, so redelivered events
/// leave the stored reservation unchanged.
#[derive(Clone)]
pub struct ReservationStateMachine {
    store: Arc<dyn ReservationStore>,
    metrics: Metrics,
}

impl ReservationStateMachine {
    pub fn new(store: Arc<dyn ReservationStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Move the reservation to `target`. A terminal reservation never moves to
    /// a different state; such requests are rolled back and reported as
    /// [`TransitionOutcome::Rejected`].
    pub async fn apply_status(&self, order_number: &OrderNumber, target: ReservationStatus) -> Result<TransitionOutcome> {
        let tx = self
            .store
            .lock_for_update(order_number)
            .await?
            .ok_or_else(|| ReservationError::NotFound(order_number.to_string()))?;

        let current = tx.current().status;
        let outcome = match current.transition_to(target) {
            StatusChange::Apply => {
                let mut updated = tx.current().clone();
                updated.status = target;
                tx.commit(updated).await?;
                info!("Reservation {}: {:?} -> {:?}", order_number, current, target);
                TransitionOutcome::Applied
            }
            StatusChange::Unchanged => {
                tx.rollback().await?;
                debug!("Reservation {} already {:?}", order_number, target);
                TransitionOutcome::Unchanged
            }
            StatusChange::Rejected => {
                tx.rollback().await?;
                warn!(
                    "Ignoring {:?} for reservation {}: already in terminal state {:?}",
                    target, order_number, current
                );
                TransitionOutcome::Rejected { current }
            }
        };

        self.metrics.record_transition(outcome);
        Ok(outcome)
    }

    /// Record the payment gateway's id. Status is left untouched; an id that
    /// differs from one already stored is not overwritten.
    pub async fn attach_payment(&self, order_number: &OrderNumber, payment_id: i64) -> Result<TransitionOutcome> {
        let tx = self
            .store
            .lock_for_update(order_number)
            .await?
            .ok_or_else(|| ReservationError::NotFound(order_number.to_string()))?;

        let current = tx.current().status;
        let outcome = match tx.current().payment_id {
            None => {
                let mut updated = tx.current().clone();
                updated.payment_id = Some(payment_id);
                tx.commit(updated).await?;
                info!("Reservation {}: payment {} attached", order_number, payment_id);
                TransitionOutcome::Applied
            }
            Some(existing) if existing == payment_id => {
                tx.rollback().await?;
                debug!("Reservation {} already has payment {}", order_number, payment_id);
                TransitionOutcome::Unchanged
            }
            Some(existing) => {
                tx.rollback().await?;
                warn!(
                    "Ignoring payment {} for reservation {}: payment {} already attached",
                    payment_id, order_number, existing
                );
                TransitionOutcome::Rejected { current }
            }
        };

        self.metrics.record_transition(outcome);
        Ok(outcome)
    }

    pub async fn cancel(&self, order_number: &OrderNumber) -> Result<TransitionOutcome> {
        self.apply_status(order_number, ReservationStatus::Canceled).await
    }
}
