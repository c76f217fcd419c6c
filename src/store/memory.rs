use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ensure_same_row, ReservationStore, ReservationTx};
use crate::{OrderNumber, Reservation, ReservationError, Result};

/// In-memory store with one lock per row.
#[derive(Default)]
pub struct InMemoryReservationStore {
    rows: DashMap<OrderNumber, Arc<Mutex<Reservation>>>,
    // day + sequence -> order number
    sequences: DashMap<String, OrderNumber>,
    next_id: AtomicI64,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn row(&self, order_number: &OrderNumber) -> Option<Arc<Mutex<Reservation>>> {
        self.rows.get(order_number).map(|entry| Arc::clone(entry.value()))
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn find_by_order_number(&self, order_number: &OrderNumber) -> Result<Option<Reservation>> {
        match self.row(order_number) {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn latest_order_number(&self, day: &str) -> Result<Option<OrderNumber>> {
        Ok(self
            .sequences
            .iter()
            .filter(|entry| entry.key().starts_with(day))
            .max_by(|a, b| a.key().cmp(b.key()))
            .map(|entry| entry.value().clone()))
    }

    async fn insert(&self, mut reservation: Reservation) -> Result<Reservation> {
        let order_number = reservation.order_number.clone();

        match self.sequences.entry(order_number.sequence_key()) {
            Entry::Occupied(_) => Err(ReservationError::Conflict(order_number.to_string())),
            Entry::Vacant(slot) => {
                reservation.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                self.rows.insert(order_number.clone(), Arc::new(Mutex::new(reservation.clone())));
                slot.insert(order_number);
                Ok(reservation)
            }
        }
    }

    async fn lock_for_update(&self, order_number: &OrderNumber) -> Result<Option<Box<dyn ReservationTx>>> {
        let Some(row) = self.row(order_number) else {
            return Ok(None);
        };
        let guard = row.lock_owned().await;
        Ok(Some(Box::new(MemoryTx { guard })))
    }

    async fn list_by_user(&self, user_id: &str, skip: usize, limit: usize) -> Result<Vec<Reservation>> {
        let rows: Vec<_> = self.rows.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut matching = Vec::new();
        for row in rows {
            let reservation = row.lock().await;
            if reservation.user_id == user_id {
                matching.push(reservation.clone());
            }
        }
        matching.sort_by_key(|reservation| reservation.id);

        Ok(matching.into_iter().skip(skip).take(limit).collect())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Reservation>,
}

#[async_trait]
impl ReservationTx for MemoryTx {
    fn current(&self) -> &Reservation {
        &self.guard
    }

    async fn commit(self: Box<Self>, updated: Reservation) -> Result<()> {
        let mut tx = self;
        ensure_same_row(&tx.guard, &updated)?;
        *tx.guard = updated;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
