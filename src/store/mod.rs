//! Reservation storage.
//!
//! The store is the only shared mutable resource of the core. Writers either
//! insert a new reservation, which fails with [`ReservationError::Conflict`]
//! when its day and sequence are already taken, or lock an existing row with
//! [`ReservationStore::lock_for_update`] and finish the returned transaction
//! with a commit or a rollback.

pub mod memory;
pub mod rocksdb_store;

pub use self::memory::InMemoryReservationStore;
pub use self::rocksdb_store::RocksDbReservationStore;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{OrderNumber, Reservation, ReservationError, Result, ServiceConfig, StorageBackend};

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn find_by_order_number(&self, order_number: &OrderNumber) -> Result<Option<Reservation>>;

    /// Highest-sequence order number allocated on `day` (`YYYYMMDD`).
    async fn latest_order_number(&self, day: &str) -> Result<Option<OrderNumber>>;

    /// Insert a new reservation and return it with its storage id.
    async fn insert(&self, reservation: Reservation) -> Result<Reservation>;

    /// Lock the row for a read-modify-write. `None` when no reservation has
    /// this order number.
    async fn lock_for_update(&self, order_number: &OrderNumber) -> Result<Option<Box<dyn ReservationTx>>>;

    /// Reservations of one user in creation order.
    async fn list_by_user(&self, user_id: &str, skip: usize, limit: usize) -> Result<Vec<Reservation>>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A locked reservation row. Dropping it without committing rolls back.
#[async_trait]
pub trait ReservationTx: Send {
    fn current(&self) -> &Reservation;

    async fn commit(self: Box<Self>, updated: Reservation) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

fn ensure_same_row(current: &Reservation, updated: &Reservation) -> Result<()> {
    if current.order_number != updated.order_number || current.id != updated.id {
        return Err(ReservationError::InvalidArgument(format!(
            "Order number {} is immutable",
            current.order_number
        )));
    }
    Ok(())
}

pub fn open_store(config: &ServiceConfig) -> Result<Arc<dyn ReservationStore>> {
    match config.storage {
        StorageBackend::Memory => Ok(Arc::new(InMemoryReservationStore::new())),
        StorageBackend::RocksDb => {
            let path = std::path::Path::new(&config.state_dir).join("reservations");
            std::fs::create_dir_all(&path)?;
            Ok(Arc::new(RocksDbReservationStore::open(path)?))
        }
    }
}
