use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ensure_same_row, ReservationStore, ReservationTx};
use crate::{OrderNumber, Reservation, ReservationError, Result};

const RESERVATION_PREFIX: &str = "reservation:";
const SEQUENCE_PREFIX: &str = "sequence:";
const NEXT_ID_KEY: &str = "meta:next_id";

fn reservation_key(order_number: &OrderNumber) -> String {
    format!("{}{}", RESERVATION_PREFIX, order_number)
}

fn sequence_key(order_number: &OrderNumber) -> String {
    format!("{}{}", SEQUENCE_PREFIX, order_number.sequence_key())
}

/// RocksDB-backed reservation store. All writes go through one writer lock,
/// which makes insert and read-modify-write atomic for the owning process.
pub struct RocksDbReservationStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDbReservationStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(10000);
        opts.set_use_fsync(false);
        opts.set_bytes_per_sync(8388608);
        opts.optimize_for_point_lookup(1024);

        let db = DB::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn get_reservation(&self, order_number: &OrderNumber) -> Result<Option<Reservation>> {
        match self.db.get(reservation_key(order_number))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn next_id(&self) -> Result<i64> {
        let current = match self.db.get(NEXT_ID_KEY)? {
            Some(value) => String::from_utf8_lossy(&value).parse::<i64>().map_err(|e| {
                ReservationError::InvalidArgument(format!("Corrupt id counter: {}", e))
            })?,
            None => 0,
        };
        Ok(current + 1)
    }
}

#[async_trait]
impl ReservationStore for RocksDbReservationStore {
    async fn find_by_order_number(&self, order_number: &OrderNumber) -> Result<Option<Reservation>> {
        self.get_reservation(order_number)
    }

    async fn latest_order_number(&self, day: &str) -> Result<Option<OrderNumber>> {
        let prefix = format!("{}{}", SEQUENCE_PREFIX, day);
        // sequences are fixed width, so the last key of the day is the highest
        let upper = format!("{}9999", prefix);

        let mut iter = self
            .db
            .iterator(IteratorMode::From(upper.as_bytes(), Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if !key.starts_with(prefix.as_bytes()) {
                    return Ok(None);
                }
                let order_number = String::from_utf8_lossy(&value).parse()?;
                Ok(Some(order_number))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, mut reservation: Reservation) -> Result<Reservation> {
        let _writer = self.writer.lock().await;

        let sequence = sequence_key(&reservation.order_number);
        if self.db.get(&sequence)?.is_some() {
            return Err(ReservationError::Conflict(reservation.order_number.to_string()));
        }

        reservation.id = self.next_id()?;

        let mut batch = WriteBatch::default();
        batch.put(reservation_key(&reservation.order_number), serde_json::to_vec(&reservation)?);
        batch.put(&sequence, reservation.order_number.as_str());
        batch.put(NEXT_ID_KEY, reservation.id.to_string());
        self.db.write(batch)?;

        Ok(reservation)
    }

    async fn lock_for_update(&self, order_number: &OrderNumber) -> Result<Option<Box<dyn ReservationTx>>> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let Some(current) = self.get_reservation(order_number)? else {
            return Ok(None);
        };
        Ok(Some(Box::new(RocksDbTx {
            db: Arc::clone(&self.db),
            current,
            _guard: guard,
        })))
    }

    async fn list_by_user(&self, user_id: &str, skip: usize, limit: usize) -> Result<Vec<Reservation>> {
        let mut matching = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(RESERVATION_PREFIX.as_bytes(), Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(RESERVATION_PREFIX.as_bytes()) {
                break;
            }
            let reservation: Reservation = serde_json::from_slice(&value)?;
            if reservation.user_id == user_id {
                matching.push(reservation);
            }
        }
        matching.sort_by_key(|reservation| reservation.id);

        Ok(matching.into_iter().skip(skip).take(limit).collect())
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

struct RocksDbTx {
    db: Arc<DB>,
    current: Reservation,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl ReservationTx for RocksDbTx {
    fn current(&self) -> &Reservation {
        &self.current
    }

    async fn commit(self: Box<Self>, updated: Reservation) -> Result<()> {
        ensure_same_row(&self.current, &updated)?;
        self.db
            .put(reservation_key(&updated.order_number), serde_json::to_vec(&updated)?)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
