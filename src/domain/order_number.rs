use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Result, ReservationError};

pub const TIMESTAMP_LEN: usize = 14;
pub const DAY_LEN: usize = 8;
pub const SEQUENCE_LEN: usize = 4;
pub const ORDER_NUMBER_LEN: usize = TIMESTAMP_LEN + SEQUENCE_LEN;
pub const MAX_SEQUENCE: u16 = 9999;

/// External order identifier: `YYYYMMDDHHMMSS` followed by a four digit,
/// zero padded sequence that counts reservations within the calendar day.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn new(now: NaiveDateTime, sequence: u16) -> Result<Self> {
        if sequence > MAX_SEQUENCE {
            return Err(ReservationError::AllocationExhausted {
                day: day_prefix(now),
            });
        }
        Ok(Self(format!(
            "{}{:04}",
            now.format("%Y%m%d%H%M%S"),
            sequence
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `YYYYMMDD` part.
    pub fn day(&self) -> &str {
        &self.0[..DAY_LEN]
    }

    pub fn timestamp(&self) -> &str {
        &self.0[..TIMESTAMP_LEN]
    }

    pub fn sequence(&self) -> u16 {
        // validated as ASCII digits on construction
        self.0[TIMESTAMP_LEN..].parse().unwrap_or_default()
    }

    /// Day and sequence; two order numbers with the same key collide even
    /// when their timestamps differ.
    pub fn sequence_key(&self) -> String {
        format!("{}{}", self.day(), &self.0[TIMESTAMP_LEN..])
    }
}

pub fn day_prefix(now: NaiveDateTime) -> String {
    now.format("%Y%m%d").to_string()
}

impl FromStr for OrderNumber {
    type Err = ReservationError;

    fn from_str(value: &str) -> Result<Self> {
        if value.len() != ORDER_NUMBER_LEN || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ReservationError::InvalidArgument(format!(
                "Order number must be {} digits: {:?}",
                ORDER_NUMBER_LEN, value
            )));
        }
        NaiveDateTime::parse_from_str(&value[..TIMESTAMP_LEN], "%Y%m%d%H%M%S").map_err(|e| {
            ReservationError::InvalidArgument(format!("Invalid order timestamp in {}: {}", value, e))
        })?;
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = ReservationError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OrderNumber> for String {
    fn from(value: OrderNumber) -> Self {
        value.0
    }
}

impl AsRef<str> for OrderNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
