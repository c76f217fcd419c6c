use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReservationError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDB(#[from] rocksdb::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Reservation not found for order number {0}")]
    NotFound(String),

    #[error("Order number {0} is already taken")]
    Conflict(String),

    #[error("Order sequence exhausted for {day}: more than 9999 reservations in one day")]
    AllocationExhausted { day: String },

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Consumer registry is closed: {0}")]
    RegistryClosed(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ReservationError {
    pub fn publish(topic: &str, reason: impl ToString) -> Self {
        Self::Publish {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReservationError>;
