use prometheus::{
    register_counter_with_registry, register_histogram_with_registry, Counter, Encoder, Histogram,
    HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

use crate::{Result, ReservationError, TransitionOutcome};

/// Metrics collector for the reservation core
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Consumer metrics
    pub messages_received: Counter,
    pub messages_dispatched: Counter,
    pub decode_failures: Counter,
    pub handler_failures: Counter,
    pub handler_duration: Histogram,
    pub poll_errors: Counter,
    pub commit_failures: Counter,

    // Producer metrics
    pub kafka_messages_sent: Counter,
    pub kafka_send_duration: Histogram,
    pub kafka_errors: Counter,

    // Business metrics
    pub transitions_applied: Counter,
    pub transitions_unchanged: Counter,
    pub transitions_rejected: Counter,
    pub reservations_not_found: Counter,
    pub reservations_created: Counter,
    pub allocation_conflicts: Counter,
    pub allocation_exhausted: Counter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let messages_received = register_counter_with_registry!(
            Opts::new("kafka_messages_received_total", "Total number of Kafka messages received"),
            registry
        )?;

        let messages_dispatched = register_counter_with_registry!(
            Opts::new("kafka_messages_dispatched_total", "Messages handed to a topic handler"),
            registry
        )?;

        let decode_failures = register_counter_with_registry!(
            Opts::new("kafka_decode_failures_total", "Messages dropped because the payload was not JSON"),
            registry
        )?;

        let handler_failures = register_counter_with_registry!(
            Opts::new("handler_failures_total", "Handler errors, panics and timeouts"),
            registry
        )?;

        let handler_duration = register_histogram_with_registry!(
            HistogramOpts::new("handler_duration_seconds", "Time spent inside topic handlers")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            registry
        )?;

        let poll_errors = register_counter_with_registry!(
            Opts::new("kafka_poll_errors_total", "Broker errors returned by consumer polls"),
            registry
        )?;

        let commit_failures = register_counter_with_registry!(
            Opts::new("kafka_commit_failures_total", "Offset commits that failed"),
            registry
        )?;

        let kafka_messages_sent = register_counter_with_registry!(
            Opts::new("kafka_messages_sent_total", "Total number of Kafka messages sent"),
            registry
        )?;

        let kafka_send_duration = register_histogram_with_registry!(
            HistogramOpts::new("kafka_send_duration_seconds", "Time spent sending Kafka messages")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            registry
        )?;

        let kafka_errors = register_counter_with_registry!(
            Opts::new("kafka_errors_total", "Total number of Kafka publish errors"),
            registry
        )?;

        let transitions_applied = register_counter_with_registry!(
            Opts::new("reservation_transitions_applied_total", "State changes written to storage"),
            registry
        )?;

        let transitions_unchanged = register_counter_with_registry!(
            Opts::new("reservation_transitions_unchanged_total", "Redelivered transitions that were already applied"),
            registry
        )?;

        let transitions_rejected = register_counter_with_registry!(
            Opts::new("reservation_transitions_rejected_total", "Transitions refused by the terminal-state guard"),
            registry
        )?;

        let reservations_not_found = register_counter_with_registry!(
            Opts::new("reservations_not_found_total", "Events referencing an unknown order number"),
            registry
        )?;

        let reservations_created = register_counter_with_registry!(
            Opts::new("reservations_created_total", "Total number of reservations created"),
            registry
        )?;

        let allocation_conflicts = register_counter_with_registry!(
            Opts::new("order_allocation_conflicts_total", "Order number collisions detected at insert"),
            registry
        )?;

        let allocation_exhausted = register_counter_with_registry!(
            Opts::new("order_allocation_exhausted_total", "Allocations refused because the daily sequence ran out"),
            registry
        )?;

        Ok(Self {
            registry,
            messages_received,
            messages_dispatched,
            decode_failures,
            handler_failures,
            handler_duration,
            poll_errors,
            commit_failures,
            kafka_messages_sent,
            kafka_send_duration,
            kafka_errors,
            transitions_applied,
            transitions_unchanged,
            transitions_rejected,
            reservations_not_found,
            reservations_created,
            allocation_conflicts,
            allocation_exhausted,
        })
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ReservationError::InvalidArgument(format!("Metrics are not UTF-8: {}", e)))
    }

    /// Record a Kafka message send operation
    pub fn record_kafka_send(&self, duration: Duration, success: bool) {
        self.kafka_messages_sent.inc();
        self.kafka_send_duration.observe(duration.as_secs_f64());
        if !success {
            self.kafka_errors.inc();
        }
    }

    pub fn record_handler(&self, duration: Duration, success: bool) {
        self.messages_dispatched.inc();
        self.handler_duration.observe(duration.as_secs_f64());
        if !success {
            self.handler_failures.inc();
        }
    }

    pub fn record_transition(&self, outcome: TransitionOutcome) {
        match outcome {
            TransitionOutcome::Applied => self.transitions_applied.inc(),
            TransitionOutcome::Unchanged => self.transitions_unchanged.inc(),
            TransitionOutcome::Rejected { .. } => self.transitions_rejected.inc(),
        }
    }
}
