use serde::{Deserialize, Serialize};
use std::fmt;

use super::order_number::OrderNumber;

/// Inbound payment gateway topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    ReadyApproval,
    ReadyFail,
    PaymentApproval,
}

impl TopicKind {
    pub const ALL: [TopicKind; 3] = [
        TopicKind::ReadyApproval,
        TopicKind::ReadyFail,
        TopicKind::PaymentApproval,
    ];

    pub const fn topic(self) -> &'static str {
        match self {
            TopicKind::ReadyApproval => "reservation.ready.approval",
            TopicKind::ReadyFail => "reservation.ready.fail",
            TopicKind::PaymentApproval => "reservation.payment.approval",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == topic)
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// `reservation.ready.approval`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyApproval {
    pub order_number: OrderNumber,
    pub payment_id: i64,
}

/// `reservation.ready.fail` and `reservation.payment.approval`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_number: OrderNumber,
}
