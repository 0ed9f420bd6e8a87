//! Message log record model, used by `runtime::logger`'s ring buffer and
//! the admin-facing message query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Call,
    CallResult,
    CallError,
}

/// One logged OCPP-J message, enriched with correlation metadata so a
/// subscriber can reconstruct request/response pairs without re-parsing
/// the raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub station_id: String,
    pub direction: Direction,
    pub message_type: MessageType,
    pub unique_id: String,
    pub action: Option<String>,
    pub raw: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        station_id: impl Into<String>,
        direction: Direction,
        message_type: MessageType,
        unique_id: impl Into<String>,
        action: Option<String>,
        raw: impl Into<String>,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            direction,
            message_type,
            unique_id: unique_id.into(),
            action,
            raw: raw.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Rolled-up counters a station exposes over its message traffic.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MessageStats {
    pub calls_sent: u64,
    pub calls_received: u64,
    pub results_sent: u64,
    pub results_received: u64,
    pub errors_sent: u64,
    pub errors_received: u64,
    pub dropped: u64,
}

impl MessageStats {
    pub fn record(&mut self, direction: Direction, message_type: MessageType) {
        match (direction, message_type) {
            (Direction::Outbound, MessageType::Call) => self.calls_sent += 1,
            (Direction::Inbound, MessageType::Call) => self.calls_received += 1,
            (Direction::Outbound, MessageType::CallResult) => self.results_sent += 1,
            (Direction::Inbound, MessageType::CallResult) => self.results_received += 1,
            (Direction::Outbound, MessageType::CallError) => self.errors_sent += 1,
            (Direction::Inbound, MessageType::CallError) => self.errors_received += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_tally_by_direction_and_type() {
        let mut stats = MessageStats::default();
        stats.record(Direction::Outbound, MessageType::Call);
        stats.record(Direction::Inbound, MessageType::CallResult);
        stats.record(Direction::Inbound, MessageType::CallError);
        assert_eq!(stats.calls_sent, 1);
        assert_eq!(stats.results_received, 1);
        assert_eq!(stats.errors_received, 1);
    }
}
