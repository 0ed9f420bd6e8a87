//! Transaction lifecycle model.
//!
//! OCPP 1.6 identifies transactions by a CSMS-assigned integer; 2.0.1/2.1
//! use a station-assigned opaque string instead. `TransactionId` carries
//! both so the rest of the runtime doesn't need a version split to track
//! "the transaction", keeping a single `Transaction` type independent of
//! the wire encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionId {
    /// OCPP 1.6 `transactionId`.
    Numeric(i64),
    /// OCPP 2.0.1 / 2.1 `transactionId` (opaque string, CiString20).
    Text(String),
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Active,
    Stopping,
    Stopped,
}

/// Reason a transaction ended, per OCPP 1.6 Appendix `Reason` / 2.0.1
/// `TransactionEventEnumType` stop reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Local,
    Remote,
    EmergencyStop,
    EvDisconnected,
    HardReset,
    SoftReset,
    PowerLoss,
    DeAuthorized,
    Reboot,
    UnlockCommand,
    Other,
}

impl StopReason {
    pub fn ocpp_reason(&self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::Remote => "Remote",
            Self::EmergencyStop => "EmergencyStop",
            Self::EvDisconnected => "EVDisconnected",
            Self::HardReset => "HardReset",
            Self::SoftReset => "SoftReset",
            Self::PowerLoss => "PowerLoss",
            Self::DeAuthorized => "DeAuthorized",
            Self::Reboot => "Reboot",
            Self::UnlockCommand => "UnlockCommand",
            Self::Other => "Other",
        }
    }
}

/// A single meter reading taken during a transaction, feeding both the
/// periodic `MeterValues` messages and the final stop value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSample {
    pub timestamp: DateTime<Utc>,
    /// Cumulative energy delivered so far, in Wh.
    pub energy_wh: f64,
    pub power_w: f64,
    pub soc_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub connector_id: u32,
    pub id_tag: String,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub meter_start_wh: f64,
    pub meter_stop_wh: Option<f64>,
    pub samples: Vec<MeterSample>,
    pub stop_reason: Option<StopReason>,
}

impl Transaction {
    pub fn start(id: TransactionId, connector_id: u32, id_tag: String, meter_start_wh: f64) -> Self {
        Self {
            id,
            connector_id,
            id_tag,
            status: TransactionStatus::Active,
            started_at: Utc::now(),
            stopped_at: None,
            meter_start_wh,
            meter_stop_wh: None,
            samples: Vec::new(),
            stop_reason: None,
        }
    }

    pub fn record_sample(&mut self, sample: MeterSample) {
        self.samples.push(sample);
    }

    pub fn stop(&mut self, meter_stop_wh: f64, reason: StopReason) {
        self.status = TransactionStatus::Stopped;
        self.stopped_at = Some(Utc::now());
        self.meter_stop_wh = Some(meter_stop_wh);
        self.stop_reason = Some(reason);
    }

    pub fn energy_delivered_wh(&self) -> f64 {
        self.meter_stop_wh.unwrap_or_else(|| {
            self.samples
                .last()
                .map(|s| s.energy_wh)
                .unwrap_or(self.meter_start_wh)
        }) - self.meter_start_wh
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TransactionStatus::Active)
    }
}
