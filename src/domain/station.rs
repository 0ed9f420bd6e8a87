//! Station configuration and runtime state.
//!
//! `StationConfig` is the immutable-per-boot description of a station
//! (vendor/model, CSMS URL, connectors, simulation parameters); the
//! mutable runtime half (`StationRuntime`) tracks connection status and
//! is guarded by a single per-station lock by its owner
//! (`runtime::station_manager::StationHandle`), since state and status
//! must always be updated together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ocpp::OcppVersion;
use crate::support::RepositoryError;

/// How the station authenticates the WebSocket upgrade to the CSMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthMode {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Accept self-signed / untrusted certificates. Only meaningful for `wss://`.
    pub insecure_skip_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: u32,
    pub type_label: String,
    pub max_power_w: u32,
}

/// A measurand the meter simulator can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Measurand {
    EnergyActiveImportRegister,
    PowerActiveImport,
    CurrentImport,
    Voltage,
    Soc,
    Temperature,
    Frequency,
    PowerFactor,
}

impl Measurand {
    pub fn ocpp_name(&self) -> &'static str {
        match self {
            Self::EnergyActiveImportRegister => "Energy.Active.Import.Register",
            Self::PowerActiveImport => "Power.Active.Import",
            Self::CurrentImport => "Current.Import",
            Self::Voltage => "Voltage",
            Self::Soc => "SoC",
            Self::Temperature => "Temperature",
            Self::Frequency => "Frequency",
            Self::PowerFactor => "Power.Factor",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::EnergyActiveImportRegister => "Wh",
            Self::PowerActiveImport => "W",
            Self::CurrentImport => "A",
            Self::Voltage => "V",
            Self::Soc => "Percent",
            Self::Temperature => "Celsius",
            Self::Frequency => "Hertz",
            Self::PowerFactor => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    pub interval_secs: u64,
    pub measurands: Vec<Measurand>,
    pub aligned_data_interval_secs: Option<u64>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            measurands: vec![Measurand::EnergyActiveImportRegister],
            aligned_data_interval_secs: None,
        }
    }
}

/// Simulation parameters — everything needed to generate realistic
/// telemetry without a real charger attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub boot_delay_ms: u64,
    pub heartbeat_interval_default_secs: u32,
    pub default_id_tag: String,
    /// Energy delivery rate, in watt-seconds per second (i.e. watts).
    pub energy_delivery_rate_w: f64,
    pub randomize: bool,
    /// Uniform perturbation applied to each meter tick, in `[0, 1]`.
    pub variance: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: 0,
            heartbeat_interval_default_secs: 300,
            default_id_tag: "USER001".to_string(),
            energy_delivery_rate_w: 7000.0,
            randomize: false,
            variance: 0.0,
        }
    }
}

/// Immutable-per-boot station configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub csms_url: String,
    pub protocol_version: OcppVersion,
    pub auth: AuthMode,
    pub tls: TlsConfig,
    pub connectors: Vec<ConnectorConfig>,
    pub supported_profiles: Vec<String>,
    pub meter: MeterConfig,
    pub sim: SimulationConfig,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub auto_start: bool,
    /// Emit a `StatusNotification` whenever a connector changes state.
    #[serde(default = "default_notify_on_change")]
    pub notify_on_change: bool,
}

fn default_notify_on_change() -> bool {
    true
}

impl StationConfig {
    pub fn new(id: impl Into<String>, csms_url: impl Into<String>, version: OcppVersion) -> Self {
        Self {
            id: id.into(),
            vendor: "Texnouz".to_string(),
            model: "Emulator".to_string(),
            csms_url: csms_url.into(),
            protocol_version: version,
            auth: AuthMode::None,
            tls: TlsConfig::default(),
            connectors: vec![ConnectorConfig {
                id: 1,
                type_label: "Type2".to_string(),
                max_power_w: 22_000,
            }],
            supported_profiles: Vec::new(),
            meter: MeterConfig::default(),
            sim: SimulationConfig::default(),
            tags: Vec::new(),
            enabled: true,
            auto_start: false,
            notify_on_change: true,
        }
    }
}

/// High-level lifecycle state of a station, independent of the
/// lower-level WebSocket connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationState {
    Stopped,
    Connecting,
    Connected,
    Error,
}

/// WebSocket-layer connection status, tracked alongside `StationState`
/// under the same lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    PermanentError,
}

/// Mutable runtime state of a station. Always read/written together with
/// `ConnectionStatus` under the owning `StationHandle`'s single lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRuntime {
    pub state: StationState,
    pub connection_status: ConnectionStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub heartbeat_interval_secs: Option<u32>,
}

impl Default for StationRuntime {
    fn default() -> Self {
        Self {
            state: StationState::Stopped,
            connection_status: ConnectionStatus::Disconnected,
            connected_at: None,
            last_heartbeat: None,
            last_error: None,
            heartbeat_interval_secs: None,
        }
    }
}

/// Snapshot of a station written to / read from the configuration
/// repository, bundling config and the runtime fields the repository
/// persists through the same upsert path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub config: StationConfig,
    pub runtime: StationRuntime,
    pub connectors: Vec<super::connector::ConnectorSnapshot>,
}

/// Repository for station configuration (`List`, `Upsert`, `Delete`).
///
/// The durable document store behind this trait is an external
/// collaborator; this crate only depends on the interface.
#[async_trait]
pub trait StationConfigRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<StationSnapshot>, RepositoryError>;
    async fn upsert(&self, snapshot: StationSnapshot) -> Result<(), RepositoryError>;
    async fn delete(&self, station_id: &str) -> Result<(), RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_connector() {
        let cfg = StationConfig::new("CP001", "ws://localhost:9000", OcppVersion::V16);
        assert_eq!(cfg.connectors.len(), 1);
        assert_eq!(cfg.connectors[0].id, 1);
    }

    #[test]
    fn measurand_names_match_ocpp_spelling() {
        assert_eq!(
            Measurand::EnergyActiveImportRegister.ocpp_name(),
            "Energy.Active.Import.Register"
        );
        assert_eq!(Measurand::Soc.ocpp_name(), "SoC");
    }
}
