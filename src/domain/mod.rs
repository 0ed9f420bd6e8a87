//! Domain layer — core entities and value types for the emulator.
//!
//! Every type here is plain data plus invariant-preserving methods; the
//! async orchestration that moves this data around lives in `runtime`.

pub mod auth_cache;
pub mod certificate;
pub mod connector;
pub mod device_model;
pub mod frame;
pub mod message;
pub mod ocpp;
pub mod pending;
pub mod station;
pub mod transaction;

pub use auth_cache::{AuthCache, CachedOutcome};
pub use certificate::{CertHashData, CertificateEntry, CertificateStore, CertificateType};
pub use connector::{Connector, ConnectorSnapshot, ConnectorState};
pub use device_model::{AttributeType, DeviceModel, Mutability, VariableKey, VariableValue};
pub use frame::{ErrorCode, OcppFrame, OcppFrameError};
pub use message::{Direction, MessageRecord, MessageStats, MessageType};
pub use ocpp::OcppVersion;
pub use pending::PendingRequestTable;
pub use station::{
    AuthMode, ConnectionStatus, ConnectorConfig, Measurand, MeterConfig, SimulationConfig,
    StationConfig, StationConfigRepository, StationRuntime, StationSnapshot, StationState,
    TlsConfig,
};
pub use transaction::{MeterSample, StopReason, Transaction, TransactionId, TransactionStatus};
