//! # OCPP emulator
//!
//! A multi-station OCPP 1.6 / 2.0.1 / 2.1 charge point emulator: each
//! configured station dials out to a CSMS over WebSocket, answers
//! incoming management calls, and generates plausible transaction and
//! meter telemetry without any real hardware attached.
//!
//! ## Layout
//!
//! - **domain**: core entities and value types (frame, connector,
//!   transaction, station, device model, certificates)
//! - **runtime**: async orchestration over the domain model (connection,
//!   dispatcher, session, heartbeat, station registry, message logger)
//! - **infrastructure**: in-memory adapters for the domain's repository
//!   traits
//! - **support**: cross-cutting utilities (error taxonomy, shutdown)
//! - **config**: process configuration (TOML-based)

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod runtime;
pub mod support;

pub use config::{default_config_path, EmulatorConfig};
pub use runtime::{create_event_bus, EventBus, SharedEventBus, StationManager};
