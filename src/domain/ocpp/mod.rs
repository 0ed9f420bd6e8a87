//! OCPP protocol version, shared across dispatch, connection and config.

pub mod version;

pub use version::OcppVersion;
