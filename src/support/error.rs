//! Error taxonomy shared across the runtime.
//!
//! Mirrors the layered `DomainError`/`InfraError`/`AppError` split the rest
//! of this crate's lineage uses, but organized around the categories in
//! the emulator's error taxonomy: transport, framing, protocol,
//! authorization, state, repository, cancellation.

use thiserror::Error;

use crate::domain::frame::OcppFrameError;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    ConnectFailure(String),
    #[error("send queue is full")]
    Backpressure,
    #[error("station is not connected")]
    NotConnected,
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("malformed frame: {0}")]
    FormationViolation(#[from] OcppFrameError),
    #[error("type constraint violation: {0}")]
    TypeConstraintViolation(String),
    #[error("property constraint violation: {0}")]
    PropertyConstraintViolation(String),
}

#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("action not implemented: {0}")]
    NotImplemented(String),
    #[error("action not supported: {0}")]
    NotSupported(String),
    #[error("security error: {0}")]
    SecurityError(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ProtocolError {
    /// The OCPP-J CallError code this maps to.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotImplemented(_) => "NotImplemented",
            Self::NotSupported(_) => "NotSupported",
            Self::SecurityError(_) => "SecurityError",
            Self::InternalError(_) => "InternalError",
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("idTag rejected by CSMS")]
    AuthorizationRejected,
    #[error("Authorize reply did not arrive within the deadline")]
    AuthorizationTimeout,
    #[error("idTag was recently rejected and is cached")]
    AuthorizationCachedReject,
}

#[derive(Debug, Error, Clone)]
pub enum StateError {
    #[error("invalid connector transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },
    #[error("connector {0} is busy")]
    ConnectorBusy(u32),
    #[error("connector {0} has no active transaction")]
    NoActiveTransaction(u32),
    #[error("connector {0} does not exist")]
    UnknownConnector(u32),
    #[error("station {0} is disabled")]
    StationDisabled(String),
    #[error("station {0} is not connected")]
    StationNotConnected(String),
}

#[derive(Debug, Error, Clone)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("repository operation timed out")]
    Timeout,
    #[error("repository conflict: {0}")]
    Conflict(String),
}

/// Top-level error returned by admin-facing and dispatch-facing operations.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("shutting down")]
    ShuttingDown,
}

pub type EmulatorResult<T> = Result<T, EmulatorError>;
