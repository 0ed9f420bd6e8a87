//! Cross-cutting utilities: error taxonomy, shutdown.

pub mod error;
pub mod shutdown;

pub use error::{
    AuthError, EmulatorError, EmulatorResult, FramingError, ProtocolError, RepositoryError,
    StateError, TransportError,
};
pub use shutdown::{listen_for_shutdown_signals, ShutdownCoordinator, ShutdownSignal};