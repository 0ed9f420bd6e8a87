//! Runtime layer — async orchestration over the domain model: the
//! WebSocket connection, protocol dispatch, session/transaction
//! lifecycle, heartbeat and meter-value tickers, the station registry,
//! and the message logger.

pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod heartbeat;
pub mod logger;
pub mod session;
pub mod station_manager;

pub use dispatcher::StationContext;
pub use events::{create_event_bus, EventBus, SharedEventBus, StationEvent};
pub use heartbeat::HeartbeatDriver;
pub use logger::MessageLogger;
pub use session::SessionManager;
pub use station_manager::{StationHandle, StationManager};
