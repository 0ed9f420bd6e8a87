//! Infrastructure layer — in-memory adapters for the repository traits
//! the domain/runtime layers depend on.

pub mod memory;

pub use memory::{InMemoryMessageRepository, InMemoryStationConfigRepository};
