//! Consistency layer contract for the Taro naming core.
//!
//! The registry talks to replication through the [`ConsistencyService`]
//! trait and receives change notifications through [`RecordListener`].
//! The in-memory implementation in [`memory`] is the AP store used for
//! ephemeral data; a replicated-log engine can stand behind the same
//! trait for persistent data.

pub mod memory;
pub mod model;
pub mod service;

pub use memory::InMemoryConsistencyService;
pub use model::Datum;
pub use service::{ConsistencyService, RecordListener};
