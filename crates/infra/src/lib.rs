//! Infrastructure layer: ticket stores, counters, configuration, workers.

pub mod config;
pub mod stats;
pub mod ticket_store;
pub mod workers;

pub use config::{ConfigError, StoreConfig};
pub use stats::{Stats, StatsSnapshot};
pub use ticket_store::{
    InMemoryTicketStore, InstrumentedTicketStore, PollRequest, PollResult, PostgresTicketStore,
    StoreError, TicketStore, UpdateFn,
};
pub use workers::{ExpirySweeper, SweeperHandle};
