//! Tapesim aggregate crate that re-exports the main components for
//! downstream users.

pub use tapesim_broker as broker;
pub use tapesim_core as core;
pub use tapesim_data as data;
pub use tapesim_metrics as metrics;
pub use tapesim_proto as proto;
pub use tapesim_server as server;
pub use tapesim_session as session;

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use tapesim_broker::{Broker, MatchOutcome};
    pub use tapesim_core::*;
    pub use tapesim_data::{CsvSource, DataSource, MemorySource, ReplayStream, SqliteSource};
    pub use tapesim_metrics::{MetricsReport, MetricsTracker, ReportKind};
    pub use tapesim_proto::{ApiError, ErrorCode, Frame, Method, Request, MULTIPLEX_CID};
    pub use tapesim_server::{ReplayServer, ServerConfig, ServerMetrics};
    pub use tapesim_session::{ClientSession, ConnectionSession, ReportingFlags, SessionEvent};
}
