//! Sepia is an embedded, append-oriented event log.
//!
//! Events carry a time-ordered identifier, a typed category, free-form string
//! tags and an arbitrary JSON payload. The log supports filtered and
//! time-ranged queries over secondary indices, single-pass aggregation
//! (including percentiles), age-based retention with a background cleanup
//! task, and export to JSON or CSV.
//!
//! ```no_run
//! use sepia::{Aggregation, EventLog, NewEvent, Query};
//! use serde_json::json;
//!
//! # fn main() -> sepia::Result<()> {
//! let log = EventLog::open("./events")?;
//!
//! log.append(NewEvent {
//!     event_type: "request".into(),
//!     tags: [("service".to_string(), "api".to_string())].into(),
//!     data: json!({ "latency_ms": 42 }),
//!     ..Default::default()
//! })?;
//!
//! let result = log.aggregate(
//!     &Query {
//!         types: vec!["request".into()],
//!         ..Default::default()
//!     },
//!     "latency_ms",
//!     &[Aggregation::Count, Aggregation::P95],
//! )?;
//! println!("count={} p95={}", result.count, result.p95);
//! log.close()?;
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod cancel;
mod error;
mod event;
mod export;
mod keys;
mod query;
mod retention;
mod store;
mod ulid;

pub use aggregate::{AggregateResult, Aggregation};
pub use cancel::CancelToken;
pub use error::{Result, SepiaError};
pub use event::{Event, NewEvent};
pub use export::ExportFormat;
pub use query::Query;
pub use retention::RetentionPolicy;
pub use store::EventLog;
pub use ulid::{ParseUlidError, Ulid};
