//! Tidepool driver core.
//!
//! Client-side core of the Tidepool document store driver. The centerpiece
//! is the resumable change-stream cursor: a continuous, ordered stream of
//! change events over a server-side aggregation cursor that transparently
//! re-establishes itself after transient failures, tracking the last seen
//! resume token across reconnections.
//!
//! The core performs no I/O of its own. The network layer plugs in through
//! the [`binding::ReadBinding`], [`cursor::RawChangeStreamCursor`] and
//! [`operation::AggregateExecutor`] seams; in-memory implementations for
//! testing live in [`mock`].

pub mod binding;
pub mod cursor;
pub mod error;
pub mod event;
pub mod mock;
pub mod operation;
pub mod options;
pub mod retryability;
pub mod token;

// Re-export common types for library usage
pub use binding::{ConnectionSource, ReadBinding, ServerDescription};
pub use cursor::{ChangeStreamCursor, RawChangeStreamCursor};
pub use error::{Error, Result};
pub use event::{ChangeStreamEvent, EventNamespace, OperationType};
pub use operation::{AggregateExecutor, AggregatePlan, ChangeStreamOperation, StreamTarget};
pub use options::{ChangeStreamOptions, FullDocumentMode};
pub use retryability::is_resumable;
pub use token::{ResumeToken, ResumeTokenStore};
