//! Change stream options records.
//!
//! Immutable value objects consumed by the operation descriptor. Setters
//! take and return the record, builder style; validation happens when the
//! descriptor is constructed.

use std::time::Duration;

use bson::Timestamp;

use crate::error::{Error, Result};
use crate::token::ResumeToken;

/// How much of the modified document change events carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullDocumentMode {
    /// Deliver the post-image looked up at notification time.
    UpdateLookup,
    /// Deliver the post-image when the server has one available.
    WhenAvailable,
    /// Fail the stream when no post-image is available.
    Required,
}

impl FullDocumentMode {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            FullDocumentMode::UpdateLookup => "updateLookup",
            FullDocumentMode::WhenAvailable => "whenAvailable",
            FullDocumentMode::Required => "required",
        }
    }
}

/// Options for opening a change stream.
///
/// At most one of the start positions (`resume_after`, `start_after`,
/// `start_at_operation_time`) may be set.
#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    /// Post-image delivery mode. `None` delivers only the delta.
    pub full_document: Option<FullDocumentMode>,
    /// Server-side batch size hint.
    pub batch_size: Option<u32>,
    /// How long the server may block a `next` waiting for events.
    pub max_await_time: Option<Duration>,
    /// Resume the stream immediately after this token's position.
    pub resume_after: Option<ResumeToken>,
    /// Start the stream at the event following this token, even if the
    /// token's own event has aged out.
    pub start_after: Option<ResumeToken>,
    /// Pin the stream start to a logical clock reading.
    pub start_at_operation_time: Option<Timestamp>,
}

impl ChangeStreamOptions {
    /// Sets the post-image delivery mode.
    pub fn full_document(mut self, mode: FullDocumentMode) -> Self {
        self.full_document = Some(mode);
        self
    }

    /// Sets the server-side batch size hint.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets how long the server may block waiting for events.
    pub fn max_await_time(mut self, max_await_time: Duration) -> Self {
        self.max_await_time = Some(max_await_time);
        self
    }

    /// Resumes from a previously observed token.
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.resume_after = Some(token);
        self
    }

    /// Starts after a previously observed token.
    pub fn start_after(mut self, token: ResumeToken) -> Self {
        self.start_after = Some(token);
        self
    }

    /// Starts at a logical clock reading.
    pub fn start_at_operation_time(mut self, operation_time: Timestamp) -> Self {
        self.start_at_operation_time = Some(operation_time);
        self
    }

    /// Rejects conflicting start positions.
    pub(crate) fn validate(&self) -> Result<()> {
        let positions = usize::from(self.resume_after.is_some())
            + usize::from(self.start_after.is_some())
            + usize::from(self.start_at_operation_time.is_some());
        if positions > 1 {
            return Err(Error::InvalidArgument {
                message: "only one of resumeAfter, startAfter and startAtOperationTime \
                          may be specified"
                    .into(),
            });
        }
        Ok(())
    }
}
