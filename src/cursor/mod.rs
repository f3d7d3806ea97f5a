//! Resumable change-stream cursor.
//!
//! [`ChangeStreamCursor`] wraps a [`RawChangeStreamCursor`] produced by the
//! command layer and presents a continuous stream of decoded events. When a
//! fetch fails with an error the resume protocol covers, the cursor discards
//! the underlying cursor, re-executes the operation from the cached resume
//! token and retries the fetch; callers never see the transient failure.

use std::sync::Arc;

use async_trait::async_trait;
use bson::raw::RawBsonRef;
use bson::{RawDocumentBuf, Timestamp};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::binding::ReadBinding;
use crate::error::{Error, Result};
use crate::operation::ChangeStreamOperation;
use crate::retryability::is_resumable;
use crate::token::{ResumeToken, ResumeTokenStore};

mod lifecycle;

use lifecycle::{CloseDecision, LifecycleGuard};

/// Cursor over undecoded change-stream batches, produced by the command
/// layer.
///
/// Owned exclusively by one [`ChangeStreamCursor`] at a time; the wrapper
/// guarantees at most one fetch in flight.
#[async_trait]
pub trait RawChangeStreamCursor: Send + Sync {
    /// Fetches the next batch, waiting on the server for events.
    ///
    /// `None` signals the end of the stream.
    async fn next_batch(&self) -> Result<Option<Vec<RawDocumentBuf>>>;

    /// Fetches whatever is immediately available.
    ///
    /// An empty batch is a normal outcome; `None` signals the end of the
    /// stream.
    async fn try_next_batch(&self) -> Result<Option<Vec<RawDocumentBuf>>>;

    /// Releases the server-side cursor. Idempotent.
    fn close(&self);

    /// Whether the server-side cursor is gone.
    fn is_closed(&self) -> bool;

    /// Adjusts the batch size for subsequent fetches.
    fn set_batch_size(&self, batch_size: u32);

    /// The current batch size hint.
    fn batch_size(&self) -> u32;

    /// The token the server attached to the most recent batch, if any.
    fn post_batch_resume_token(&self) -> Option<ResumeToken>;

    /// Whether the stream's opening batch carried no events.
    fn is_first_batch_empty(&self) -> bool;

    /// Wire version of the server the cursor was opened against.
    fn max_wire_version(&self) -> i32;
}

impl std::fmt::Debug for dyn RawChangeStreamCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RawChangeStreamCursor")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Next,
    TryNext,
}

impl FetchKind {
    fn name(self) -> &'static str {
        match self {
            FetchKind::Next => "next()",
            FetchKind::TryNext => "try_next()",
        }
    }
}

/// Clears the in-flight flag when the fetch ends, including when the fetch
/// future is dropped mid-await. A close requested while the fetch was in
/// flight runs here.
struct OperationScope<'a, T> {
    cursor: &'a ChangeStreamCursor<T>,
}

impl<T> Drop for OperationScope<'_, T> {
    fn drop(&mut self) {
        self.cursor.end_operation();
    }
}

/// A change-stream cursor that survives transient failures.
///
/// `next`/`try_next` may be driven from any task; `close` is safe to call
/// concurrently with an in-flight fetch and defers teardown until the fetch
/// reports back. The binding reference held by the cursor is released
/// exactly once, at effective close.
pub struct ChangeStreamCursor<T> {
    operation: Arc<ChangeStreamOperation<T>>,
    binding: Arc<dyn ReadBinding>,
    wrapped: RwLock<Arc<dyn RawChangeStreamCursor>>,
    tokens: ResumeTokenStore,
    max_wire_version: i32,
    guard: LifecycleGuard,
}

impl<T> ChangeStreamCursor<T> {
    pub(crate) fn new(
        operation: Arc<ChangeStreamOperation<T>>,
        wrapped: Arc<dyn RawChangeStreamCursor>,
        binding: Arc<dyn ReadBinding>,
        initial_token: Option<ResumeToken>,
        max_wire_version: i32,
    ) -> Self {
        binding.retain();
        Self {
            operation,
            binding,
            wrapped: RwLock::new(wrapped),
            tokens: ResumeTokenStore::new(initial_token),
            max_wire_version,
            guard: LifecycleGuard::default(),
        }
    }

    /// Terminates the cursor. Idempotent, and safe during an in-flight
    /// fetch: teardown is deferred until the fetch completes.
    pub fn close(&self) {
        if self.guard.request_close() == CloseDecision::CloseNow {
            self.wrapped.read().close();
            self.binding.release();
        }
    }

    /// Whether `close` has been requested.
    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// The cached stream position, for callers that persist it.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.tokens.get()
    }

    /// The token the server attached to the most recent batch.
    pub fn post_batch_resume_token(&self) -> Option<ResumeToken> {
        self.wrapped.read().post_batch_resume_token()
    }

    /// The operation-time pin the stream started at, if any.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation.start_at_operation_time()
    }

    /// Whether the stream's opening batch carried no events.
    pub fn is_first_batch_empty(&self) -> bool {
        self.wrapped.read().is_first_batch_empty()
    }

    /// Wire version observed when this cursor was constructed.
    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version
    }

    /// Adjusts the batch size for subsequent fetches.
    pub fn set_batch_size(&self, batch_size: u32) {
        self.wrapped.read().set_batch_size(batch_size);
    }

    /// The current batch size hint.
    pub fn batch_size(&self) -> u32 {
        self.wrapped.read().batch_size()
    }

    /// Yields the raw cursor and retires this wrapper, releasing its
    /// binding retention. Used when a resume steals the re-executed
    /// wrapper's underlying cursor.
    pub(crate) fn steal_raw(self) -> Arc<dyn RawChangeStreamCursor> {
        self.guard.mark_closed();
        self.binding.release();
        Arc::clone(&self.wrapped.read())
    }

    fn end_operation(&self) {
        if self.guard.finish() {
            self.close();
        }
    }

    /// Re-establishes the stream after a resumable failure.
    ///
    /// Failures in here surface to the caller as-is; the resume window
    /// covers only the original fetch.
    async fn resume(&self) -> Result<()> {
        let source = self.binding.read_connection_source().await?;
        let max_wire_version = source.server_description().max_wire_version;
        self.operation
            .set_resume_options(self.tokens.get(), max_wire_version);
        source.release();

        let replacement = Arc::clone(&self.operation)
            .execute(Arc::clone(&self.binding))
            .await?;
        let raw = replacement.steal_raw();
        if raw.is_closed() {
            return Err(Error::ChangeStream {
                message: "the re-established cursor was already closed".into(),
            });
        }
        *self.wrapped.write() = raw;
        debug!(max_wire_version, "change stream resumed");
        Ok(())
    }

    async fn fetch_with_resume(
        &self,
        kind: FetchKind,
    ) -> Result<(Option<Vec<RawDocumentBuf>>, Option<ResumeToken>)> {
        loop {
            let cursor = Arc::clone(&self.wrapped.read());
            let outcome = match kind {
                FetchKind::Next => cursor.next_batch().await,
                FetchKind::TryNext => cursor.try_next_batch().await,
            };
            match outcome {
                Ok(batch) => return Ok((batch, cursor.post_batch_resume_token())),
                Err(error) if is_resumable(&error, self.max_wire_version) => {
                    debug!(
                        %error,
                        operation = kind.name(),
                        "fetch failed with a resumable error, re-establishing the change stream"
                    );
                    cursor.close();
                    self.resume().await?;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl<T: DeserializeOwned> ChangeStreamCursor<T> {
    /// Fetches the next batch of events, waiting on the server.
    ///
    /// `None` signals the end of the stream; a delivered batch is never
    /// empty.
    pub async fn next(&self) -> Result<Option<Vec<T>>> {
        self.fetch(FetchKind::Next).await
    }

    /// Fetches whatever events are immediately available.
    ///
    /// An empty batch is a normal outcome, not an error.
    pub async fn try_next(&self) -> Result<Option<Vec<T>>> {
        self.fetch(FetchKind::TryNext).await
    }

    async fn fetch(&self, kind: FetchKind) -> Result<Option<Vec<T>>> {
        self.guard.begin(kind.name())?;
        let scope = OperationScope { cursor: self };
        let fetched = self.fetch_with_resume(kind).await;
        // A close requested mid-fetch runs here, before results surface.
        drop(scope);
        let (batch, post_batch) = fetched?;
        self.deliver(batch, post_batch)
    }

    /// Validates, decodes and delivers a completed batch, advancing the
    /// resume token only when the whole batch is sound.
    fn deliver(
        &self,
        batch: Option<Vec<RawDocumentBuf>>,
        post_batch: Option<ResumeToken>,
    ) -> Result<Option<Vec<T>>> {
        let Some(raw_events) = batch else {
            self.tokens.apply_batch(post_batch, None);
            return Ok(None);
        };

        let mut events = Vec::with_capacity(raw_events.len());
        let mut last_id = None;
        for raw in &raw_events {
            let id = match raw.get("_id") {
                Ok(Some(RawBsonRef::Document(id))) => ResumeToken::from_raw(id),
                Ok(_) => return Err(Error::MissingResumeToken),
                Err(error) => return Err(error.into()),
            };
            events.push(bson::from_slice(raw.as_bytes())?);
            last_id = Some(id);
        }

        self.tokens.apply_batch(post_batch, last_id);
        Ok(Some(events))
    }
}

impl<T> Drop for ChangeStreamCursor<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests;
