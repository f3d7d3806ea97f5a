use std::sync::Arc;

use bson::{doc, Document, Timestamp};
use serde::Deserialize;

use crate::error::Error;
use crate::mock::{raw_event, token, Gate, MockAggregateExecutor, MockRawCursor, MockReadBinding};
use crate::operation::{ChangeStreamOperation, StreamTarget};
use crate::options::ChangeStreamOptions;

use super::lifecycle::{CloseDecision, LifecycleGuard};
use super::*;

const WIRE: i32 = 9;

fn target() -> StreamTarget {
    StreamTarget::Collection {
        database: "shop".into(),
        collection: "orders".into(),
    }
}

fn event(marker: &str, v: i32) -> bson::RawDocumentBuf {
    raw_event(doc! { "_id": { "_data": marker }, "v": v })
}

struct Fixture {
    executor: Arc<MockAggregateExecutor>,
    binding: Arc<MockReadBinding>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            executor: MockAggregateExecutor::new(),
            binding: MockReadBinding::new(WIRE),
        }
    }

    async fn open<T>(&self, options: ChangeStreamOptions) -> ChangeStreamCursor<T> {
        let operation = Arc::new(
            ChangeStreamOperation::new(target(), Vec::new(), options, self.executor.clone())
                .unwrap(),
        );
        operation.execute(self.binding.clone()).await.unwrap()
    }
}

// Lifecycle guard transition table.

#[test]
fn test_guard_fetch_begins_and_finishes() {
    let guard = LifecycleGuard::default();
    guard.begin("next()").unwrap();
    assert!(!guard.finish());
    assert!(!guard.is_closed());
}

#[test]
fn test_guard_close_defers_while_fetch_in_flight() {
    let guard = LifecycleGuard::default();
    guard.begin("next()").unwrap();

    assert_eq!(guard.request_close(), CloseDecision::Deferred);
    assert!(guard.is_closed());

    // The completing fetch drains the pending close.
    assert!(guard.finish());
    assert_eq!(guard.request_close(), CloseDecision::CloseNow);
    assert_eq!(guard.request_close(), CloseDecision::AlreadyClosed);
}

#[test]
fn test_guard_close_when_idle_is_immediate() {
    let guard = LifecycleGuard::default();
    assert_eq!(guard.request_close(), CloseDecision::CloseNow);
    assert_eq!(guard.request_close(), CloseDecision::AlreadyClosed);
}

#[test]
fn test_guard_rejects_fetch_after_close() {
    let guard = LifecycleGuard::default();
    guard.request_close();
    assert!(matches!(
        guard.begin("next()"),
        Err(Error::CursorClosed { operation: "next()" })
    ));
}

#[test]
fn test_guard_rejects_concurrent_fetch() {
    let guard = LifecycleGuard::default();
    guard.begin("next()").unwrap();
    assert!(matches!(
        guard.begin("try_next()"),
        Err(Error::FetchInProgress {
            operation: "try_next()"
        })
    ));
}

// State machine.

#[tokio::test]
async fn test_next_decodes_batches_and_advances_token() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_batch(vec![event("t1", 1)]);
    raw.enqueue_batch(vec![event("t2a", 2), event("t2", 3)]);
    raw.enqueue_end();
    fx.executor.enqueue_cursor(raw);

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let batch = cursor.next().await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].get_i32("v").unwrap(), 1);
    assert_eq!(cursor.resume_token(), Some(token("t1")));

    let batch = cursor.next().await.unwrap().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(cursor.resume_token(), Some(token("t2")));

    assert_eq!(cursor.next().await.unwrap(), None::<Vec<Document>>);
    assert_eq!(cursor.resume_token(), Some(token("t2")));
}

#[tokio::test]
async fn test_post_batch_token_takes_precedence_over_last_id() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_batch_with_token(vec![event("t1", 1)], token("t1-post"));
    fx.executor.enqueue_cursor(raw);

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;
    cursor.next().await.unwrap();

    assert_eq!(cursor.resume_token(), Some(token("t1-post")));
    assert_eq!(cursor.post_batch_resume_token(), Some(token("t1-post")));
}

#[tokio::test]
async fn test_try_next_delivers_empty_batches_and_post_batch_progress() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_batch(Vec::new());
    raw.enqueue_batch_with_token(Vec::new(), token("pb"));
    fx.executor.enqueue_cursor(raw);

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let batch = cursor.try_next().await.unwrap().unwrap();
    assert!(batch.is_empty());
    assert_eq!(cursor.resume_token(), None);

    // An empty batch still advances the position through its post-batch
    // token.
    let batch = cursor.try_next().await.unwrap().unwrap();
    assert!(batch.is_empty());
    assert_eq!(cursor.resume_token(), Some(token("pb")));
}

#[tokio::test]
async fn test_resume_on_transient_error_is_invisible_to_caller() {
    let fx = Fixture::new();
    let first = MockRawCursor::new(WIRE);
    first.enqueue_batch(vec![event("t1", 1)]);
    first.enqueue_error(
        Error::server(189, "primary stepped down")
            .with_label(crate::error::RESUMABLE_CHANGE_STREAM_LABEL),
    );
    let second = MockRawCursor::new(WIRE);
    second.enqueue_batch(vec![event("t2", 2)]);
    fx.executor.enqueue_cursor(first.clone());
    fx.executor.enqueue_cursor(second.clone());

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let batch = cursor.next().await.unwrap().unwrap();
    assert_eq!(batch[0].get_i32("v").unwrap(), 1);

    // The failing fetch resumes transparently and delivers the next batch.
    let batch = cursor.next().await.unwrap().unwrap();
    assert_eq!(batch[0].get_i32("v").unwrap(), 2);

    assert!(first.was_closed());
    assert!(!second.was_closed());
    assert_eq!(fx.binding.source_release_count(), 1);

    // The re-executed aggregation resumed from the cached token.
    let plans = fx.executor.plans();
    assert_eq!(plans.len(), 2);
    assert_eq!(
        plans[1].pipeline[0]
            .get_document("$changeStream")
            .unwrap()
            .get_document("resumeAfter")
            .unwrap(),
        &doc! { "_data": "t1" }
    );

    // One retain per wrapper; the resume wrapper's retention was released
    // at the steal, the original's at close.
    cursor.close();
    assert_eq!(fx.binding.retain_count(), 2);
    assert_eq!(fx.binding.release_count(), 2);
}

#[tokio::test]
async fn test_resume_retries_the_original_fetch_variant() {
    let fx = Fixture::new();
    let first = MockRawCursor::new(WIRE);
    first.enqueue_error(Error::network("connection reset"));
    let second = MockRawCursor::new(WIRE);
    second.enqueue_batch(vec![event("t1", 1)]);
    fx.executor.enqueue_cursor(first.clone());
    fx.executor.enqueue_cursor(second.clone());

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;
    cursor.try_next().await.unwrap();

    assert_eq!(first.try_next_calls(), 1);
    assert_eq!(second.try_next_calls(), 1);
    assert_eq!(first.next_calls() + second.next_calls(), 0);
}

#[tokio::test]
async fn test_missing_resume_token_aborts_without_advancing() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_batch(vec![raw_event(doc! { "v": 1 })]);
    raw.enqueue_batch(vec![event("t1", 2)]);
    fx.executor.enqueue_cursor(raw);

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(error, Error::MissingResumeToken));
    assert_eq!(cursor.resume_token(), None);
    assert!(!cursor.is_closed());

    // The cursor stays usable.
    let batch = cursor.next().await.unwrap().unwrap();
    assert_eq!(batch[0].get_i32("v").unwrap(), 2);
    assert_eq!(cursor.resume_token(), Some(token("t1")));
}

#[derive(Debug, Deserialize)]
struct TypedEvent {
    #[serde(rename = "_id")]
    #[allow(dead_code)]
    id: Document,
    #[allow(dead_code)]
    v: i32,
}

#[tokio::test]
async fn test_decode_error_surfaces_without_advancing() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_batch(vec![raw_event(
        doc! { "_id": { "_data": "t1" }, "v": "not a number" },
    )]);
    fx.executor.enqueue_cursor(raw);

    let cursor: ChangeStreamCursor<TypedEvent> = fx.open(ChangeStreamOptions::default()).await;

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(error, Error::Decode { .. }));
    assert_eq!(cursor.resume_token(), None);
    assert!(!cursor.is_closed());
}

#[tokio::test]
async fn test_non_resumable_server_error_surfaces() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_error(Error::server(13, "not authorized"));
    fx.executor.enqueue_cursor(raw);

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let error = cursor.next().await.unwrap_err();
    assert_eq!(error.code(), Some(13));
    assert_eq!(fx.executor.executions(), 1);
    assert!(!cursor.is_closed());
}

#[tokio::test]
async fn test_resume_setup_failure_replaces_original_error() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_error(Error::network("connection reset"));
    fx.executor.enqueue_cursor(raw);
    fx.binding.fail_next_source(Error::Authorization {
        message: "session expired".into(),
    });

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(error, Error::Authorization { .. }));
    assert!(!cursor.is_closed());

    cursor.close();
    assert_eq!(fx.binding.release_count(), 1);
}

#[tokio::test]
async fn test_failed_reexecution_surfaces_without_reclassification() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_error(Error::network("connection reset"));
    fx.executor.enqueue_cursor(raw);
    // A resumable-looking error from the re-execution itself must surface.
    fx.executor
        .enqueue_failure(Error::server(91, "shutdown in progress"));

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let error = cursor.next().await.unwrap_err();
    assert_eq!(error.code(), Some(91));
    assert_eq!(fx.executor.executions(), 2);
}

#[tokio::test]
async fn test_reexecution_yielding_closed_cursor_is_fatal() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_error(Error::network("connection reset"));
    let dead = MockRawCursor::new(WIRE);
    dead.mark_closed();
    fx.executor.enqueue_cursor(raw);
    fx.executor.enqueue_cursor(dead);

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(error, Error::ChangeStream { .. }));

    // The stolen wrapper's retention was still balanced.
    cursor.close();
    assert_eq!(fx.binding.retain_count(), 2);
    assert_eq!(fx.binding.release_count(), 2);
}

#[tokio::test]
async fn test_fetch_after_close_is_rejected_by_name() {
    let fx = Fixture::new();
    fx.executor.enqueue_cursor(MockRawCursor::new(WIRE));

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;
    cursor.close();

    let error = cursor.next().await.unwrap_err();
    assert_eq!(
        error.to_string(),
        "next() called after the cursor was closed."
    );
    let error = cursor.try_next().await.unwrap_err();
    assert_eq!(
        error.to_string(),
        "try_next() called after the cursor was closed."
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    fx.executor.enqueue_cursor(raw.clone());

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;
    cursor.close();
    cursor.close();
    cursor.close();

    assert!(raw.was_closed());
    assert_eq!(fx.binding.release_count(), 1);
}

#[tokio::test]
async fn test_drop_closes_the_cursor() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    fx.executor.enqueue_cursor(raw.clone());

    let cursor: ChangeStreamCursor<Document> = fx.open(ChangeStreamOptions::default()).await;
    drop(cursor);

    assert!(raw.was_closed());
    assert_eq!(fx.binding.release_count(), 1);
}

#[tokio::test]
async fn test_close_during_inflight_next_defers_teardown() {
    let fx = Fixture::new();
    let gate = Gate::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_hold(gate.clone());
    raw.enqueue_batch(vec![event("t1", 1)]);
    fx.executor.enqueue_cursor(raw.clone());

    let cursor: Arc<ChangeStreamCursor<Document>> =
        Arc::new(fx.open(ChangeStreamOptions::default()).await);
    let fetcher = {
        let cursor = Arc::clone(&cursor);
        tokio::spawn(async move { cursor.next().await })
    };
    gate.entered().await;

    cursor.close();
    assert!(cursor.is_closed());
    // Teardown waits for the in-flight fetch.
    assert!(!raw.was_closed());
    assert_eq!(fx.binding.release_count(), 0);

    gate.open();
    let batch = fetcher.await.unwrap().unwrap().unwrap();
    assert_eq!(batch[0].get_i32("v").unwrap(), 1);

    assert!(raw.was_closed());
    assert_eq!(fx.binding.release_count(), 1);

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(error, Error::CursorClosed { .. }));
}

#[tokio::test]
async fn test_second_fetch_rejected_while_one_is_in_flight() {
    let fx = Fixture::new();
    let gate = Gate::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_hold(gate.clone());
    raw.enqueue_batch(vec![event("t1", 1)]);
    fx.executor.enqueue_cursor(raw);

    let cursor: Arc<ChangeStreamCursor<Document>> =
        Arc::new(fx.open(ChangeStreamOptions::default()).await);
    let fetcher = {
        let cursor = Arc::clone(&cursor);
        tokio::spawn(async move { cursor.next().await })
    };
    gate.entered().await;

    let error = cursor.try_next().await.unwrap_err();
    assert!(matches!(
        error,
        Error::FetchInProgress {
            operation: "try_next()"
        }
    ));

    gate.open();
    fetcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancelled_fetch_still_runs_deferred_close() {
    let fx = Fixture::new();
    let gate = Gate::new();
    let raw = MockRawCursor::new(WIRE);
    raw.enqueue_hold(gate.clone());
    raw.enqueue_batch(vec![event("t1", 1)]);
    fx.executor.enqueue_cursor(raw.clone());

    let cursor: Arc<ChangeStreamCursor<Document>> =
        Arc::new(fx.open(ChangeStreamOptions::default()).await);
    let fetcher = {
        let cursor = Arc::clone(&cursor);
        tokio::spawn(async move { cursor.next().await })
    };
    gate.entered().await;

    cursor.close();
    fetcher.abort();
    assert!(fetcher.await.unwrap_err().is_cancelled());

    assert!(raw.was_closed());
    assert_eq!(fx.binding.release_count(), 1);
}

#[tokio::test]
async fn test_observers_pass_through_to_the_underlying_cursor() {
    let fx = Fixture::new();
    let raw = MockRawCursor::new(WIRE);
    raw.set_first_batch_empty(true);
    fx.executor.enqueue_cursor(raw.clone());

    let pin = Timestamp {
        time: 77,
        increment: 1,
    };
    let cursor: ChangeStreamCursor<Document> = fx
        .open(ChangeStreamOptions::default().start_at_operation_time(pin))
        .await;

    assert!(cursor.is_first_batch_empty());
    assert_eq!(cursor.max_wire_version(), WIRE);
    assert_eq!(cursor.operation_time(), Some(pin));

    cursor.set_batch_size(16);
    assert_eq!(cursor.batch_size(), 16);
    assert_eq!(raw.batch_size(), 16);
}
