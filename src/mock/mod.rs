//! In-memory collaborators for exercising the change-stream core.
//!
//! These stand in for the command and connection layers in tests and in
//! downstream consumers' test suites: scripted raw cursors, a counting
//! binding, and an executor that records every aggregation it runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Document, RawDocumentBuf};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::binding::{ConnectionSource, ReadBinding, ServerDescription};
use crate::cursor::RawChangeStreamCursor;
use crate::error::{Error, Result};
use crate::operation::{AggregateExecutor, AggregatePlan};
use crate::token::ResumeToken;

/// Encodes a document as the raw batch entry the wire layer would produce.
pub fn raw_event(document: Document) -> RawDocumentBuf {
    let bytes = bson::to_vec(&document).expect("document encodes as BSON");
    RawDocumentBuf::from_bytes(bytes).expect("encoded document is valid BSON")
}

/// Builds an opaque resume token with a recognizable payload.
pub fn token(marker: &str) -> ResumeToken {
    ResumeToken::from_document(&doc! { "_data": marker }).expect("token document encodes")
}

/// Two-phase gate for holding a scripted fetch in flight.
///
/// The fetch parks on the gate until [`Gate::open`]; the test learns the
/// fetch has arrived through [`Gate::entered`].
pub struct Gate {
    entered: Semaphore,
    release: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    /// Resolves once a fetch has parked on the gate.
    pub async fn entered(&self) {
        if let Ok(permit) = self.entered.acquire().await {
            permit.forget();
        }
    }

    /// Lets the parked fetch proceed.
    pub fn open(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.add_permits(1);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

enum Step {
    Batch {
        events: Vec<RawDocumentBuf>,
        post_batch: Option<ResumeToken>,
    },
    End,
    Fail(Error),
    Hold(Arc<Gate>),
}

/// Scripted raw cursor: fetches replay enqueued steps in order.
///
/// An exhausted script behaves like a stream at its end.
pub struct MockRawCursor {
    steps: Mutex<VecDeque<Step>>,
    post_batch: Mutex<Option<ResumeToken>>,
    batch_size: Mutex<u32>,
    closed: AtomicBool,
    first_batch_empty: AtomicBool,
    max_wire_version: i32,
    next_calls: AtomicUsize,
    try_next_calls: AtomicUsize,
}

impl MockRawCursor {
    pub fn new(max_wire_version: i32) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            post_batch: Mutex::new(None),
            batch_size: Mutex::new(0),
            closed: AtomicBool::new(false),
            first_batch_empty: AtomicBool::new(false),
            max_wire_version,
            next_calls: AtomicUsize::new(0),
            try_next_calls: AtomicUsize::new(0),
        })
    }

    /// Scripts a batch with no post-batch token.
    pub fn enqueue_batch(&self, events: Vec<RawDocumentBuf>) {
        self.steps.lock().push_back(Step::Batch {
            events,
            post_batch: None,
        });
    }

    /// Scripts a batch carrying a post-batch resume token.
    pub fn enqueue_batch_with_token(&self, events: Vec<RawDocumentBuf>, post_batch: ResumeToken) {
        self.steps.lock().push_back(Step::Batch {
            events,
            post_batch: Some(post_batch),
        });
    }

    /// Scripts the end of the stream.
    pub fn enqueue_end(&self) {
        self.steps.lock().push_back(Step::End);
    }

    /// Scripts a failed fetch.
    pub fn enqueue_error(&self, error: Error) {
        self.steps.lock().push_back(Step::Fail(error));
    }

    /// Scripts a fetch that parks on the gate before taking its next step.
    pub fn enqueue_hold(&self, gate: Arc<Gate>) {
        self.steps.lock().push_back(Step::Hold(gate));
    }

    /// Marks the server-side cursor as already gone.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Flags the opening batch as empty.
    pub fn set_first_batch_empty(&self, empty: bool) {
        self.first_batch_empty.store(empty, Ordering::SeqCst);
    }

    /// Whether `close` has been called.
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `next_batch` calls observed.
    pub fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    /// Number of `try_next_batch` calls observed.
    pub fn try_next_calls(&self) -> usize {
        self.try_next_calls.load(Ordering::SeqCst)
    }

    async fn step(&self) -> Result<Option<Vec<RawDocumentBuf>>> {
        loop {
            let step = self.steps.lock().pop_front();
            match step {
                None | Some(Step::End) => return Ok(None),
                Some(Step::Hold(gate)) => gate.pass().await,
                Some(Step::Batch { events, post_batch }) => {
                    if post_batch.is_some() {
                        *self.post_batch.lock() = post_batch;
                    }
                    return Ok(Some(events));
                }
                Some(Step::Fail(error)) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl RawChangeStreamCursor for MockRawCursor {
    async fn next_batch(&self) -> Result<Option<Vec<RawDocumentBuf>>> {
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        self.step().await
    }

    async fn try_next_batch(&self) -> Result<Option<Vec<RawDocumentBuf>>> {
        self.try_next_calls.fetch_add(1, Ordering::SeqCst);
        self.step().await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_batch_size(&self, batch_size: u32) {
        *self.batch_size.lock() = batch_size;
    }

    fn batch_size(&self) -> u32 {
        *self.batch_size.lock()
    }

    fn post_batch_resume_token(&self) -> Option<ResumeToken> {
        self.post_batch.lock().clone()
    }

    fn is_first_batch_empty(&self) -> bool {
        self.first_batch_empty.load(Ordering::SeqCst)
    }

    fn max_wire_version(&self) -> i32 {
        self.max_wire_version
    }
}

/// Counting binding: tracks retain/release pairs and hands out sources
/// advertising a configurable wire version.
pub struct MockReadBinding {
    retains: AtomicUsize,
    releases: AtomicUsize,
    source_wire_version: Mutex<i32>,
    source_releases: Arc<AtomicUsize>,
    fail_next_source: Mutex<Option<Error>>,
}

impl MockReadBinding {
    pub fn new(max_wire_version: i32) -> Arc<Self> {
        Arc::new(Self {
            retains: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            source_wire_version: Mutex::new(max_wire_version),
            source_releases: Arc::new(AtomicUsize::new(0)),
            fail_next_source: Mutex::new(None),
        })
    }

    /// Changes the wire version subsequently acquired sources advertise.
    pub fn set_source_wire_version(&self, max_wire_version: i32) {
        *self.source_wire_version.lock() = max_wire_version;
    }

    /// Makes the next source acquisition fail.
    pub fn fail_next_source(&self, error: Error) {
        *self.fail_next_source.lock() = Some(error);
    }

    /// Number of `retain` calls observed.
    pub fn retain_count(&self) -> usize {
        self.retains.load(Ordering::SeqCst)
    }

    /// Number of `release` calls observed.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Number of connection sources returned to the pool.
    pub fn source_release_count(&self) -> usize {
        self.source_releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadBinding for MockReadBinding {
    fn retain(&self) {
        self.retains.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    async fn read_connection_source(&self) -> Result<Box<dyn ConnectionSource>> {
        if let Some(error) = self.fail_next_source.lock().take() {
            return Err(error);
        }
        Ok(Box::new(MockConnectionSource {
            description: ServerDescription::new(*self.source_wire_version.lock()),
            releases: Arc::clone(&self.source_releases),
        }))
    }
}

/// Source handed out by [`MockReadBinding`].
pub struct MockConnectionSource {
    description: ServerDescription,
    releases: Arc<AtomicUsize>,
}

impl ConnectionSource for MockConnectionSource {
    fn server_description(&self) -> ServerDescription {
        self.description
    }

    fn release(self: Box<Self>) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted executor: records every plan it runs and hands out enqueued
/// cursors (or failures) in order.
#[derive(Default)]
pub struct MockAggregateExecutor {
    cursors: Mutex<VecDeque<Result<Arc<MockRawCursor>>>>,
    plans: Mutex<Vec<AggregatePlan>>,
}

impl MockAggregateExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Scripts the cursor the next execution yields.
    pub fn enqueue_cursor(&self, cursor: Arc<MockRawCursor>) {
        self.cursors.lock().push_back(Ok(cursor));
    }

    /// Scripts the next execution to fail.
    pub fn enqueue_failure(&self, error: Error) {
        self.cursors.lock().push_back(Err(error));
    }

    /// Every plan executed so far, in order.
    pub fn plans(&self) -> Vec<AggregatePlan> {
        self.plans.lock().clone()
    }

    /// Number of executions observed.
    pub fn executions(&self) -> usize {
        self.plans.lock().len()
    }
}

#[async_trait]
impl AggregateExecutor for MockAggregateExecutor {
    async fn run(
        &self,
        plan: AggregatePlan,
        _binding: Arc<dyn ReadBinding>,
    ) -> Result<Arc<dyn RawChangeStreamCursor>> {
        self.plans.lock().push(plan);
        match self.cursors.lock().pop_front() {
            Some(Ok(cursor)) => Ok(cursor),
            Some(Err(error)) => Err(error),
            None => Err(Error::ChangeStream {
                message: "mock executor script exhausted".into(),
            }),
        }
    }
}
