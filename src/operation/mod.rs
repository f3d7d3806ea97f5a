//! Change stream aggregation descriptor.
//!
//! [`ChangeStreamOperation`] is the immutable identity of the server-side
//! aggregation (target, pipeline, options) plus the mutable resume
//! parameters the resumable cursor installs before re-executing. Execution
//! itself goes through the [`AggregateExecutor`] seam.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document, Timestamp};
use parking_lot::Mutex;
use tracing::debug;

use crate::binding::ReadBinding;
use crate::cursor::{ChangeStreamCursor, RawChangeStreamCursor};
use crate::error::Result;
use crate::options::ChangeStreamOptions;
use crate::token::ResumeToken;

mod target;

pub use target::StreamTarget;

/// First wire version at which a stream may be pinned to an operation time.
const START_AT_OPERATION_TIME_WIRE_VERSION: i32 = 7;

/// A fully composed aggregation, ready for the command layer.
#[derive(Debug, Clone)]
pub struct AggregatePlan {
    /// Database the aggregate command runs against.
    pub database: String,
    /// Target collection; `None` aggregates the whole database.
    pub collection: Option<String>,
    /// Pipeline with the `$changeStream` stage prepended.
    pub pipeline: Vec<Document>,
    /// Server-side batch size hint.
    pub batch_size: Option<u32>,
    /// How long the server may block a getMore waiting for events.
    pub max_await_time: Option<Duration>,
}

/// Runs an aggregation against the server and yields a raw batch cursor.
///
/// Implemented by the driver's command layer; in-memory in [`crate::mock`].
#[async_trait]
pub trait AggregateExecutor: Send + Sync {
    /// Executes the plan over a connection from the binding.
    async fn run(
        &self,
        plan: AggregatePlan,
        binding: Arc<dyn ReadBinding>,
    ) -> Result<Arc<dyn RawChangeStreamCursor>>;
}

/// Start-position parameters, rewritten by the cursor on resume.
#[derive(Debug, Clone, Default)]
struct ResumeState {
    resume_after: Option<ResumeToken>,
    start_after: Option<ResumeToken>,
    start_at_operation_time: Option<Timestamp>,
}

/// Describes a change-stream aggregation and re-executes it on demand.
///
/// Only the resumable cursor mutates the resume parameters; everything else
/// is fixed at construction.
pub struct ChangeStreamOperation<T> {
    target: StreamTarget,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    executor: Arc<dyn AggregateExecutor>,
    resume: Mutex<ResumeState>,
    _event: PhantomData<fn() -> T>,
}

impl<T> ChangeStreamOperation<T> {
    /// Describes a change stream over `target`, filtered by the caller's
    /// `pipeline` stages.
    pub fn new(
        target: StreamTarget,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        executor: Arc<dyn AggregateExecutor>,
    ) -> Result<Self> {
        options.validate()?;
        let resume = ResumeState {
            resume_after: options.resume_after.clone(),
            start_after: options.start_after.clone(),
            start_at_operation_time: options.start_at_operation_time,
        };
        Ok(Self {
            target,
            pipeline,
            options,
            executor,
            resume: Mutex::new(resume),
            _event: PhantomData,
        })
    }

    /// Opens the stream using the current resume parameters.
    pub async fn execute(
        self: Arc<Self>,
        binding: Arc<dyn ReadBinding>,
    ) -> Result<ChangeStreamCursor<T>> {
        let plan = self.plan()?;
        debug!(
            database = %plan.database,
            collection = ?plan.collection,
            "executing change stream aggregation"
        );
        let raw = self.executor.run(plan, Arc::clone(&binding)).await?;
        let max_wire_version = raw.max_wire_version();
        let seed = self.resume_seed();
        Ok(ChangeStreamCursor::new(
            self,
            raw,
            binding,
            seed,
            max_wire_version,
        ))
    }

    /// Installs the parameters the next `execute` resumes with.
    ///
    /// A cached token wins outright: the stream resumes immediately after
    /// it. With no token, an operation-time pin survives only on servers
    /// new enough to honor it; a user-supplied `startAfter` always stands.
    pub fn set_resume_options(&self, resume_token: Option<ResumeToken>, max_wire_version: i32) {
        let mut resume = self.resume.lock();
        resume.start_at_operation_time = None;
        if let Some(token) = resume_token {
            resume.start_after = None;
            resume.resume_after = Some(token);
        } else if max_wire_version >= START_AT_OPERATION_TIME_WIRE_VERSION {
            resume.start_at_operation_time = self.options.start_at_operation_time;
        }
    }

    /// The logical clock pin the stream starts at, if any remains in effect.
    pub fn start_at_operation_time(&self) -> Option<Timestamp> {
        self.resume.lock().start_at_operation_time
    }

    /// The position a freshly executed cursor starts from.
    fn resume_seed(&self) -> Option<ResumeToken> {
        let resume = self.resume.lock();
        resume
            .resume_after
            .clone()
            .or_else(|| resume.start_after.clone())
    }

    /// Composes the `$changeStream` stage from options and resume state.
    fn change_stream_stage(&self) -> Result<Document> {
        let mut stage = Document::new();
        if let Some(mode) = self.options.full_document {
            stage.insert("fullDocument", mode.as_str());
        }
        if self.target.all_changes_for_cluster() {
            stage.insert("allChangesForCluster", true);
        }
        let resume = self.resume.lock();
        if let Some(token) = &resume.resume_after {
            stage.insert("resumeAfter", token.to_document()?);
        }
        if let Some(token) = &resume.start_after {
            stage.insert("startAfter", token.to_document()?);
        }
        if let Some(operation_time) = resume.start_at_operation_time {
            stage.insert("startAtOperationTime", operation_time);
        }
        Ok(doc! { "$changeStream": stage })
    }

    fn plan(&self) -> Result<AggregatePlan> {
        let mut pipeline = Vec::with_capacity(self.pipeline.len() + 1);
        pipeline.push(self.change_stream_stage()?);
        pipeline.extend(self.pipeline.iter().cloned());
        Ok(AggregatePlan {
            database: self.target.database().to_string(),
            collection: self.target.collection().map(str::to_string),
            pipeline,
            batch_size: self.options.batch_size,
            max_await_time: self.options.max_await_time,
        })
    }
}
