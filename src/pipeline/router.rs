//! The routing state machine.
//!
//! Flow per task:
//! 1. `submit` creates the record (Received) and queues it for the pool
//! 2. a worker claims it (Received → Classifying); losing the claim means
//!    another worker owns the task and this one walks away
//! 3. classify and persist the outcome (Classifying → Processing)
//! 4. resolve a handler through the registry and invoke it under a timeout
//! 5. finalize (Processing → Done | Failed)
//!
//! Every transition is a compare-and-swap re-derived from freshly read
//! state, so no lock is ever held across a task. Once a task is claimed,
//! store failures end it Failed with `InternalError`; history writes are
//! best-effort and never stop the pipeline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::error::{ErrorKind, ExtractionError, RouterError, StoreError};
use crate::handlers::{self, Handler};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::registry::SharedRegistry;
use crate::pipeline::types::{Classification, RawInput, SubmitOptions};
use crate::pipeline::worker::{Job, WorkerPool};
use crate::store::CorrelationStore;
use crate::task::model::{ExtractedFields, HistoryEntry, TaskError, TaskRecord, TaskStatus};

/// How a `run` ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// This run drove the task to a terminal status.
    Finished(TaskStatus),
    /// Another worker already owns the task; nothing was done.
    Abandoned,
    /// The task was already terminal when a result arrived; it was dropped.
    Discarded,
}

/// Result of one CAS-guarded transition.
enum Advance {
    Applied(TaskRecord),
    /// The record moved somewhere the transition no longer applies from.
    Superseded(TaskStatus),
}

/// Executes tasks. Shared by the router front-end and the worker pool.
pub struct TaskRunner {
    store: Arc<dyn CorrelationStore>,
    classifier: Arc<Classifier>,
    registry: Arc<SharedRegistry>,
    config: RouterConfig,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        classifier: Arc<Classifier>,
        registry: Arc<SharedRegistry>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            registry,
            config,
        }
    }

    /// Drive one task from Received to a terminal status.
    pub async fn run(&self, task_id: &str, input: RawInput) -> Result<RunOutcome, RouterError> {
        // 1. Claim
        match self.advance(task_id, TaskStatus::Classifying, |_| {}).await {
            Ok(Advance::Applied(_)) => {
                debug!(task_id = %task_id, "Task claimed");
            }
            Ok(Advance::Superseded(status)) => {
                debug!(task_id = %task_id, status = %status, "Task already claimed, abandoning");
                return Ok(RunOutcome::Abandoned);
            }
            Err(RouterError::Contention { .. }) => {
                debug!(task_id = %task_id, "Lost claim under contention, abandoning");
                return Ok(RunOutcome::Abandoned);
            }
            Err(e) => return Err(e),
        }

        // 2. Classify
        let classification = self.classifier.classify(&input).await;
        let applied = self
            .advance(task_id, TaskStatus::Processing, |r| {
                r.format = classification.format;
                r.intent = classification.intent;
                r.confidence = Some(classification.confidence);
            })
            .await;
        let record = match applied {
            Ok(Advance::Applied(record)) => record,
            Ok(Advance::Superseded(status)) => {
                warn!(task_id = %task_id, status = %status, "Task moved while classifying, abandoning");
                return Ok(RunOutcome::Abandoned);
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Could not record classification");
                let message = format!("could not record classification: {e}");
                return self.fail_unclassified(task_id, message).await;
            }
        };
        self.append(
            task_id,
            HistoryEntry::new(TaskStatus::Processing, "classifier", classification.note()),
        )
        .await;
        info!(
            task_id = %task_id,
            format = %record.format,
            intent = %record.intent,
            confidence = classification.confidence,
            "Task classified"
        );

        // 3. Resolve
        let registry = self.registry.snapshot().await;
        let Some(handler) = registry.resolve(record.format, record.intent) else {
            let message = format!("no handler for {}/{}", record.format, record.intent);
            return self
                .finish_failed(task_id, None, ErrorKind::NoCapableHandler, message)
                .await;
        };

        // 4. Invoke
        let outcome = self.invoke(handler.as_ref(), &input, &classification).await;

        // 5. Finalize
        match outcome {
            Ok(fields) => self.finish_done(task_id, handler.name(), fields).await,
            Err((kind, message)) => {
                self.finish_failed(task_id, Some(handler.name()), kind, message)
                    .await
            }
        }
    }

    async fn invoke(
        &self,
        handler: &dyn Handler,
        input: &RawInput,
        classification: &Classification,
    ) -> Result<ExtractedFields, (ErrorKind, String)> {
        let call = handler.process(input, classification.format, classification.intent);
        match tokio::time::timeout(self.config.handler_timeout, call).await {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(e)) => Err((e.kind(), extraction_message(&e))),
            Err(_) => Err((
                ErrorKind::Timeout,
                format!(
                    "handler {} timed out after {:?}",
                    handler.name(),
                    self.config.handler_timeout
                ),
            )),
        }
    }

    /// The task is claimed but its classification never landed. Failed is
    /// only reachable from Processing, so walk it there first.
    async fn fail_unclassified(&self, task_id: &str, message: String) -> Result<RunOutcome, RouterError> {
        match self.advance(task_id, TaskStatus::Processing, |_| {}).await {
            Ok(Advance::Applied(_)) => {
                self.append(
                    task_id,
                    HistoryEntry::new(TaskStatus::Processing, "router", "classification not recorded"),
                )
                .await;
            }
            // A timed-out CAS may have landed after all.
            Ok(Advance::Superseded(TaskStatus::Processing)) => {}
            Ok(Advance::Superseded(status)) => {
                warn!(task_id = %task_id, status = %status, "Task moved while recovering, abandoning");
                return Ok(RunOutcome::Abandoned);
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Task left in Classifying");
                return Err(e);
            }
        }
        self.finish_failed(task_id, None, ErrorKind::InternalError, message)
            .await
    }

    async fn finish_done(
        &self,
        task_id: &str,
        handler: &str,
        fields: ExtractedFields,
    ) -> Result<RunOutcome, RouterError> {
        let summary = handlers::summarize(&fields);
        let applied = self
            .advance(task_id, TaskStatus::Done, |r| {
                r.handler = Some(handler.to_string());
                r.extracted_fields = Some(fields.clone());
            })
            .await;

        match applied {
            Ok(Advance::Applied(_)) => {
                self.append(task_id, HistoryEntry::new(TaskStatus::Done, handler, summary))
                    .await;
                info!(task_id = %task_id, handler, "Task done");
                Ok(RunOutcome::Finished(TaskStatus::Done))
            }
            Ok(Advance::Superseded(status)) => {
                warn!(task_id = %task_id, status = %status, "Late handler result ignored");
                Ok(RunOutcome::Discarded)
            }
            Err(e) => {
                let message = match &e {
                    RouterError::Contention { attempts, .. } => {
                        format!("could not record result after {attempts} CAS attempts")
                    }
                    other => format!("could not record result: {other}"),
                };
                self.finish_failed(task_id, Some(handler), ErrorKind::InternalError, message)
                    .await
            }
        }
    }

    async fn finish_failed(
        &self,
        task_id: &str,
        handler: Option<&str>,
        kind: ErrorKind,
        message: String,
    ) -> Result<RunOutcome, RouterError> {
        let actor = handler.unwrap_or("router");
        let applied = self
            .advance(task_id, TaskStatus::Failed, |r| {
                if let Some(h) = handler {
                    r.handler = Some(h.to_string());
                }
                r.error = Some(TaskError {
                    kind,
                    message: message.clone(),
                });
            })
            .await;

        match applied {
            Ok(Advance::Applied(_)) => {
                self.append(
                    task_id,
                    HistoryEntry::new(TaskStatus::Failed, actor, message.clone()),
                )
                .await;
                warn!(task_id = %task_id, kind = %kind, %message, "Task failed");
                Ok(RunOutcome::Finished(TaskStatus::Failed))
            }
            Ok(Advance::Superseded(status)) => {
                warn!(task_id = %task_id, status = %status, "Late failure ignored");
                Ok(RunOutcome::Discarded)
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Could not record task failure");
                Err(e)
            }
        }
    }

    /// CAS-guarded transition with bounded retry. `mutate` runs against a
    /// fresh copy of the record on every attempt.
    async fn advance<F>(&self, task_id: &str, target: TaskStatus, mutate: F) -> Result<Advance, RouterError>
    where
        F: Fn(&mut TaskRecord) + Send + Sync,
    {
        let attempts = self.config.max_cas_attempts.max(1);
        for attempt in 1..=attempts {
            let mut record = self.timed("get", self.store.get(task_id)).await?;
            if !record.status.can_transition_to(target) {
                return Ok(Advance::Superseded(record.status));
            }

            let expected = record.version;
            record.transition_to(target)?;
            mutate(&mut record);

            match self
                .timed("compare_and_swap", self.store.compare_and_swap(task_id, expected, &record))
                .await
            {
                Ok(version) => {
                    record.version = version;
                    return Ok(Advance::Applied(record));
                }
                Err(StoreError::VersionConflict { actual, .. }) => {
                    debug!(
                        task_id = %task_id,
                        attempt,
                        expected,
                        actual,
                        target = %target,
                        "CAS conflict, retrying"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RouterError::Contention {
            task_id: task_id.to_string(),
            attempts,
        })
    }

    /// Best-effort history write: a lost entry is logged and the task moves
    /// on. A timed-out append may still land, so only hard failures retry.
    async fn append(&self, task_id: &str, entry: HistoryEntry) {
        let attempts = self.config.max_cas_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .timed("append_history", self.store.append_history(task_id, &entry))
                .await
            {
                Ok(_) => return,
                Err(e @ StoreError::Timeout { .. }) => {
                    warn!(task_id = %task_id, status = %entry.status, error = %e, "History entry may be lost");
                    return;
                }
                Err(e) if attempt < attempts => {
                    debug!(task_id = %task_id, attempt, error = %e, "History append failed, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    warn!(task_id = %task_id, status = %entry.status, error = %e, "History entry lost");
                }
            }
        }
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        timed(self.config.store_timeout, op, call).await
    }
}

/// Bound a store call by `after`.
async fn timed<T>(
    after: Duration,
    op: &'static str,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => {
            error!(op, ?after, "Store call timed out");
            Err(StoreError::Timeout { op, after })
        }
    }
}

/// Randomized backoff that grows with the attempt number.
fn backoff(attempt: u32) -> Duration {
    let ceiling = 5 * u64::from(attempt.min(8));
    let millis = rand::thread_rng().gen_range(1..=ceiling);
    Duration::from_millis(millis)
}

fn extraction_message(e: &ExtractionError) -> String {
    match e {
        ExtractionError::MissingRequiredField { field } => format!("missing required field: {field}"),
        ExtractionError::SchemaInvalid { reason } | ExtractionError::MalformedInput { reason } => {
            reason.clone()
        }
    }
}

// ── Router front-end ────────────────────────────────────────────────

/// Accepts submissions and feeds them to the worker pool.
pub struct Router {
    store: Arc<dyn CorrelationStore>,
    runner: Arc<TaskRunner>,
    queue: mpsc::Sender<Job>,
    store_timeout: Duration,
}

impl Router {
    /// Build the router and start its worker pool. Must be called inside a
    /// tokio runtime. Dropping the router closes the queue; the pool then
    /// drains what was already queued and stops.
    pub fn start(
        store: Arc<dyn CorrelationStore>,
        classifier: Arc<Classifier>,
        registry: Arc<SharedRegistry>,
        config: RouterConfig,
    ) -> (Self, WorkerPool) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let workers = config.workers.max(1);
        let store_timeout = config.store_timeout;
        let runner = Arc::new(TaskRunner::new(store.clone(), classifier, registry, config));
        let pool = WorkerPool::spawn(rx, runner.clone(), workers);
        let router = Self {
            store,
            runner,
            queue: tx,
            store_timeout,
        };
        (router, pool)
    }

    /// Create a Received task and queue it. Returns the task id immediately.
    pub async fn submit(&self, input: RawInput, options: SubmitOptions) -> Result<String, RouterError> {
        if options.task_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(RouterError::InvalidSubmission("task_id must not be empty".into()));
        }
        if options.thread_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(RouterError::InvalidSubmission("thread_id must not be empty".into()));
        }
        if input.is_blank() {
            return Err(RouterError::InvalidSubmission("content must not be empty".into()));
        }

        let record = TaskRecord::received(
            options.task_id,
            options.thread_id,
            input.metadata.source.clone(),
        );

        timed(self.store_timeout, "create", self.store.create(&record)).await?;
        info!(task_id = %record.task_id, thread_id = %record.thread_id, "Task received");

        let task_id = record.task_id;
        self.queue
            .send(Job {
                task_id: task_id.clone(),
                input,
            })
            .await
            .map_err(|_| {
                error!(task_id = %task_id, "Worker queue closed, task left in Received");
                RouterError::QueueClosed
            })?;
        Ok(task_id)
    }

    /// Run a task inline, bypassing the queue.
    pub async fn run(&self, task_id: &str, input: RawInput) -> Result<RunOutcome, RouterError> {
        self.runner.run(task_id, input).await
    }
}
