//! Worker pool and chunk lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  Submit(jobs)   ┌─────────────┐   work queue   ┌──────────┐
//! │ Manager  │────────────────▶│  Scheduler  │───────────────▶│ Worker 0 │
//! └──────────┘                 │ (retry wait)│        ...     │ Worker N │
//!                              └─────────────┘◀───────────────└────┬─────┘
//!                                     ▲        Retry(job, delay)   │
//!                                     │                            ▼
//!                                     │                  rate limiter → Actions
//! ```
//!
//! Each worker takes one [`ChunkJob`] at a time and drives it through
//! `Pending → Starting → Polling → {Completed, Failed, Cancelled}`:
//!
//! - **Starting**: wait for a `StartQuery` permit and start the search. A
//!   transient error hands the job back to the scheduler, which re-queues it
//!   after a backoff so other jobs get the worker in the meantime. A fatal
//!   error fails the chunk.
//! - **Polling**: wait for a `GetQueryResults` permit and poll until the
//!   search completes. Transient poll errors are retried in place.
//! - **Cancellation**: if the stream or manager closes while the chunk is in
//!   flight, the worker makes one best-effort, rate-limited `StopQuery` call.
//!   A start already sent is awaited first, so the search it creates is
//!   stopped too.
//!
//! The number of workers bounds the number of searches running on the
//! service at once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::action::{
    Action, ActionError, Actions, ErrorClassifier, GetQueryResultsInput, QueryStatus,
    StartQueryInput, StopQueryInput,
};
use crate::config::Logger;
use crate::error::ChunkError;
use crate::rate_limit::RateLimiters;
use crate::stream::StreamInner;
use crate::types::{ChunkState, QuerySpec, TimeRange};

// ============================================================================
// Chunk Job
// ============================================================================

/// One chunk of a query, executed as one remote search
#[derive(Debug)]
pub(crate) struct ChunkJob {
    /// Position of the chunk within its query
    index: usize,
    range: TimeRange,
    text: String,
    groups: Vec<String>,
    limit: u32,
    /// Remote query id, set once the start succeeds
    query_id: Option<String>,
    state: ChunkState,
    /// Transient errors retried so far
    retries: u32,
    /// Owning stream; used only to deliver outcomes
    stream: Weak<StreamInner>,
}

impl ChunkJob {
    pub(crate) fn new(index: usize, range: TimeRange, spec: &QuerySpec, stream: Weak<StreamInner>) -> Self {
        Self {
            index,
            range,
            text: spec.text.clone(),
            groups: spec.groups.clone(),
            limit: spec.limit,
            query_id: None,
            state: ChunkState::Pending,
            retries: 0,
            stream,
        }
    }

    fn start_input(&self) -> StartQueryInput {
        StartQueryInput {
            query_string: self.text.clone(),
            start_time: self.range.start.timestamp(),
            end_time: self.range.end.timestamp(),
            log_group_names: self.groups.clone(),
            limit: self.limit,
        }
    }

    fn set_state(&mut self, state: ChunkState) {
        trace!(chunk = self.index, from = %self.state, to = %state, "Chunk state change");
        self.state = state;
    }

    fn error(&self, cause: ActionError) -> ChunkError {
        ChunkError::new(self.text.clone(), self.range, cause)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Messages to the scheduling loop
#[derive(Debug)]
pub(crate) enum SchedulerMsg {
    /// Newly planned jobs of one query, in chunk order
    Submit(Vec<ChunkJob>),
    /// A job to re-queue once the delay has passed
    Retry(ChunkJob, Duration),
}

async fn run_scheduler(
    mut rx: mpsc::UnboundedReceiver<SchedulerMsg>,
    work_tx: mpsc::UnboundedSender<ChunkJob>,
    shutdown: CancellationToken,
) {
    let mut delayed: Vec<(Instant, ChunkJob)> = Vec::new();

    loop {
        let next_due = delayed.iter().map(|(at, _)| *at).min();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(SchedulerMsg::Submit(jobs)) => {
                    for job in jobs {
                        if work_tx.send(job).is_err() {
                            break;
                        }
                    }
                }
                Some(SchedulerMsg::Retry(job, delay)) => {
                    delayed.push((Instant::now() + delay, job));
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                let (due, waiting): (Vec<_>, Vec<_>) =
                    delayed.drain(..).partition(|(at, _)| *at <= now);
                delayed = waiting;
                for (_, job) in due {
                    if work_tx.send(job).is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!(dropped = delayed.len(), "Scheduler stopped");
}

// ============================================================================
// Workers
// ============================================================================

/// State shared by the scheduler and every worker of one manager
pub(crate) struct WorkerShared {
    pub(crate) actions: Arc<dyn Actions>,
    pub(crate) classifier: Arc<dyn ErrorClassifier>,
    pub(crate) limiters: RateLimiters,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) max_retries: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) scheduler_tx: mpsc::UnboundedSender<SchedulerMsg>,
}

/// Spawn the scheduling loop and `parallel` workers
pub(crate) fn spawn_pool(
    shared: Arc<WorkerShared>,
    parallel: usize,
    scheduler_rx: mpsc::UnboundedReceiver<SchedulerMsg>,
) -> Vec<JoinHandle<()>> {
    let (work_tx, work_rx) = mpsc::unbounded_channel();
    let work_rx = Arc::new(Mutex::new(work_rx));

    let mut handles = Vec::with_capacity(parallel + 1);
    handles.push(tokio::spawn(run_scheduler(
        scheduler_rx,
        work_tx,
        shared.shutdown.clone(),
    )));
    for id in 0..parallel {
        handles.push(tokio::spawn(run_worker(
            id,
            Arc::clone(&shared),
            Arc::clone(&work_rx),
        )));
    }
    handles
}

async fn run_worker(
    id: usize,
    shared: Arc<WorkerShared>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<ChunkJob>>>,
) {
    debug!(worker = id, "Worker started");
    loop {
        let job = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            job = async { queue.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };
        shared.process(job).await;
    }
    debug!(worker = id, "Worker stopped");
}

impl WorkerShared {
    async fn process(&self, mut job: ChunkJob) {
        let Some(stream) = job.stream.upgrade() else {
            job.set_state(ChunkState::Cancelled);
            return;
        };
        let cancel = stream.cancel_token().clone();
        if cancel.is_cancelled() {
            job.set_state(ChunkState::Cancelled);
            return;
        }

        if job.query_id.is_none() {
            job = match self.start(job, &stream, &cancel).await {
                Some(job) => job,
                None => return,
            };
        }

        self.poll(job, &stream, &cancel).await;
    }

    /// Start the remote search; returns the job if it should be polled next
    async fn start(
        &self,
        mut job: ChunkJob,
        stream: &StreamInner,
        cancel: &CancellationToken,
    ) -> Option<ChunkJob> {
        job.set_state(ChunkState::Starting);

        if self.limiters.acquire(Action::StartQuery, cancel).await.is_err() {
            job.set_state(ChunkState::Cancelled);
            return None;
        }

        let mut start = self.actions.start_query(job.start_input());
        let result = tokio::select! {
            biased;
            r = &mut start => r,
            _ = cancel.cancelled() => {
                // The search may already exist remotely; finish the start so
                // it can be stopped
                if let Ok(Ok(output)) = tokio::time::timeout(self.stop_timeout, start).await {
                    debug!(chunk = job.index, query_id = %output.query_id, "Chunk started after cancel");
                    job.query_id = Some(output.query_id);
                }
                self.stop(&mut job).await;
                return None;
            }
        };

        match result {
            Ok(output) => {
                debug!(chunk = job.index, query_id = %output.query_id, range = %job.range, "Chunk started");
                job.query_id = Some(output.query_id);
                Some(job)
            }
            Err(e) if self.classifier.is_transient(&e) && job.retries < self.max_retries => {
                job.retries += 1;
                let delay = self.retry_backoff.saturating_mul(job.retries);
                debug!(chunk = job.index, retries = job.retries, error = %e, "Start throttled, re-queueing");
                job.set_state(ChunkState::Pending);
                if let Err(mpsc::error::SendError(SchedulerMsg::Retry(mut job, _))) =
                    self.scheduler_tx.send(SchedulerMsg::Retry(job, delay))
                {
                    job.set_state(ChunkState::Cancelled);
                }
                None
            }
            Err(e) => {
                self.fail(&mut job, stream, e);
                None
            }
        }
    }

    async fn poll(&self, mut job: ChunkJob, stream: &StreamInner, cancel: &CancellationToken) {
        job.set_state(ChunkState::Polling);
        let Some(query_id) = job.query_id.clone() else {
            return;
        };

        loop {
            if self.limiters.acquire(Action::GetQueryResults, cancel).await.is_err() {
                self.stop(&mut job).await;
                return;
            }

            let input = GetQueryResultsInput {
                query_id: query_id.clone(),
            };
            let result = tokio::select! {
                r = self.actions.get_query_results(input) => r,
                _ = cancel.cancelled() => {
                    self.stop(&mut job).await;
                    return;
                }
            };

            match result {
                Ok(output) if output.status.is_pending() => {
                    // Give other tasks a turn when polling is not rate limited
                    tokio::task::yield_now().await;
                }
                Ok(output) if output.status == QueryStatus::Complete => {
                    debug!(
                        chunk = job.index,
                        query_id = %query_id,
                        records = output.results.len(),
                        "Chunk complete"
                    );
                    stream.complete(job.index, output.results, output.statistics.unwrap_or_default());
                    job.set_state(ChunkState::Completed);
                    return;
                }
                Ok(output) => {
                    let cause = ActionError::with_code(
                        output.status.to_string(),
                        format!("query {} ended with status {}", query_id, output.status),
                    );
                    self.fail(&mut job, stream, cause);
                    return;
                }
                Err(e) if self.classifier.is_transient(&e) && job.retries < self.max_retries => {
                    job.retries += 1;
                    debug!(chunk = job.index, retries = job.retries, error = %e, "Poll throttled, retrying");
                }
                Err(e) => {
                    self.fail(&mut job, stream, e);
                    return;
                }
            }
        }
    }

    fn fail(&self, job: &mut ChunkJob, stream: &StreamInner, cause: ActionError) {
        let err = job.error(cause);
        warn!(chunk = job.index, error = %err, "Chunk failed");
        stream.fail(job.index, err);
        job.set_state(ChunkState::Failed);
    }

    /// Best-effort stop of an abandoned chunk
    ///
    /// Not cancelled by shutdown; bounded by `stop_timeout` instead.
    async fn stop(&self, job: &mut ChunkJob) {
        let Some(query_id) = job.query_id.clone() else {
            job.set_state(ChunkState::Cancelled);
            return;
        };

        let attempt = async {
            self.limiters.wait(Action::StopQuery).await;
            self.actions
                .stop_query(StopQueryInput {
                    query_id: query_id.clone(),
                })
                .await
        };

        match tokio::time::timeout(self.stop_timeout, attempt).await {
            Ok(Ok(output)) => {
                debug!(chunk = job.index, query_id = %query_id, success = output.success, "Chunk stopped");
            }
            Ok(Err(e)) => {
                warn!(chunk = job.index, query_id = %query_id, error = %e, "Failed to stop chunk");
                self.logger.log(&format!(
                    "logquery: failed to stop chunk {:?} {} (query {}): {}",
                    job.text, job.range, query_id, e
                ));
            }
            Err(_) => {
                warn!(chunk = job.index, query_id = %query_id, "Timed out stopping chunk");
                self.logger.log(&format!(
                    "logquery: timed out stopping chunk {:?} {} (query {})",
                    job.text, job.range, query_id
                ));
            }
        }
        job.set_state(ChunkState::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_start_input_uses_chunk_range() {
        let start = Utc.with_ymd_and_hms(2020, 8, 25, 3, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 8, 25, 3, 35, 0).unwrap();
        let spec = QuerySpec {
            text: "fields @message".to_string(),
            start,
            end,
            groups: vec!["a".to_string(), "b".to_string()],
            limit: 50,
            ..Default::default()
        };
        let job = ChunkJob::new(0, TimeRange::new(start, end), &spec, Weak::new());

        let input = job.start_input();
        assert_eq!(input.query_string, "fields @message");
        assert_eq!(input.start_time, start.timestamp());
        assert_eq!(input.end_time, end.timestamp());
        assert_eq!(input.log_group_names, vec!["a", "b"]);
        assert_eq!(input.limit, 50);
        assert_eq!(job.state, ChunkState::Pending);
    }

    #[tokio::test]
    async fn test_scheduler_releases_retry_after_delay() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (work_tx, mut work_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_scheduler(rx, work_tx, shutdown.clone()));

        let spec = QuerySpec::default();
        let range = TimeRange::new(spec.start, spec.end);
        tx.send(SchedulerMsg::Retry(
            ChunkJob::new(7, range, &spec, Weak::new()),
            Duration::from_millis(50),
        ))
        .unwrap();
        tx.send(SchedulerMsg::Submit(vec![ChunkJob::new(1, range, &spec, Weak::new())]))
            .unwrap();

        let started = std::time::Instant::now();
        assert_eq!(work_rx.recv().await.unwrap().index, 1);
        assert_eq!(work_rx.recv().await.unwrap().index, 7);
        assert!(started.elapsed() >= Duration::from_millis(40));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
