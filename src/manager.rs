//! Query manager
//!
//! The [`Manager`] owns the worker pool and the per-action rate limiters for
//! one log service account. Callers submit [`QuerySpec`]s and get back a
//! [`Stream`] per query; all streams share the same workers and limiters.
//!
//! # Lifecycle
//!
//! ```text
//! Manager::new ──▶ running ──close()──▶ closed
//!                    │
//!                 submit(spec) ──▶ validate ─▶ apply defaults ─▶ plan chunks
//!                                                                 │
//!                                                   Stream ◀── enqueue jobs
//! ```
//!
//! Closing the manager cancels every outstanding chunk of every stream, waits
//! for the workers to finish their best-effort stops, and makes every later
//! `submit` or `close` return [`Error::Closed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::config::{Components, Config, Logger};
use crate::error::{Error, Result};
use crate::planner;
use crate::rate_limit::RateLimiters;
use crate::stream::{Stream, StreamInner};
use crate::types::{QuerySpec, Stats};
use crate::worker::{spawn_pool, ChunkJob, SchedulerMsg, WorkerShared};

/// Runs chunked queries against the log service
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use logquery::{Actions, Config, Manager, QuerySpec, Record};
///
/// # async fn example(actions: Arc<dyn Actions>, spec: QuerySpec) -> logquery::Result<()> {
/// let manager = Manager::new(Config::new(actions).with_parallel(8));
///
/// let stream = manager.submit(spec)?;
/// let mut buf = vec![Record::default(); 100];
/// loop {
///     let n = stream.read(&mut buf).await?;
///     if n == 0 {
///         break;
///     }
///     for record in &buf[..n] {
///         println!("{:?}", record.get("@message"));
///     }
/// }
///
/// manager.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Manager {
    /// Normalized configuration
    config: Config,
    shared: Arc<WorkerShared>,
    closed: AtomicBool,
    stats: Arc<Mutex<Stats>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Create a manager and start its workers
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics with [`NIL_ACTIONS_MSG`](crate::config::NIL_ACTIONS_MSG) if
    /// `config.actions` is `None`.
    pub fn new(config: Config) -> Self {
        let (
            config,
            Components {
                actions,
                classifier,
                logger,
            },
        ) = config.normalize();

        let rps = config.rps.clone();
        let limiters = RateLimiters::new(|action| min_delay_from(&rps, action));

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WorkerShared {
            actions,
            classifier,
            limiters,
            logger,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            stop_timeout: config.stop_timeout,
            shutdown: CancellationToken::new(),
            scheduler_tx,
        });

        let tasks = spawn_pool(Arc::clone(&shared), config.parallel as usize, scheduler_rx);

        let manager = Self {
            config,
            shared,
            closed: AtomicBool::new(false),
            stats: Arc::new(Mutex::new(Stats::default())),
            tasks: Mutex::new(tasks),
        };

        info!(
            parallel = manager.config.parallel,
            rps = ?manager.config.rps,
            "Query manager started"
        );
        manager
            .logger()
            .log(&format!("logquery: manager ({:p}) start", Arc::as_ptr(&manager.shared)));
        manager
    }

    /// The normalized configuration in effect
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Minimum spacing between calls to one action
    pub fn min_delay(&self, action: Action) -> Duration {
        self.shared.limiters.get(action).min_delay()
    }

    /// Submit a query
    ///
    /// Validates the specification, fills in defaults, plans its chunks and
    /// queues them for the workers. The returned stream yields the query's
    /// records in chunk order.
    ///
    /// Returns [`Error::Closed`] if the manager is closed, or
    /// [`Error::Validation`] if the specification is malformed.
    pub fn submit(&self, spec: QuerySpec) -> Result<Stream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        planner::validate(&spec)?;

        let spec = planner::apply_defaults(spec);
        let ranges = planner::plan(&spec);
        let inner = Arc::new(StreamInner::new(
            spec,
            ranges.len(),
            self.shared.shutdown.child_token(),
            Arc::clone(&self.stats),
        ));

        let jobs: Vec<ChunkJob> = ranges
            .into_iter()
            .enumerate()
            .map(|(i, range)| ChunkJob::new(i, range, inner.spec(), Arc::downgrade(&inner)))
            .collect();

        debug!(
            text = %inner.spec().text,
            range = %inner.spec().range(),
            chunks = jobs.len(),
            chunk = ?inner.spec().chunk,
            "Query submitted"
        );

        self.shared
            .scheduler_tx
            .send(SchedulerMsg::Submit(jobs))
            .map_err(|_| Error::Closed)?;

        Ok(Stream::new(inner))
    }

    /// Sum of statistics over every chunk completed by this manager
    pub fn stats(&self) -> Stats {
        *self.stats.lock()
    }

    /// Close the manager
    ///
    /// Cancels all outstanding chunks and waits for the workers to exit. The
    /// first call returns `Ok(())`; every later or concurrent call returns
    /// [`Error::Closed`] without waiting.
    pub async fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Closed);
        }

        self.shared.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task failed during shutdown");
            }
        }

        info!("Query manager stopped");
        self.logger()
            .log(&format!("logquery: manager ({:p}) stop", Arc::as_ptr(&self.shared)));
        Ok(())
    }

    fn logger(&self) -> &dyn Logger {
        self.shared.logger.as_ref()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shared.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn min_delay_from(rps: &HashMap<Action, i32>, action: Action) -> Duration {
    Config::min_delay_for(rps.get(&action).copied().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        ActionError, Actions, GetQueryResultsInput, GetQueryResultsOutput, StartQueryInput,
        StartQueryOutput, StopQueryInput, StopQueryOutput,
    };

    struct Unreachable;

    #[async_trait::async_trait]
    impl Actions for Unreachable {
        async fn start_query(
            &self,
            _: StartQueryInput,
        ) -> std::result::Result<StartQueryOutput, ActionError> {
            Err(ActionError::new("unreachable"))
        }

        async fn get_query_results(
            &self,
            _: GetQueryResultsInput,
        ) -> std::result::Result<GetQueryResultsOutput, ActionError> {
            Err(ActionError::new("unreachable"))
        }

        async fn stop_query(
            &self,
            _: StopQueryInput,
        ) -> std::result::Result<StopQueryOutput, ActionError> {
            Err(ActionError::new("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_min_delay_follows_rps() {
        let manager = Manager::new(
            Config::new(Arc::new(Unreachable))
                .with_rps(Action::StartQuery, 2)
                .with_rps(Action::StopQuery, 0),
        );
        assert_eq!(manager.min_delay(Action::StartQuery), Duration::from_millis(500));
        assert_eq!(manager.min_delay(Action::GetQueryResults), Duration::from_secs(1) / 3);
        assert_eq!(manager.min_delay(Action::StopQuery), Duration::ZERO);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_joins_workers() {
        let manager = Manager::new(Config::new(Arc::new(Unreachable)).with_parallel(3));
        assert_eq!(manager.tasks.lock().len(), 4);
        manager.close().await.unwrap();
        assert!(manager.tasks.lock().is_empty());
        assert!(manager.close().await.unwrap_err().is_closed());
    }
}
