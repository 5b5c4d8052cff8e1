//! Per-query result stream
//!
//! A [`Stream`] is the caller's handle on one submitted query. Workers deliver
//! each chunk's outcome into a slot indexed by chunk position; the reader
//! drains slots strictly in order through a cursor, so a later chunk that
//! finishes first stays buffered until every earlier chunk has been read.
//!
//! ```text
//!  slots:   [ Done ][ Done ][ Pending ][ Done ][ Pending ]
//!              ▲ cursor
//!  read() → records of slot 0, then slot 1, then waits on slot 2
//! ```
//!
//! # Terminal states
//!
//! - all slots drained: `read` returns `Ok(0)`
//! - any chunk failed: `read` returns that chunk's error, on the next call and
//!   every later one, even if earlier chunks are still running or buffered.
//!   The stream's remaining chunks are cancelled as soon as the failure lands
//! - stream closed, or manager closed before all chunks finished: `read`
//!   returns [`Error::Closed`]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ChunkError, Error, Result};
use crate::types::{QuerySpec, Record, Stats};

/// Outcome slot for one chunk
#[derive(Debug)]
enum Slot {
    /// Chunk not finished yet
    Pending,
    /// Records not yet handed to the reader
    Done(VecDeque<Record>),
}

#[derive(Debug)]
struct StreamState {
    slots: Vec<Slot>,
    /// Index of the next slot to deliver
    cursor: usize,
    stats: Stats,
    /// Terminal error, repeated on every read once set
    err: Option<Error>,
}

/// Shared part of a stream, referenced weakly by its chunk jobs
#[derive(Debug)]
pub(crate) struct StreamInner {
    spec: QuerySpec,
    state: Mutex<StreamState>,
    notify: Notify,
    cancel: CancellationToken,
    closed: AtomicBool,
    manager_stats: Arc<Mutex<Stats>>,
}

impl StreamInner {
    pub(crate) fn new(
        spec: QuerySpec,
        chunks: usize,
        cancel: CancellationToken,
        manager_stats: Arc<Mutex<Stats>>,
    ) -> Self {
        Self {
            spec,
            state: Mutex::new(StreamState {
                slots: (0..chunks).map(|_| Slot::Pending).collect(),
                cursor: 0,
                stats: Stats::default(),
                err: None,
            }),
            notify: Notify::new(),
            cancel,
            closed: AtomicBool::new(false),
            manager_stats,
        }
    }

    pub(crate) fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// Cancellation signal shared by this stream's chunk jobs
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Deliver a completed chunk
    ///
    /// Ignored once the stream has a terminal error.
    pub(crate) fn complete(&self, index: usize, records: Vec<Record>, stats: Stats) {
        {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            match state.slots.get_mut(index) {
                Some(slot) if matches!(slot, Slot::Pending) => *slot = Slot::Done(records.into()),
                _ => return,
            }
            state.stats += stats;
            *self.manager_stats.lock() += stats;
        }
        self.notify.notify_waiters();
    }

    /// Deliver a fatal chunk failure
    ///
    /// Ends the stream at once: buffered records are dropped, stats freeze
    /// and the remaining chunks are cancelled.
    pub(crate) fn fail(&self, index: usize, err: ChunkError) {
        let err = Error::Chunk(err);
        {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err.clone());
            for slot in state.slots.iter_mut() {
                *slot = Slot::Pending;
            }
        }
        debug!(text = %self.spec.text, chunk = index, error = %err, "Stream failed");
        self.cancel.cancel();
        self.notify.notify_waiters();
    }

    fn stats(&self) -> Stats {
        self.state.lock().stats
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        {
            let mut state = self.state.lock();
            if state.err.is_none() {
                state.err = Some(Error::Closed);
            }
        }
        self.cancel.cancel();
        self.notify.notify_waiters();
        Ok(())
    }

    /// Move up to `buf.len()` records out of the in-order slots
    ///
    /// Returns `None` when the caller has to wait.
    fn try_read(&self, buf: &mut [Record]) -> Option<Result<usize>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(err) = &state.err {
            return Some(Err(err.clone()));
        }

        let mut n = 0;
        while n < buf.len() && state.cursor < state.slots.len() {
            match &mut state.slots[state.cursor] {
                Slot::Pending => break,
                Slot::Done(records) => {
                    while n < buf.len() {
                        match records.pop_front() {
                            Some(r) => {
                                buf[n] = r;
                                n += 1;
                            }
                            None => break,
                        }
                    }
                    if records.is_empty() {
                        state.cursor += 1;
                    }
                }
            }
        }

        if n > 0 {
            return Some(Ok(n));
        }
        if state.cursor == state.slots.len() {
            return Some(Ok(0));
        }
        if self.cancel.is_cancelled() {
            // Manager closed underneath us with chunks still outstanding
            state.err = Some(Error::Closed);
            return Some(Err(Error::Closed));
        }
        None
    }

    async fn read(&self, buf: &mut [Record]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_read(buf) {
                return result;
            }

            tokio::select! {
                _ = notified => {},
                _ = self.cancel.cancelled() => {},
            }
        }
    }
}

/// Caller handle for one submitted query
///
/// Returned by `Manager::submit`. Reads are pull-based and return records in
/// chunk order. Only one task should read a stream at a time.
///
/// Dropping a stream without closing it cancels its outstanding chunks.
#[derive(Debug)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(inner: Arc<StreamInner>) -> Self {
        Self { inner }
    }

    /// The defaulted specification this stream is running
    pub fn query_spec(&self) -> &QuerySpec {
        self.inner.spec()
    }

    /// Read up to `buf.len()` records
    ///
    /// Waits until at least one record is available or the stream reaches a
    /// terminal state. Returns:
    /// - `Ok(n)` with `n > 0` records written to the front of `buf`
    /// - `Ok(0)` once every chunk has been delivered (or immediately, without
    ///   waiting, if `buf` is empty)
    /// - `Err(Error::Chunk(_))` once any chunk failed, whether or not earlier
    ///   chunks have been read; the same error is returned by every later call
    /// - `Err(Error::Closed)` after [`Stream::close`], or if the manager
    ///   closed before all chunks finished
    pub async fn read(&self, buf: &mut [Record]) -> Result<usize> {
        self.inner.read(buf).await
    }

    /// Read every remaining record
    pub async fn read_all(&self) -> Result<Vec<Record>> {
        let mut all = Vec::new();
        let mut buf = vec![Record::default(); 128];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(all);
            }
            all.extend(buf[..n].iter_mut().map(std::mem::take));
        }
    }

    /// Sum of statistics from completed chunks
    ///
    /// Stops changing once the stream is closed or has failed.
    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Close the stream and cancel its outstanding chunks
    ///
    /// The first call returns `Ok(())`; every later call returns
    /// [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
