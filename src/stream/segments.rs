//! Ordered segment stream with a parallel fetch pipeline
//!
//! Three task roles cooperate behind the reader:
//! - a *dispatcher* walks the segment list in order, reserving each
//!   segment's declared size from the shared buffer budget before handing
//!   it to the workers (this is the backpressure mechanism);
//! - a pool of *workers* fetches and decodes segments concurrently,
//!   reconciling the budget by the declared-vs-decoded size difference;
//! - a *collector* reorders completions and forwards them, strictly by
//!   segment index, into the output channel the reader consumes.
//!
//! The first fetch error aborts the pipeline: it is forwarded in place of
//! data (so the reader sees it before EOF) and the stream's cancellation
//! token is fired. Close is idempotent and cancels all three roles.

use crate::error::{Error, Result};
use crate::nzb::NzbSegment;
use crate::pool::Pool;
use crate::types::SegmentData;
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Remaining read-ahead budget in bytes, shared between the dispatcher
/// (reserve), workers (post-decode adjustment) and the reader (credit).
///
/// Signed: a reservation is the segment's *declared* size, and decoded
/// sizes differ, so the balance can dip below zero transiently. It is
/// restored monotonically as the reader consumes.
struct BufferBudget {
    remaining: AtomicI64,
    notify: Notify,
}

impl BufferBudget {
    fn new(initial: u64) -> Self {
        Self {
            remaining: AtomicI64::new(initial.min(i64::MAX as u64) as i64),
            notify: Notify::new(),
        }
    }

    /// Wait until any budget remains, then take `amount` from it
    async fn reserve(&self, amount: i64, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.remaining.load(Ordering::Acquire) > 0 {
                self.remaining.fetch_sub(amount, Ordering::AcqRel);
                return Ok(());
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Return `amount` to the budget and wake one waiter
    fn credit(&self, amount: i64) {
        self.remaining.fetch_add(amount, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Apply a declared-vs-decoded correction
    fn adjust(&self, delta: i64) {
        if delta != 0 {
            self.remaining.fetch_add(delta, Ordering::AcqRel);
            if delta > 0 {
                self.notify.notify_one();
            }
        }
    }

    fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Read-only byte stream over a contiguous slice of segments
///
/// Bytes emerge strictly in segment order regardless of worker completion
/// order; partial reads are permitted; EOF follows the last segment's last
/// byte. Not safe for concurrent reads: one consumer at a time.
pub struct SegmentsStream {
    data_rx: mpsc::Receiver<Result<SegmentData>>,
    budget: Arc<BufferBudget>,
    cancel: CancellationToken,
    current: Bytes,
    closed: bool,
}

impl SegmentsStream {
    /// Spawn the fetch pipeline over `segments`
    ///
    /// `buffer_size` is the read-ahead budget in declared bytes. The
    /// stream's cancellation token is a child of `parent`, so cancelling
    /// the parent (a file stream, an HTTP request) tears this down too.
    pub fn new(
        pool: Pool,
        segments: Vec<NzbSegment>,
        groups: Vec<String>,
        buffer_size: u64,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let worker_count = segments.len().clamp(1, pool.max_connections_per_stream());
        let budget = Arc::new(BufferBudget::new(buffer_size));

        let (data_tx, data_rx) = mpsc::channel::<Result<SegmentData>>(worker_count * 2);

        trace!(
            segment_count = segments.len(),
            buffer_size,
            worker_count,
            "segments stream created"
        );

        if !segments.is_empty() {
            spawn_pipeline(
                pool,
                segments,
                groups,
                worker_count,
                budget.clone(),
                data_tx,
                cancel.clone(),
            );
        }

        Self {
            data_rx,
            budget,
            cancel,
            current: Bytes::new(),
            closed: false,
        }
    }

    /// Read and discard exactly `count` bytes
    ///
    /// Used after a seek that lands inside a segment: the stream starts at
    /// the segment boundary and the interior prefix is dropped here.
    pub async fn discard(&mut self, mut count: u64) -> Result<()> {
        use tokio::io::AsyncReadExt;

        let mut scratch = [0u8; 8192];
        while count > 0 {
            let want = scratch.len().min(count as usize);
            let n = self.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Ok(()); // EOF inside the skip window; nothing left to stream
            }
            count -= n as u64;
        }
        Ok(())
    }

    /// Cancel in-flight work and drain internal channels; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        self.budget.notify.notify_waiters();

        // Drain whatever the collector already queued, restoring the
        // budget so the accounting balances after close.
        self.data_rx.close();
        while let Ok(item) = self.data_rx.try_recv() {
            if let Ok(data) = item {
                self.budget.credit(data.size() as i64);
            }
        }
        self.current = Bytes::new();
    }

    /// Current buffer budget balance (test hook)
    #[doc(hidden)]
    pub fn remaining_budget(&self) -> i64 {
        self.budget.remaining()
    }
}

impl Drop for SegmentsStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for SegmentsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.closed {
                return Poll::Ready(Ok(())); // EOF after close
            }

            if !this.current.is_empty() {
                let n = buf.remaining().min(this.current.len());
                buf.put_slice(&this.current[..n]);
                this.current.advance(n);
                return Poll::Ready(Ok(()));
            }

            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    this.budget.credit(data.size() as i64);
                    trace!(size = data.size(), "segment consumed");
                    this.current = data.body;
                }
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(err.into()));
                }
                Poll::Ready(None) => {
                    return Poll::Ready(Ok(())); // all segments delivered
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Wire up dispatcher, workers and collector
fn spawn_pipeline(
    pool: Pool,
    segments: Vec<NzbSegment>,
    groups: Vec<String>,
    worker_count: usize,
    budget: Arc<BufferBudget>,
    data_tx: mpsc::Sender<Result<SegmentData>>,
    cancel: CancellationToken,
) {
    let total = segments.len();
    let (input_tx, input_rx) = mpsc::channel::<(usize, NzbSegment)>(worker_count);
    let (result_tx, result_rx) = mpsc::channel::<(usize, Result<SegmentData>)>(worker_count * 2);
    let input_rx = Arc::new(Mutex::new(input_rx));

    // Dispatcher
    {
        let budget = budget.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for (idx, segment) in segments.into_iter().enumerate() {
                if budget
                    .reserve(segment.bytes as i64, &cancel)
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = input_tx.send((idx, segment)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            // input_tx drops here; workers see the channel close
        });
    }

    // Workers
    for _ in 0..worker_count {
        let pool = pool.clone();
        let groups = groups.clone();
        let budget = budget.clone();
        let cancel = cancel.clone();
        let input_rx = input_rx.clone();
        let result_tx = result_tx.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut rx = input_rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = rx.recv() => item,
                    }
                };
                let Some((idx, segment)) = next else { return };

                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    fetched = pool.fetch_segment(&segment, &groups) => fetched,
                };

                if let Ok(data) = &result {
                    budget.adjust(segment.bytes as i64 - data.size() as i64);
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = result_tx.send((idx, result)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
    drop(result_tx);

    // Collector
    tokio::spawn(collect_in_order(result_rx, data_tx, total, cancel));
}

/// Reassemble worker completions into in-order delivery
async fn collect_in_order(
    mut result_rx: mpsc::Receiver<(usize, Result<SegmentData>)>,
    data_tx: mpsc::Sender<Result<SegmentData>>,
    total: usize,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<usize, SegmentData> = HashMap::new();
    let mut next_idx = 0;
    let mut received = 0;

    while received < total {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = result_rx.recv() => item,
        };
        let Some((idx, result)) = item else { return };
        received += 1;

        let data = match result {
            Ok(data) => data,
            Err(err) => {
                trace!(idx, error = %err, "segment fetch failed, aborting stream");
                let _ = data_tx.send(Err(err)).await;
                cancel.cancel();
                return;
            }
        };

        trace!(idx, next_idx, pending = pending.len(), "segment collected");
        pending.insert(idx, data);

        while let Some(data) = pending.remove(&next_idx) {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = data_tx.send(Ok(data)) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            next_idx += 1;
        }
    }
}
