//! Periodic-flush writer for long-lived streamed responses.
//!
//! Wraps a flushable destination with a ticker of period `flush_interval`.
//! Writes are mutex-serialised against flushes so a scheduled flush never
//! tears a write in progress. When streaming stops, the ticker task is
//! signalled to exit and — purely as a test seam — invokes an optional
//! caller-supplied hook on its way out, mirroring the reference
//! implementation's nullable `onExitFlushLoop` callback.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

/// Hook invoked when a [`FlushWriter`]'s background ticker exits. Kept as an
/// injectable callback rather than a process-global, so tests can observe
/// exactly when a given flush loop has wound down.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// A writer that periodically flushes an inner `AsyncWrite` on a fixed
/// cadence, independent of how often callers write to it.
pub struct FlushWriter<W> {
    inner: Arc<Mutex<W>>,
    stop: Arc<Notify>,
    ticker_done: Arc<Notify>,
}

impl<W> FlushWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Start flushing `inner` every `period`. `on_exit`, if given, runs once
    /// when the ticker task is stopped.
    pub fn spawn(inner: W, period: Duration, on_exit: Option<ExitHook>) -> Self {
        let inner = Arc::new(Mutex::new(inner));
        let stop = Arc::new(Notify::new());
        let ticker_done = Arc::new(Notify::new());

        let ticker_inner = inner.clone();
        let ticker_stop = stop.clone();
        let ticker_done_tx = ticker_done.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; discard
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut guard = ticker_inner.lock();
                        // Best-effort: a flush error just means the
                        // connection already went away.
                        let _ = futures_util::future::poll_fn(|cx| {
                            std::pin::Pin::new(&mut *guard).poll_flush(cx)
                        })
                        .await;
                    }
                    _ = ticker_stop.notified() => break,
                }
            }
            if let Some(hook) = on_exit {
                hook();
            }
            ticker_done_tx.notify_one();
        });

        Self {
            inner,
            stop,
            ticker_done,
        }
    }

    /// Write `buf` to the inner destination, serialised against flushes.
    /// Loops until every byte is accepted — `AsyncWrite::poll_write` may
    /// return a short write, and silently dropping the remainder would lose
    /// data from the streamed response.
    pub async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        // `parking_lot::Mutex` is sync; hold it only for the duration of each
        // write by routing through a small poll_fn so we never block the
        // executor while holding the lock across an await point.
        let inner = self.inner.clone();
        let mut written = 0;
        while written < buf.len() {
            let inner = inner.clone();
            let remaining = &buf[written..];
            let n = futures_util::future::poll_fn(move |cx| {
                let mut guard = inner.lock();
                std::pin::Pin::new(&mut *guard).poll_write(cx, remaining)
            })
            .await?;
            written += n;
        }
        Ok(())
    }

    /// Stop the ticker and wait for its exit hook to run.
    pub async fn stop(self) {
        self.stop.notify_one();
        self.ticker_done.notified().await;
    }
}
