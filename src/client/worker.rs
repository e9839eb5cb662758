// Background delivery worker for the ingestion client
//
// A single dedicated OS thread owns the outbound connection. Records arrive
// over a bounded sync channel and are shipped when either the batch fills
// (`batch_size`) or the flush interval elapses with a non-empty batch,
// whichever fires first.
//
// # Architecture
//
// ```text
// LogClient::log() (wait-free)
//     │
//     └──→ std::sync::mpsc::SyncSender (bounded, try_send)
//             │
//             └──→ Dedicated Worker Thread
//                     │
//                     ├──→ Batch buffer (batch_size or flush_interval)
//                     └──→ POST /logs (gzip ≥ 100 records, retry w/ backoff)
// ```

use crate::model::QueuedLog;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::ClientConfig;

/// Batches at or above this size are gzip-compressed on the wire
pub(super) const COMPRESSION_THRESHOLD: usize = 100;

/// Per-request timeout for batch delivery
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to the worker thread
pub(super) enum WorkerCommand {
    Store(Box<QueuedLog>),
    Shutdown,
}

/// Counters for observability of the client itself
///
/// Updated with relaxed ordering; these are diagnostics, not synchronization.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Records accepted into the queue
    pub enqueued: AtomicU64,
    /// Records dropped because the queue was full
    pub dropped: AtomicU64,
    /// Records delivered to the collector
    pub sent: AtomicU64,
    /// Batches abandoned after the retry budget was spent
    pub batches_failed: AtomicU64,
    /// Delivery attempts that ended in an HTTP or transport error
    pub send_errors: AtomicU64,
}

impl ClientMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub batches_failed: u64,
    pub send_errors: u64,
}

/// One-shot completion latch for worker shutdown
///
/// The close path waits on this with a deadline instead of joining the thread
/// directly, so a wedged network call cannot hang the host application.
pub(super) struct CompletionSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn complete(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
            self.condvar.notify_all();
        }
    }

    /// Wait until `complete()` is called or the timeout elapses.
    /// Returns true if completion was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.done.lock() else {
            return false;
        };
        let (guard, _result) = match self
            .condvar
            .wait_timeout_while(guard, timeout, |done| !*done)
        {
            Ok(pair) => pair,
            Err(_) => return false,
        };
        *guard
    }
}

/// Worker thread entry point: batch, flush, repeat until shutdown
pub(super) fn run_worker(
    rx: Receiver<WorkerCommand>,
    config: ClientConfig,
    metrics: Arc<ClientMetrics>,
) {
    let http = match reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("log worker could not build HTTP client: {e}");
            return;
        }
    };

    let endpoint = format!("{}/logs", config.server_url.trim_end_matches('/'));
    let mut batch: Vec<QueuedLog> = Vec::with_capacity(config.batch_size);
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(config.flush_interval) {
            Ok(WorkerCommand::Store(record)) => {
                batch.push(*record);
                if batch.len() >= config.batch_size {
                    deliver(&http, &endpoint, &mut batch, &config, &metrics);
                    last_flush = Instant::now();
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                // Drain whatever is still queued, flush once, exit
                loop {
                    match rx.try_recv() {
                        Ok(WorkerCommand::Store(record)) => batch.push(*record),
                        Ok(WorkerCommand::Shutdown) => {}
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                deliver(&http, &endpoint, &mut batch, &config, &metrics);
                tracing::debug!("log worker shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && last_flush.elapsed() >= config.flush_interval {
                    deliver(&http, &endpoint, &mut batch, &config, &metrics);
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                deliver(&http, &endpoint, &mut batch, &config, &metrics);
                break;
            }
        }
    }
}

/// Ship the current batch, retrying with exponential backoff.
///
/// The batch is cleared whether delivery succeeded or was abandoned; a final
/// failure logs one diagnostic to the process-local sink and drops the data
/// (at-least-once overall, never blocking the application).
fn deliver(
    http: &reqwest::blocking::Client,
    endpoint: &str,
    batch: &mut Vec<QueuedLog>,
    config: &ClientConfig,
    metrics: &ClientMetrics,
) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len() as u64;
    let records = std::mem::take(batch);
    let (body, compressed) = match encode_body(&records, config.enable_compression) {
        Ok(encoded) => encoded,
        Err(e) => {
            metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!("failed to encode log batch of {count}: {e}");
            return;
        }
    };

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            std::thread::sleep(backoff_delay(attempt - 1));
        }

        let mut request = http
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if compressed {
            request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
        }

        match request.body(body.clone()).send() {
            Ok(response) if response.status().is_success() => {
                metrics.sent.fetch_add(count, Ordering::Relaxed);
                tracing::trace!("delivered batch of {count} (compressed: {compressed})");
                return;
            }
            Ok(response) => {
                metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "collector returned {} for batch of {count} (attempt {})",
                    response.status(),
                    attempt + 1
                );
            }
            Err(e) => {
                metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("batch delivery failed (attempt {}): {e}", attempt + 1);
            }
        }
    }

    metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
    tracing::error!(
        "dropping batch of {count} after {} retries",
        config.max_retries
    );
}

/// Serialize a batch, gzip-compressing when large enough.
/// Returns the body and whether it is compressed.
pub(super) fn encode_body(
    records: &[QueuedLog],
    enable_compression: bool,
) -> anyhow::Result<(Vec<u8>, bool)> {
    #[derive(serde::Serialize)]
    struct BatchRef<'a> {
        logs: &'a [QueuedLog],
    }

    let payload = serde_json::to_vec(&BatchRef { logs: records })?;

    if enable_compression && records.len() >= COMPRESSION_THRESHOLD {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        Ok((encoder.finish()?, true))
    } else {
        Ok((payload, false))
    }
}

/// Backoff before retry n (0-based): 1s, 2s, 4s, ...
pub(super) fn backoff_delay(retry: u32) -> Duration {
    Duration::from_secs(1u64 << retry.min(6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Level, LogBatch};
    use std::io::Read;

    fn records(n: usize) -> Vec<QueuedLog> {
        (0..n)
            .map(|i| QueuedLog::new(Level::Info, format!("record {i}")))
            .collect()
    }

    #[test]
    fn small_batches_are_not_compressed() {
        let (body, compressed) = encode_body(&records(99), true).unwrap();
        assert!(!compressed);
        let batch: LogBatch = serde_json::from_slice(&body).unwrap();
        assert_eq!(batch.logs.len(), 99);
    }

    #[test]
    fn threshold_batches_are_compressed_and_round_trip() {
        let (body, compressed) = encode_body(&records(100), true).unwrap();
        assert!(compressed);

        let mut decoder = flate2::read::GzDecoder::new(&body[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        let batch: LogBatch = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(batch.logs.len(), 100);
        assert_eq!(batch.logs[7].message, "record 7");
    }

    #[test]
    fn compression_disabled_stays_plain() {
        let (body, compressed) = encode_body(&records(500), false).unwrap();
        assert!(!compressed);
        assert!(serde_json::from_slice::<LogBatch>(&body).is_ok());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        // Capped so pathological retry counts cannot sleep for hours
        assert_eq!(backoff_delay(30), Duration::from_secs(64));
    }

    #[test]
    fn completion_signal_times_out_then_completes() {
        let signal = Arc::new(CompletionSignal::new());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));

        let waiter = signal.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        signal.complete();
        assert!(handle.join().unwrap());
    }
}
