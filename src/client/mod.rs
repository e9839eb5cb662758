// Asynchronous log ingestion client
//
// Applications call `log()` (or the per-level helpers) from any thread; the
// call builds a record, enriches it from the ambient context and hands it to
// a bounded queue without ever touching the network. A single background
// worker batches, compresses and delivers to the collector (see `worker.rs`).
//
// Hot-path contract: no locks shared with the worker, no allocation beyond
// the record itself, no suspension. When the queue is full the record is
// dropped and the caller returns normally.

pub mod context;
mod worker;

pub use context::{
    clear_request_context, request_context, set_request_context, user_context, user_scope,
    ContextScope, ContextSnapshot,
};
pub use worker::{ClientMetrics, MetricsSnapshot};

use crate::model::{Level, LogSource, QueuedLog};
use serde_json::Value;
use std::backtrace::Backtrace;
use std::panic::{self, Location, PanicHookInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use worker::{CompletionSignal, WorkerCommand};

type PrevPanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Client configuration: explicit values win over environment variables,
/// which win over built-in defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Collector base URL (`LOG_SERVER_URL`)
    pub server_url: String,
    /// Default service name stamped on records (`SERVICE_NAME`)
    pub service: Option<String>,
    /// Default environment (`ENVIRONMENT`)
    pub environment: String,
    /// Default service version (`SERVICE_VERSION`)
    pub service_version: String,
    /// Default source category (`LOG_TYPE`)
    pub log_type: LogSource,
    /// Records per delivery batch
    pub batch_size: usize,
    /// Maximum time a non-empty batch waits before delivery
    pub flush_interval: Duration,
    /// Queue capacity; records beyond this are dropped
    pub max_queue_size: usize,
    /// gzip batches of 100+ records
    pub enable_compression: bool,
    /// Delivery retries per batch
    pub max_retries: u32,
    /// Install a process-wide panic hook (`ENABLE_GLOBAL_ERROR_HANDLER`)
    pub enable_global_error_handler: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            service: None,
            environment: "development".to_string(),
            service_version: "v0.0.0-dev".to_string(),
            log_type: LogSource::Backend,
            batch_size: 1_000,
            flush_interval: Duration::from_secs(1),
            max_queue_size: 10_000,
            enable_compression: true,
            max_retries: 3,
            enable_global_error_handler: false,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let env_or = |key: &str, default: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            server_url: env_or("LOG_SERVER_URL", &defaults.server_url)
                .trim_end_matches('/')
                .to_string(),
            service: std::env::var("SERVICE_NAME").ok().filter(|v| !v.is_empty()),
            environment: env_or("ENVIRONMENT", &defaults.environment),
            service_version: env_or("SERVICE_VERSION", &defaults.service_version),
            log_type: env_or("LOG_TYPE", "BACKEND").parse().unwrap_or_default(),
            enable_global_error_handler: env_or("ENABLE_GLOBAL_ERROR_HANDLER", "false")
                .eq_ignore_ascii_case("true"),
            ..defaults
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    tx: SyncSender<WorkerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    completion: Arc<CompletionSignal>,
    metrics: Arc<ClientMetrics>,
    closed: AtomicBool,
    previous_panic_hook: Arc<Mutex<Option<PrevPanicHook>>>,
}

/// Handle to the ingestion client; cheap to clone, all clones share one worker
#[derive(Clone)]
pub struct LogClient {
    inner: Arc<ClientInner>,
}

impl LogClient {
    /// Start a client with the given configuration.
    ///
    /// Spawns the background worker immediately and, if configured, installs
    /// the global panic hook.
    pub fn new(config: ClientConfig) -> Self {
        let (tx, rx) = mpsc::sync_channel::<WorkerCommand>(config.max_queue_size);
        let metrics = Arc::new(ClientMetrics::default());
        let completion = Arc::new(CompletionSignal::new());

        let worker_config = config.clone();
        let worker_metrics = metrics.clone();
        let worker_completion = completion.clone();
        let worker = std::thread::Builder::new()
            .name("loglens-worker".into())
            .spawn(move || {
                worker::run_worker(rx, worker_config, worker_metrics);
                worker_completion.complete();
            })
            .ok();

        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                tx,
                worker: Mutex::new(worker),
                completion,
                metrics,
                closed: AtomicBool::new(false),
                previous_panic_hook: Arc::new(Mutex::new(None)),
            }),
        };

        if client.inner.config.enable_global_error_handler {
            client.install_panic_hook();
        }

        client
    }

    /// Start a client configured from the environment
    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────

    /// Begin a record at the given level.
    ///
    /// The returned builder emits when dropped (or on an explicit `emit()`),
    /// so both forms work:
    ///
    /// ```ignore
    /// client.log(Level::Info, "checkout started");
    /// client.log(Level::Warn, "slow checkout").with("duration_ms", 2310.0);
    /// ```
    #[track_caller]
    pub fn log(&self, level: Level, message: impl Into<String>) -> LogEvent<'_> {
        LogEvent::new(self, level, message.into(), Location::caller())
    }

    #[track_caller]
    pub fn trace(&self, message: impl Into<String>) -> LogEvent<'_> {
        LogEvent::new(self, Level::Trace, message.into(), Location::caller())
    }

    #[track_caller]
    pub fn debug(&self, message: impl Into<String>) -> LogEvent<'_> {
        LogEvent::new(self, Level::Debug, message.into(), Location::caller())
    }

    #[track_caller]
    pub fn info(&self, message: impl Into<String>) -> LogEvent<'_> {
        LogEvent::new(self, Level::Info, message.into(), Location::caller())
    }

    #[track_caller]
    pub fn warn(&self, message: impl Into<String>) -> LogEvent<'_> {
        LogEvent::new(self, Level::Warn, message.into(), Location::caller())
    }

    #[track_caller]
    pub fn error(&self, message: impl Into<String>) -> LogEvent<'_> {
        LogEvent::new(self, Level::Error, message.into(), Location::caller())
    }

    #[track_caller]
    pub fn fatal(&self, message: impl Into<String>) -> LogEvent<'_> {
        LogEvent::new(self, Level::Fatal, message.into(), Location::caller())
    }

    /// ERROR record with a captured backtrace.
    ///
    /// When `error` is given, its type name becomes `error_type`. The topmost
    /// application frame of the backtrace supplies `function_name` and
    /// `file_path` (best-effort; omitted when symbols are unavailable).
    #[track_caller]
    pub fn error_with_trace<E: std::fmt::Display>(
        &self,
        message: impl Into<String>,
        error: Option<&E>,
    ) -> LogEvent<'_> {
        let trace = Backtrace::force_capture().to_string();
        let mut event = LogEvent::new(self, Level::Error, message.into(), Location::caller());
        if let Some((function, file)) = top_application_frame(&trace) {
            event.record.function_name = Some(function);
            event.record.file_path = Some(file);
        }
        event.record.stack_trace = Some(trace);
        if let Some(e) = error {
            event.record.error_type = Some(short_type_name::<E>());
            event = event.with("error", e.to_string());
        }
        event
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timing
    // ─────────────────────────────────────────────────────────────────────

    /// Start a manual timer; pass the result to [`end_timer`](Self::end_timer)
    pub fn start_timer(&self) -> Instant {
        Instant::now()
    }

    /// Finish a manual timer, stamping `duration_ms` on the record
    #[track_caller]
    pub fn end_timer(
        &self,
        start: Instant,
        level: Level,
        message: impl Into<String>,
    ) -> LogEvent<'_> {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mut event = LogEvent::new(self, level, message.into(), Location::caller());
        event.record.duration_ms = Some(elapsed_ms);
        event
    }

    /// Scoped timer: logs `message` with `duration_ms` when the guard drops
    #[track_caller]
    pub fn timer(&self, message: impl Into<String>) -> ScopedTimer<'_> {
        ScopedTimer {
            client: self,
            level: Level::Info,
            message: message.into(),
            caller_file: Location::caller().file(),
            start: Instant::now(),
        }
    }

    /// Measure a fallible operation.
    ///
    /// Success logs at `level` with the elapsed time; failure emits an ERROR
    /// record with a captured backtrace and the error propagates unchanged.
    #[track_caller]
    pub fn measure<T, E, F>(&self, level: Level, message: &str, f: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        let start = Instant::now();
        match f() {
            Ok(value) => {
                self.end_timer(start, level, format!("{message} completed"));
                Ok(value)
            }
            Err(e) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.error_with_trace(format!("{message} failed"), Some(&e))
                    .with("duration_ms", elapsed_ms);
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Counters describing the client's own behavior
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Orderly shutdown: signal the worker, wait up to 5 s for its final
    /// flush, and remove the panic hook. Idempotent; also runs on drop of the
    /// last handle.
    pub fn close(&self) {
        self.inner.close();
    }

    fn install_panic_hook(&self) {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let previous = self.inner.previous_panic_hook.clone();

        if let Ok(mut slot) = previous.lock() {
            *slot = Some(panic::take_hook());
        }

        let chain = previous.clone();
        panic::set_hook(Box::new(move |info| {
            if let Some(inner) = weak.upgrade() {
                inner.emit_panic(info);
            }
            if let Ok(slot) = chain.lock() {
                if let Some(prev) = slot.as_ref() {
                    prev(info);
                }
            }
        }));
    }

    pub(crate) fn enqueue(&self, record: QueuedLog, caller_file: Option<&'static str>) {
        self.inner.enqueue(record, caller_file);
    }
}

impl ClientInner {
    /// Enrich and enqueue. Precedence per field: explicit > call site >
    /// request context > user context > client defaults.
    fn enqueue(&self, mut record: QueuedLog, caller_file: Option<&'static str>) {
        if let Some(file) = caller_file {
            if record.file_path.is_none() {
                record.file_path = Some(file.to_string());
            }
        }

        if let Some(request) = context::request_context() {
            for (key, value) in request.iter() {
                record.set_default_field(key, value);
            }
        }
        if let Some(user) = context::user_context() {
            for (key, value) in user.iter() {
                record.set_default_field(key, value);
            }
        }

        if record.service.is_none() {
            record.service = self.config.service.clone();
        }
        if record.environment.is_none() {
            record.environment = Some(self.config.environment.clone());
        }
        if record.service_version.is_none() {
            record.service_version = Some(self.config.service_version.clone());
        }
        if record.log_type.is_none() {
            record.log_type = Some(self.config.log_type);
        }

        match self.tx.try_send(WorkerCommand::Store(Box::new(record))) {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                // Bounded queue discipline: never block or fail the caller
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn emit_panic(&self, info: &PanicHookInfo<'_>) {
        let trace = Backtrace::force_capture().to_string();
        let mut record = QueuedLog::new(Level::Error, format!("Uncaught panic: {info}"));
        record.error_type = Some("panic".to_string());
        if let Some((function, file)) = top_application_frame(&trace) {
            record.function_name = Some(function);
            record.file_path = Some(file);
        }
        record.stack_trace = Some(trace);
        self.enqueue(record, None);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Restore the panic hook we displaced, if any
        if let Ok(mut slot) = self.previous_panic_hook.lock() {
            if let Some(prev) = slot.take() {
                panic::set_hook(prev);
            }
        }

        // Wake the worker even when its queue is full of records
        let _ = self.tx.try_send(WorkerCommand::Shutdown);

        if self.completion.wait_timeout(Duration::from_secs(5)) {
            if let Ok(mut worker) = self.worker.lock() {
                if let Some(handle) = worker.take() {
                    let _ = handle.join();
                }
            }
        } else {
            tracing::warn!("log worker did not finish within 5s; abandoning final flush");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A record under construction; emits on drop
pub struct LogEvent<'a> {
    client: &'a LogClient,
    record: QueuedLog,
    caller_file: &'static str,
    emitted: bool,
}

impl<'a> LogEvent<'a> {
    fn new(
        client: &'a LogClient,
        level: Level,
        message: String,
        caller: &'static Location<'static>,
    ) -> Self {
        Self {
            client,
            record: QueuedLog::new(level, message),
            caller_file: caller.file(),
            emitted: false,
        }
    }

    /// Set a field by wire name; unknown names land in `metadata`.
    /// Explicit fields always win over context and defaults.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match key {
            "service" => self.record.service = value.as_str().map(String::from),
            "environment" => self.record.environment = value.as_str().map(String::from),
            "service_version" => self.record.service_version = value.as_str().map(String::from),
            "trace_id" => self.record.trace_id = value.as_str().map(String::from),
            "user_id" => self.record.user_id = value.as_str().map(String::from),
            "session_id" => self.record.session_id = value.as_str().map(String::from),
            "error_type" => self.record.error_type = value.as_str().map(String::from),
            "stack_trace" => self.record.stack_trace = value.as_str().map(String::from),
            "path" => self.record.path = value.as_str().map(String::from),
            "method" => self.record.method = value.as_str().map(String::from),
            "action_type" => self.record.action_type = value.as_str().map(String::from),
            "function_name" => self.record.function_name = value.as_str().map(String::from),
            "file_path" => self.record.file_path = value.as_str().map(String::from),
            "duration_ms" => self.record.duration_ms = value.as_f64(),
            "log_type" => {
                self.record.log_type = value.as_str().and_then(|s| s.parse().ok());
            }
            other => {
                self.record
                    .metadata
                    .get_or_insert_with(serde_json::Map::new)
                    .insert(other.to_string(), value);
            }
        }
        self
    }

    pub fn trace_id(self, id: impl Into<String>) -> Self {
        self.with("trace_id", id.into())
    }

    pub fn user_id(self, id: impl Into<String>) -> Self {
        self.with("user_id", id.into())
    }

    pub fn session_id(self, id: impl Into<String>) -> Self {
        self.with("session_id", id.into())
    }

    pub fn duration_ms(mut self, ms: f64) -> Self {
        self.record.duration_ms = Some(ms);
        self
    }

    /// Enqueue the record now instead of at end of statement
    pub fn emit(mut self) {
        self.send();
    }

    fn send(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        let record = std::mem::replace(&mut self.record, QueuedLog::new(Level::Info, ""));
        self.client.enqueue(record, Some(self.caller_file));
    }
}

impl Drop for LogEvent<'_> {
    fn drop(&mut self) {
        self.send();
    }
}

/// Guard returned by [`LogClient::timer`]; logs the elapsed time on drop
pub struct ScopedTimer<'a> {
    client: &'a LogClient,
    level: Level,
    message: String,
    caller_file: &'static str,
    start: Instant,
}

impl ScopedTimer<'_> {
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let mut record = QueuedLog::new(self.level, std::mem::take(&mut self.message));
        record.duration_ms = Some(self.start.elapsed().as_secs_f64() * 1000.0);
        self.client.enqueue(record, Some(self.caller_file));
    }
}

/// Last path segment of a type name: `payments::ChargeError` → `ChargeError`
fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

/// Extract `(function_name, file_path)` of the topmost application frame
/// from a rendered `std::backtrace::Backtrace`.
///
/// Frames belonging to the standard library, the backtrace machinery or this
/// module are skipped.
fn top_application_frame(trace: &str) -> Option<(String, String)> {
    let mut lines = trace.lines().peekable();
    while let Some(line) = lines.next() {
        let frame = line.trim_start();
        // Frame lines look like "12: path::to::function"
        let Some((index, symbol)) = frame.split_once(": ") else {
            continue;
        };
        if index.parse::<u32>().is_err() {
            continue;
        }
        let symbol = symbol.trim();
        if symbol.starts_with("std::")
            || symbol.starts_with("core::")
            || symbol.starts_with("alloc::")
            || symbol.starts_with("backtrace")
            || symbol.starts_with("rust_begin_unwind")
            || symbol.starts_with("loglens::client")
            || symbol.starts_with("<loglens::client")
        {
            continue;
        }
        // The next line, if any, carries "at <file>:<line>:<col>"
        if let Some(location) = lines.peek() {
            let location = location.trim_start();
            if let Some(rest) = location.strip_prefix("at ") {
                if rest.contains("/rustc/") {
                    continue;
                }
                let file = rest.rsplitn(3, ':').nth(2).unwrap_or(rest);
                return Some((symbol.to_string(), file.to_string()));
            }
        }
    }
    None
}
