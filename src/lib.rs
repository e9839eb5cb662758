// loglens - log ingestion, storage and natural-language analysis
//
// Three subsystems share this crate:
// - Ingestion client (`client`): a non-blocking, batching, compressing log
//   emitter for application code. Hot-path cost is a record build plus a
//   bounded-queue push; a dedicated worker thread owns delivery.
// - Collector (`collector`): accepts compressed batches over HTTP and
//   bulk-inserts them into PostgreSQL via binary COPY.
// - Analysis server (`analysis` + `agent`): translates natural-language
//   questions into safe read-only SQL through a staged workflow, streams
//   progress over WebSocket, caches results and raises anomaly alerts.
//
// The servers run as subcommands of the `loglens` binary; the client is the
// library surface applications link against.

pub mod agent;
pub mod alerting;
pub mod analysis;
pub mod cache;
pub mod client;
pub mod collector;
pub mod config;
pub mod conversation;
pub mod errors;
pub mod llm;
pub mod model;
pub mod storage;
pub mod supervisor;

pub use client::{ClientConfig, LogClient};
pub use model::{Level, LogSource};
