// Chat Job Orchestration Core
//
// This crate is the backend core for the assistant platform's chat runtime:
// it accepts chat requests, serializes them per actor through lanes, drives
// the LLM tool loop on a worker pool, and streams incremental events back
// over a resumable SSE endpoint.
//
// Layering: `kernel/` holds the infrastructure (stores, locks, lanes,
// workers), `server/` the HTTP surface, `common/` shared helpers. Business
// skills (homework generation, exam analysis, …) live behind the tool
// registry and the gateway, outside this crate.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
