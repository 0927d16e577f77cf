// Kernel: the orchestration core's infrastructure.
//
// Everything here is owned by an explicit ChatKernel instance; there is no
// process-global state. The HTTP surface in `server/` and the worker pool
// both operate through the kernel.

pub mod chat;
pub mod chat_kernel;
pub mod errors;
pub mod event_log;
pub mod fs_atomic;
pub mod history;
pub mod idempotency;
pub mod jobs;
pub mod lanes;
pub mod lock_file;
pub mod signal;
pub mod test_support;
pub mod tools;
pub mod worker;

pub use chat_kernel::{ChatKernel, DispatchedJob};
pub use errors::{CoreError, ErrorKind};
pub use event_log::{encode_sse, sse_data, ChatEvent, EventLog, EventType};
pub use signal::SignalRegistry;
pub use worker::WorkerPool;
