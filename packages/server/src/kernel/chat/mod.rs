// Ingress and the per-job processor.

pub mod ingress;
pub mod processor;

pub use ingress::{submit, ChatRequest, IngressReceipt};
pub use processor::{run as process_job, ProcessorOutcome};
