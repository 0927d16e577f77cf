// Shared helpers with no kernel dependencies.

pub mod ids;

pub use ids::{lane_id, request_fingerprint, safe_fs_id};
