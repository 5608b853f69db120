//! Infrastructure layer: quota ledger, job queue, workers and external adapters.

pub mod config;
pub mod external;
pub mod jobs;
pub mod quota;
