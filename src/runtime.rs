//! Runtime glue shared by the worker: configuration, backoff policies, the
//! processor extension point, fatal error capture, and telemetry.

pub mod backoff;
pub mod config;
pub mod fatal;
pub mod processor;
pub mod telemetry;
