//! Observability wiring for Signoff.

pub mod tracing_setup;
