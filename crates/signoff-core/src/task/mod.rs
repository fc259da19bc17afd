//! Named synchronous task handlers invoked by the executor.

pub mod registry;

pub use registry::{TaskHandler, TaskRegistry};
