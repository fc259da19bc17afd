//! In-process event distribution.

pub mod bus;

pub use bus::{DlqSink, EventBus, EventHandler, HandlerError};
