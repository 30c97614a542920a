//! Polling scheduler and the per-campaign dispatch worker it fans out to.

pub mod dispatch;
pub mod scheduler;

pub use dispatch::{BatchReport, Dispatcher};
pub use scheduler::{Scheduler, TickReport};
