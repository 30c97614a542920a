pub mod budget;
pub mod campaign;
pub mod config;
pub mod control;
pub mod drip;
pub mod enrollment;
pub mod error;
pub mod io;
pub mod message;
pub mod orchestrator;
pub mod paths;
pub mod retry;
pub mod risk;
pub mod sender;
pub mod store;
pub mod template;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{OutreachError, Result};
