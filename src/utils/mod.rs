//! Shared utilities: error types and logging setup.

pub mod error;
pub mod logger;

pub use error::{PvSrvError, Result};
pub use logger::init_logger;
