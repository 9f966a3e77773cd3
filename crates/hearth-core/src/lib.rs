pub mod addr;
pub mod config;
pub mod error;
pub mod timefmt;
pub mod types;

pub use error::{Error, Result};
