pub mod clock;
pub mod config;
pub mod datum;
pub mod error;
pub mod key;
pub mod types;

pub use error::{Error, Result, StatusCode};
