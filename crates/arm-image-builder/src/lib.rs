pub mod builder;
pub mod config;
pub mod devices;
pub mod error;
pub mod executor;
pub mod flasher;
pub mod image;
pub mod log_sanitize;
pub mod mbr;
pub mod pipeline;
pub mod progress;
pub mod steps;
pub mod ui;

pub use error::{Error, Result};
