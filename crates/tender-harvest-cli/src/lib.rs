//! Command handlers behind the `tender-harvest` binary.

pub mod commands;
pub mod confirm;
pub mod output;
pub mod progress;

pub use commands::Context;
