//! modfleet library crate.
//!
//! Polling, dispatch and API quota governance for a moderation bot that runs
//! on many communities at once. [`fleet::Fleet`] is the entry point.

pub mod client;
pub mod config;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod manager;
pub mod nanny;
pub mod notification;
pub mod retry;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
