//! Polling streams and the fleet-wide stream multiplexer.

mod continuity;
mod multiplexer;
mod poll;

pub use continuity::{ContinuityHandle, ContinuityState};
pub use multiplexer::{MultiplexerSettings, StreamMultiplexer};
pub use poll::{PollStream, PollStreamConfig, StreamEvent, StreamStatus};
