//! Common types used throughout the shepherd runtime.
mod config;

pub use shepherd_core::info::*;
pub use shepherd_core::{Span, MAX_DIMS};

pub use self::config::*;

/// Position of a device inside a grid topology, in `0..nnodes`.
pub type SeqId = usize;
