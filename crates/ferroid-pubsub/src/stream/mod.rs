//! Ordered delivery of streamed responses.
//!
//! ## Submodules
//!
//! - [`ordered`] - Reassembles out-of-order chunks into a strictly ordered
//!   stream.

pub mod ordered;

pub use ordered::{OrderedStream, StreamWriter, ordered_stream};
