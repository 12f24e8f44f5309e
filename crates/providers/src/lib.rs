//! Model client implementations for Deepnest.
//!
//! The [`deepnest_core::model::ModelClient`] trait is implemented here for
//! the Anthropic Messages API. The adapter assembles whole content blocks
//! from the wire protocol in both directions and classifies HTTP failures
//! into transient and fatal model errors for the driver's retry policy.

pub mod anthropic;
pub mod pacer;

pub use anthropic::AnthropicClient;
pub use pacer::RequestPacer;
