//! Stitch - a conversation gateway for chat backends
//!
//! Relays conversation requests to an upstream chat backend, streams the
//! server-sent events back to the caller, and transparently continues replies
//! the upstream cut off at its length limit.

pub mod config;
pub mod error;
pub mod proxy;
pub mod relay;
pub mod testing;

pub use error::StitchError;
