//! # rirc-cli
//!
//! Line-oriented terminal driver over `rirc-core`: configuration loading and
//! the event handler that keeps a single server session registered.

pub mod config;
pub mod session;
