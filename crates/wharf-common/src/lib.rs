//! # Wharf Common
//!
//! Common utilities for the Wharf service-worker runtime.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Console passthrough injected into worker scopes
//! - Timer passthroughs over the async runtime

pub mod console;
pub mod logging;
pub mod timers;

pub use console::Console;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use timers::Timers;
