//! # Monitoring
//!
//! Tracing subscriber setup for services embedding the cache coordinator and
//! for their test binaries.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use monitoring::init_logging;
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     init_logging().await?;
//!     Ok(())
//! }
//! ```

pub mod logging;

pub use logging::{LogDestination, LogSettings, init_logging, init_logging_with, init_test_logging};
