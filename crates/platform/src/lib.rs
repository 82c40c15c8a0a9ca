//! # skein platform
//!
//! Types shared by every skein crate.
//!
//! This crate provides:
//! - Unified error type (`SkeinError`, `SkeinResult`) and RFC 4253 disconnect reason codes
//! - `Event`, a one-shot completion cell used for cross-task signalling
//!
//! # Examples
//!
//! ```
//! use skein_platform::{SkeinError, SkeinResult};
//!
//! fn example_function() -> SkeinResult<String> {
//!     Ok("Hello, skein!".to_string())
//! }
//!
//! # fn main() -> SkeinResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, skein!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod event;

pub use error::{DisconnectReason, SkeinError, SkeinResult};
pub use event::Event;

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
