//! # Capstan Platform
//!
//! Shared foundation for the Capstan SSH library.
//!
//! This crate provides:
//! - The error taxonomy (`TransportError`, `ConnectionError`, `UserAuthError`,
//!   umbrella `CapstanError`) with per-layer `Result` aliases
//! - RFC 4250 disconnect and channel-open-failure reason codes
//! - The [`Event`] completion primitive used for cross-task hand-off
//!
//! # Examples
//!
//! ```
//! use capstan_platform::{TransportError, TransportResult};
//!
//! fn check(len: usize) -> TransportResult<()> {
//!     if len > 256 * 1024 {
//!         return Err(TransportError::protocol("packet too large"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check(42).is_ok());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod event;

pub use error::{
    CapstanError, CapstanResult, ConnectionError, ConnectionResult, DisconnectReason,
    OpenFailureReason, TransportError, TransportResult, UserAuthError, UserAuthResult,
};
pub use event::Event;

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
