//! # ephttp-core: shared types for the ephttp server
//!
//! Platform-level vocabulary used by both the reactor and the HTTP layer:
//!
//! - [`error`]: the `EpError` taxonomy and `Result` alias
//! - [`event`]: `EventMask`, a thin wrapper over epoll event bits
//! - [`kprint`]: leveled stderr logging macros (`kinfo!`, `kerror!`, ...)
//! - [`env`]: typed environment variable lookups for configuration

pub mod env;
pub mod error;
pub mod event;
pub mod kprint;

pub use error::{EpError, Result};
pub use event::EventMask;
