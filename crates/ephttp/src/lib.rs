//! # ephttp: keep-alive HTTP/1.1 on an edge-triggered epoll reactor
//!
//! One polling thread accepts connections, drains sockets and frames
//! requests; a fixed worker pool runs the application [`Handler`] and
//! writes the response. Each connection is registered one-shot, so its
//! requests are served strictly in order.
//!
//! ```text
//!   ┌──────────────── polling thread ───────────────┐    ┌─── workers ───┐
//!   Reactor::run ─► accept_drain ─► register(ONESHOT)
//!               └─► read_drain ─► try_parse ─► submit ─►  handler
//!                       ▲                                   │
//!                       └────────── rearm ◄── write_all ◄───┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use ephttp::{BodySink, Request, Server};
//!
//! let server = Server::listen(":8080")?;
//! server.start(|req: &Request<'_>, body: &mut BodySink<'_>| {
//!     if req.url() == b"/ping" {
//!         body.write_str(r#"{"ok":true}"#);
//!         200
//!     } else {
//!         404
//!     }
//! })?;
//! ```
//!
//! Configuration comes from [`ServerConfig`]; see [`config`] for the
//! `EPHTTP_*` environment variables.

pub mod accumulator;
pub mod config;
pub mod driver;
pub mod framer;
pub mod handler;
pub mod server;
pub mod worker;

pub use accumulator::{Accumulator, AccumulatorPool};
pub use config::ServerConfig;
pub use handler::{BodySink, Handler, Request};
pub use server::{Server, ShutdownHandle, Stats};
pub use worker::WorkerPool;

pub use ephttp_core::error::{EpError, Result};
