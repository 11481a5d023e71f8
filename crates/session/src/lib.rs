//! Session-level coordination for Windlass.
//!
//! Sits between the transport layer (out of scope: HTTP/WebSocket, session
//! routing) and the iteration orchestrator:
//!
//! - [`StreamCoordinator`] runs one cancellable streaming execution per
//!   session id and forwards events to a transport sink callback.
//! - [`RateLimiter`] gates admission per caller identity, with separate
//!   presets for the plain and streaming paths.

pub mod coordinator;
pub mod rate_limit;

pub use coordinator::{EventSink, NullSessionStore, SessionStore, StreamCoordinator};
pub use rate_limit::{RateDecision, RateLimiter, SweeperHandle};
