//! Core domain types and traits for the Windlass agent orchestration runtime.
//!
//! This crate defines the vocabulary the rest of the workspace speaks:
//!
//! - [`turn`]: conversation turns and their parts (text, tool calls, tool
//!   responses), the units a transcript is made of
//! - [`model`]: the [`ModelBackend`] trait and its request/output types
//! - [`tool`]: the [`Tool`] trait and the registry the loop executes from
//! - [`error`]: the error taxonomy, one enum per bounded context
//!
//! No I/O happens here; everything network- or task-shaped lives in the
//! `windlass-providers`, `windlass-agent`, and `windlass-session` crates.

pub mod error;
pub mod model;
pub mod tool;
pub mod turn;

pub use error::{Error, ModelError, Result, ToolError};
pub use model::{
    BackendError, ModelBackend, ModelChunk, ModelOutput, ModelRequest, ToolDeclaration, Usage,
};
pub use tool::{Tool, ToolRegistry};
pub use turn::{ContentBlock, Part, Role, ToolCallRequest, ToolResult, Turn};
