//! `th-domain`: configuration and shared error types for toolhost.
//!
//! Kept free of runtime dependencies so the CLI and the MCP client can
//! both depend on it without pulling in each other.

pub mod config;
pub mod error;
