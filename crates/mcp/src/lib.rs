//! Datapilot MCP (Model Context Protocol) tool provider
//!
//! This crate connects the agent to any number of MCP backends and presents
//! them as one [`datapilot_core::ToolProvider`].
//!
//! ## Architecture
//!
//! - `McpToolProvider`: merged, cached catalog with routing and reconnect-once retry
//! - `session`: per-backend client sessions over stdio, streamable HTTP or legacy SSE
//! - `sse`: the legacy HTTP+SSE client transport
//! - `adapter`: descriptor mapping and result rendering
//!
//! ## Example Usage
//!
//! ```no_run
//! use datapilot_core::config::AppConfig;
//! use datapilot_core::ToolProvider;
//! use datapilot_mcp::McpToolProvider;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::default();
//!     let provider = McpToolProvider::from_config(&config.mcp)?;
//!     for tool in provider.tools().await?.iter() {
//!         println!("{} ({})", tool.name, tool.backend);
//!     }
//!     provider.close().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod provider;
pub mod session;
pub mod sse;

pub use provider::{BackendStatus, McpToolProvider};
pub use session::{
    BackendConnector, BackendSession, CallOutcome, ContentBlock, RemoteTool, RmcpConnector,
    SessionError, SessionState,
};
pub use sse::{SseClientTransport, SseTransportError};

use thiserror::Error;

/// Errors raised while assembling the provider.
#[derive(Error, Debug)]
pub enum McpError {
    #[error("backend `{0}` is configured more than once")]
    DuplicateBackend(String),
}

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;
