//! Agent Runtime - conversational data assistant engine
//!
//! This crate is the "brain" of datapilot. Each user turn runs a bounded loop:
//! 1. **Intent Classification** (`classifier`) - one model call picks DATABASE, API or GENERAL
//! 2. **Reasoning** (`runtime`, `conversation`, `markup`) - the model sees a repaired history
//!    and the tools bound to the intent; inline tool markup is recovered into calls
//! 3. **Validated Execution** (`executor`, `guardrails`) - SQL passes the safety gate, every
//!    call runs concurrently under its own timeout
//! 4. back to reasoning until the model answers without tool calls
//!
//! # Key Types
//!
//! - `AgentRuntime` - turn orchestrator with step budget and per-thread serialization
//! - `LlmClient` - pluggable chat-completions trait (OpenAI, DeepSeek, Ollama)
//! - `SqlGuard` - AST-level read-only gate for query tool calls
//!
//! # Safety Principle
//!
//! The model never reaches the database with anything but a re-emitted,
//! read-only statement. Rejections go back to the model as tool results.

pub mod classifier;
pub mod conversation;
pub mod executor;
pub mod guardrails;
pub mod llm;
pub mod markup;
pub mod progress;
pub mod runtime;
pub mod tools;

pub use llm::{LlmClient, LlmError, LlmReply, OpenAiCompatibleClient};
pub use progress::BroadcastProgressSink;
pub use runtime::{AgentRuntime, RuntimeBuildError, RuntimeDeps, TurnError, APOLOGY};
