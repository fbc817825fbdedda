//! Shared building blocks for the datapilot agent: layered configuration, the
//! conversation and tool model, the error taxonomy, and the ports the engine
//! talks through (tool provider, checkpoint store, progress sink).

pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod errors;
pub mod progress;
pub mod tools;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
pub use domain::conversation::{
    ContentPart, ConversationState, Intent, Message, MessageContent, Role, ThreadId, ToolCall,
};
pub use domain::tool::{ParameterSpec, ParameterType, ToolDescriptor};
pub use errors::{ApplicationError, CheckpointError, DomainError, InterfaceError, ToolError};
pub use progress::{
    InMemoryProgressSink, NoopProgressSink, ProgressEvent, ProgressKind, ProgressReporter,
    ProgressSink,
};
pub use tools::{EmptyToolProvider, ToolProvider};
