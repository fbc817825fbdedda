use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::tool::ToolDescriptor;
use crate::errors::ToolError;

/// Source of callable tools for the agent. Implementations own connection
/// management; callers only see a merged catalog and a text result per call.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Merged tool catalog. Cached by implementations until [`ToolProvider::invalidate`].
    async fn tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, ToolError>;

    /// Invokes `name` and renders its result as display text. Backend-reported
    /// errors come back as `Ok` text; `Err` is reserved for failures to reach the tool.
    async fn call(&self, name: &str, arguments: Map<String, Value>) -> Result<String, ToolError>;

    /// Drops the cached catalog so the next [`ToolProvider::tools`] rediscovers.
    async fn invalidate(&self);

    async fn close(&self);
}

/// Provider with no backends, used when none are configured.
#[derive(Clone, Debug, Default)]
pub struct EmptyToolProvider;

#[async_trait]
impl ToolProvider for EmptyToolProvider {
    async fn tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, ToolError> {
        Ok(Arc::new(Vec::new()))
    }

    async fn call(&self, name: &str, _arguments: Map<String, Value>) -> Result<String, ToolError> {
        Err(ToolError::NotFound { name: name.to_string() })
    }

    async fn invalidate(&self) {}

    async fn close(&self) {}
}
