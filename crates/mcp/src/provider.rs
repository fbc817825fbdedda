use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use datapilot_core::config::{BackendConfig, McpConfig};
use datapilot_core::{ToolDescriptor, ToolError, ToolProvider};

use crate::adapter::{descriptor, render_outcome};
use crate::session::{BackendConnector, BackendSession, RmcpConnector, SessionError, SessionState};
use crate::{McpError, McpResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub transport: &'static str,
    pub state: SessionState,
    pub tools: usize,
}

struct SlotState {
    session: Option<Arc<dyn BackendSession>>,
    /// Bumped on every (re)connect so racing callers reconnect only once.
    generation: u64,
}

struct BackendSlot {
    config: BackendConfig,
    inner: Mutex<SlotState>,
    status: std::sync::Mutex<SessionState>,
}

impl BackendSlot {
    fn new(config: BackendConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SlotState { session: None, generation: 0 }),
            status: std::sync::Mutex::new(SessionState::Disconnected),
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn set_status(&self, state: SessionState) {
        match self.status.lock() {
            Ok(mut status) => *status = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn status(&self) -> SessionState {
        match self.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Current session, connecting first if there is none.
    async fn session(
        &self,
        connector: &dyn BackendConnector,
    ) -> Result<(Arc<dyn BackendSession>, u64), SessionError> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = &inner.session {
            return Ok((Arc::clone(session), inner.generation));
        }
        let session = self.connect(connector).await?;
        inner.session = Some(Arc::clone(&session));
        inner.generation += 1;
        Ok((session, inner.generation))
    }

    /// Replaces the session observed at `seen_generation`. If another caller
    /// already replaced it, that newer session is returned instead.
    async fn reconnect(
        &self,
        connector: &dyn BackendConnector,
        seen_generation: u64,
        backoff: Duration,
        close_timeout: Duration,
    ) -> Result<Arc<dyn BackendSession>, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.generation != seen_generation {
            if let Some(session) = &inner.session {
                return Ok(Arc::clone(session));
            }
        }

        if let Some(stale) = inner.session.take() {
            close_session(self.name(), stale.as_ref(), close_timeout).await;
        }
        self.set_status(SessionState::Disconnected);
        tokio::time::sleep(backoff).await;

        let session = self.connect(connector).await?;
        inner.session = Some(Arc::clone(&session));
        inner.generation += 1;
        info!(event_name = "mcp.backend.reconnected", backend = %self.name(), "mcp backend reconnected");
        Ok(session)
    }

    async fn connect(&self, connector: &dyn BackendConnector) -> Result<Arc<dyn BackendSession>, SessionError> {
        self.set_status(SessionState::Connecting);
        match connector.connect(&self.config).await {
            Ok(session) => {
                self.set_status(SessionState::Connected);
                info!(
                    event_name = "mcp.backend.connected",
                    backend = %self.name(),
                    transport = self.config.transport_label(),
                    "mcp backend connected"
                );
                Ok(Arc::from(session))
            }
            Err(error) => {
                self.set_status(SessionState::Failed);
                warn!(
                    event_name = "mcp.backend.connect_failed",
                    backend = %self.name(),
                    error = %error,
                    "mcp backend connection failed"
                );
                Err(error)
            }
        }
    }

    async fn shutdown(&self, close_timeout: Duration) {
        let stale = self.inner.lock().await.session.take();
        if let Some(session) = stale {
            close_session(self.name(), session.as_ref(), close_timeout).await;
        }
        self.set_status(SessionState::Disconnected);
    }
}

async fn close_session(backend: &str, session: &dyn BackendSession, timeout: Duration) {
    match tokio::time::timeout(timeout, session.close()).await {
        Ok(Ok(())) => debug!(event_name = "mcp.backend.closed", backend, "mcp session closed"),
        Ok(Err(error)) => {
            warn!(event_name = "mcp.backend.close_failed", backend, error = %error, "mcp session close failed")
        }
        Err(_) => warn!(
            event_name = "mcp.backend.close_timeout",
            backend,
            timeout_secs = timeout.as_secs_f64(),
            "mcp session close timed out"
        ),
    }
}

struct Catalog {
    tools: Arc<Vec<ToolDescriptor>>,
    /// Tool name to index of the owning slot.
    routes: HashMap<String, usize>,
}

/// Tool provider over N MCP backends with one merged, cached catalog.
pub struct McpToolProvider {
    connector: Arc<dyn BackendConnector>,
    slots: Vec<Arc<BackendSlot>>,
    catalog: RwLock<Option<Arc<Catalog>>>,
    reconnect_backoff: Duration,
    close_timeout: Duration,
    closed: AtomicBool,
}

impl McpToolProvider {
    pub fn from_config(config: &McpConfig) -> McpResult<Self> {
        Self::new(config, Arc::new(RmcpConnector::default()))
    }

    pub fn new(config: &McpConfig, connector: Arc<dyn BackendConnector>) -> McpResult<Self> {
        let mut seen = std::collections::HashSet::new();
        for backend in &config.servers {
            if !seen.insert(backend.name.as_str()) {
                return Err(McpError::DuplicateBackend(backend.name.clone()));
            }
        }

        Ok(Self {
            connector,
            slots: config.servers.iter().cloned().map(|backend| Arc::new(BackendSlot::new(backend))).collect(),
            catalog: RwLock::new(None),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
            close_timeout: Duration::from_secs(config.close_timeout_secs),
            closed: AtomicBool::new(false),
        })
    }

    pub fn backend_count(&self) -> usize {
        self.slots.len()
    }

    pub async fn backend_status(&self) -> Vec<BackendStatus> {
        let catalog = self.catalog.read().await.clone();
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| BackendStatus {
                name: slot.name().to_string(),
                transport: slot.config.transport_label(),
                state: slot.status(),
                tools: catalog
                    .as_ref()
                    .map(|catalog| catalog.routes.values().filter(|owner| **owner == index).count())
                    .unwrap_or(0),
            })
            .collect()
    }

    async fn catalog(&self) -> Result<Arc<Catalog>, ToolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolError::Closed);
        }
        if let Some(catalog) = self.catalog.read().await.as_ref() {
            return Ok(Arc::clone(catalog));
        }

        let mut cached = self.catalog.write().await;
        if let Some(catalog) = cached.as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let catalog = Arc::new(self.discover().await);
        *cached = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    async fn discover(&self) -> Catalog {
        let listings = join_all(self.slots.iter().map(|slot| async move {
            let (session, _) = slot.session(self.connector.as_ref()).await?;
            session.list_tools().await
        }))
        .await;

        let mut tools = Vec::new();
        let mut routes = HashMap::new();
        for (index, (slot, listing)) in self.slots.iter().zip(listings).enumerate() {
            let remote = match listing {
                Ok(remote) => remote,
                Err(error) => {
                    warn!(
                        event_name = "mcp.backend.discovery_failed",
                        backend = %slot.name(),
                        error = %error,
                        "backend skipped during tool discovery"
                    );
                    continue;
                }
            };
            for tool in remote {
                if let Some(owner) = routes.get(&tool.name) {
                    let owner: &Arc<BackendSlot> = &self.slots[*owner];
                    warn!(
                        event_name = "mcp.tool.duplicate",
                        tool = %tool.name,
                        kept = %owner.name(),
                        ignored = %slot.name(),
                        "tool name offered by more than one backend"
                    );
                    continue;
                }
                routes.insert(tool.name.clone(), index);
                tools.push(descriptor(&tool, slot.name()));
            }
        }

        info!(
            event_name = "mcp.catalog.discovered",
            backends = self.slots.len(),
            tools = tools.len(),
            "mcp tool catalog discovered"
        );
        Catalog { tools: Arc::new(tools), routes }
    }

    async fn call_with_reconnect(
        &self,
        slot: &BackendSlot,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, ToolError> {
        let connector = self.connector.as_ref();
        let (session, generation) = slot.session(connector).await.map_err(|error| tool_error(slot, error))?;

        let error = match session.call_tool(name, arguments.clone()).await {
            Ok(outcome) => return Ok(render_outcome(outcome)),
            Err(error) if error.is_connection() => error,
            Err(error) => return Err(tool_error(slot, error)),
        };

        warn!(
            event_name = "mcp.call.retrying",
            backend = %slot.name(),
            tool = name,
            error = %error,
            "connection lost during tool call, reconnecting once"
        );
        let retried = match slot.reconnect(connector, generation, self.reconnect_backoff, self.close_timeout).await {
            Ok(session) => session.call_tool(name, arguments).await,
            Err(error) => Err(error),
        };

        match retried {
            Ok(outcome) => Ok(render_outcome(outcome)),
            Err(error) => {
                if error.is_connection() {
                    self.catalog.write().await.take();
                }
                Err(tool_error(slot, error))
            }
        }
    }
}

fn tool_error(slot: &BackendSlot, error: SessionError) -> ToolError {
    let backend = slot.name().to_string();
    match error {
        SessionError::Connect(message) | SessionError::Connection(message) => {
            ToolError::Connection { backend, message }
        }
        SessionError::Application(message) => ToolError::Backend { backend, message },
    }
}

#[async_trait]
impl ToolProvider for McpToolProvider {
    async fn tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, ToolError> {
        Ok(Arc::clone(&self.catalog().await?.tools))
    }

    async fn call(&self, name: &str, arguments: Map<String, Value>) -> Result<String, ToolError> {
        let catalog = self.catalog().await?;
        let Some(slot) = catalog.routes.get(name).and_then(|index| self.slots.get(*index)) else {
            return Err(ToolError::NotFound { name: name.to_string() });
        };
        debug!(event_name = "mcp.call.dispatch", backend = %slot.name(), tool = name, "dispatching tool call");
        self.call_with_reconnect(slot, name, arguments).await
    }

    async fn invalidate(&self) {
        self.catalog.write().await.take();
        debug!(event_name = "mcp.catalog.invalidated", "mcp tool catalog invalidated");
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.catalog.write().await.take();
        join_all(self.slots.iter().map(|slot| slot.shutdown(self.close_timeout))).await;
        info!(event_name = "mcp.provider.closed", backends = self.slots.len(), "mcp provider closed");
    }
}
