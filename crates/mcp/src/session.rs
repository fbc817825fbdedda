//! Backend sessions: one live MCP client connection per configured backend.
//!
//! [`BackendConnector`] and [`BackendSession`] are the seams the provider is
//! written against; [`RmcpConnector`] is the production implementation over the
//! `rmcp` client for stdio subprocesses, streamable HTTP endpoints and legacy
//! SSE sidecars.

use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation, PaginatedRequestParam,
    ProtocolVersion, RawContent, ResourceContents,
};
use rmcp::service::{Peer, RunningService, ServiceError};
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ClientHandler, RoleClient};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use datapilot_core::config::{BackendConfig, BackendTransport};

use crate::sse::SseClientTransport;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    Connection(String),
    #[error("{0}")]
    Application(String),
}

impl SessionError {
    /// Errors after which the session is unusable and must be rebuilt.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Connection(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Image { mime_type: String },
    Audio { mime_type: String },
    Resource { uri: String, text: Option<String> },
    Link { uri: String },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallOutcome {
    pub blocks: Vec<ContentBlock>,
    pub structured: Option<Value>,
    /// Set when the backend reported the call itself as failed.
    pub is_error: bool,
}

#[async_trait]
pub trait BackendSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>, SessionError>;

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<CallOutcome, SessionError>;

    /// Tears the connection down. Calls after close fail with a connection error.
    async fn close(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, backend: &BackendConfig) -> Result<Box<dyn BackendSession>, SessionError>;
}

#[derive(Clone)]
struct DatapilotClient {
    info: ClientInfo,
}

impl ClientHandler for DatapilotClient {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }
}

/// Connects over the transport named in each backend's configuration.
#[derive(Clone, Debug)]
pub struct RmcpConnector {
    client_name: String,
    client_version: String,
    /// Shared by legacy SSE backends; no overall timeout since the event stream stays open.
    http: reqwest::Client,
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self {
            client_name: "datapilot".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            http: reqwest::Client::new(),
        }
    }
}

impl RmcpConnector {
    fn handler(&self) -> DatapilotClient {
        DatapilotClient {
            info: ClientInfo {
                protocol_version: ProtocolVersion::LATEST,
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: self.client_name.clone(),
                    title: None,
                    version: self.client_version.clone(),
                    icons: None,
                    website_url: None,
                },
            },
        }
    }
}

#[async_trait]
impl BackendConnector for RmcpConnector {
    async fn connect(&self, backend: &BackendConfig) -> Result<Box<dyn BackendSession>, SessionError> {
        let handshake = async {
            match &backend.transport {
                BackendTransport::Stdio { command, args, env } => {
                    let mut process = tokio::process::Command::new(command);
                    process.args(args).envs(env);
                    let transport = TokioChildProcess::new(process)
                        .map_err(|error| SessionError::Connect(format!("failed to spawn `{command}`: {error}")))?;
                    rmcp::serve_client(self.handler(), transport)
                        .await
                        .map_err(|error| SessionError::Connect(error.to_string()))
                }
                BackendTransport::StreamableHttp { url } => {
                    let transport = StreamableHttpClientTransport::from_uri(url.clone());
                    rmcp::serve_client(self.handler(), transport)
                        .await
                        .map_err(|error| SessionError::Connect(error.to_string()))
                }
                BackendTransport::Sse { url } => {
                    let transport = SseClientTransport::connect(self.http.clone(), url)
                        .await
                        .map_err(|error| SessionError::Connect(error.to_string()))?;
                    rmcp::serve_client(self.handler(), transport)
                        .await
                        .map_err(|error| SessionError::Connect(error.to_string()))
                }
            }
        };

        let service = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await.map_err(|_| {
            SessionError::Connect(format!("handshake did not finish within {}s", HANDSHAKE_TIMEOUT.as_secs()))
        })??;

        info!(
            event_name = "mcp.backend.handshake",
            backend = %backend.name,
            transport = backend.transport_label(),
            "mcp handshake completed"
        );
        let peer = service.peer().clone();
        Ok(Box::new(RmcpSession { peer, service: Mutex::new(Some(service)) }))
    }
}

struct RmcpSession {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, DatapilotClient>>>,
}

#[async_trait]
impl BackendSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>, SessionError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .peer
                .list_tools(Some(PaginatedRequestParam { cursor }))
                .await
                .map_err(classify)?;
            tools.extend(page.tools.into_iter().map(|tool| RemoteTool {
                name: tool.name.to_string(),
                description: tool.description.map(|description| description.to_string()),
                input_schema: Value::Object((*tool.input_schema).clone()),
            }));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<CallOutcome, SessionError> {
        let result = self
            .peer
            .call_tool(CallToolRequestParam { name: name.to_string().into(), arguments: Some(arguments) })
            .await
            .map_err(classify)?;

        Ok(CallOutcome {
            blocks: result.content.into_iter().map(|content| content_block(content.raw)).collect(),
            structured: result.structured_content,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    async fn close(&self) -> Result<(), SessionError> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        let reason = service.cancel().await.map_err(|error| SessionError::Connection(error.to_string()))?;
        debug!(event_name = "mcp.session.closed", reason = ?reason, "mcp session closed");
        Ok(())
    }
}

fn content_block(raw: RawContent) -> ContentBlock {
    match raw {
        RawContent::Text(text) => ContentBlock::Text(text.text),
        RawContent::Image(image) => ContentBlock::Image { mime_type: image.mime_type },
        RawContent::Audio(audio) => ContentBlock::Audio { mime_type: audio.mime_type },
        RawContent::Resource(resource) => match resource.resource {
            ResourceContents::TextResourceContents { uri, text, .. } => {
                ContentBlock::Resource { uri, text: Some(text) }
            }
            ResourceContents::BlobResourceContents { uri, .. } => ContentBlock::Resource { uri, text: None },
        },
        RawContent::ResourceLink(link) => ContentBlock::Link { uri: link.uri },
    }
}

/// JSON-RPC errors come from a healthy backend; everything else means the
/// transport is gone.
fn classify(error: ServiceError) -> SessionError {
    match error {
        ServiceError::McpError(data) => SessionError::Application(data.message.to_string()),
        other => SessionError::Connection(other.to_string()),
    }
}
