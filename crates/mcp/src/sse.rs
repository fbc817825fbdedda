//! Client side of the legacy HTTP+SSE transport.
//!
//! The server streams JSON-RPC messages over one long-lived `GET`. Its first
//! event, `endpoint`, names the URL that client messages are posted to; every
//! reply arrives back on the stream as a `message` event.

use std::future::Future;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use rmcp::transport::Transport;
use rmcp::RoleClient;
use sse_stream::{Sse, SseStream};
use thiserror::Error;
use tracing::{debug, warn};

const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

#[derive(Debug, Error)]
pub enum SseTransportError {
    #[error("invalid sse url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("sse request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("expected an event stream, server answered with `{0}`")]
    UnexpectedContentType(String),
    #[error("event stream ended before the server announced its message endpoint")]
    MissingEndpoint,
    #[error("event stream broke: {0}")]
    Stream(String),
}

pub struct SseClientTransport {
    client: reqwest::Client,
    post_url: Url,
    events: BoxStream<'static, Result<Sse, String>>,
}

impl SseClientTransport {
    /// Opens the event stream and waits for the `endpoint` announcement.
    pub async fn connect(client: reqwest::Client, url: &str) -> Result<Self, SseTransportError> {
        let stream_url = Url::parse(url)
            .map_err(|error| SseTransportError::InvalidUrl { url: url.to_string(), reason: error.to_string() })?;

        let response = client
            .get(stream_url.clone())
            .header(ACCEPT, EVENT_STREAM_MIME_TYPE)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).to_string())
            .unwrap_or_default();
        if !content_type.starts_with(EVENT_STREAM_MIME_TYPE) {
            return Err(SseTransportError::UnexpectedContentType(content_type));
        }

        let mut events = SseStream::from_bytes_stream(response.bytes_stream())
            .map(|event| event.map_err(|error| error.to_string()))
            .boxed();

        while let Some(event) = events.next().await {
            let event = event.map_err(SseTransportError::Stream)?;
            if event.event.as_deref() != Some("endpoint") {
                continue;
            }
            let post_url = resolve_endpoint(&stream_url, event.data.as_deref().unwrap_or_default())?;
            debug!(
                event_name = "mcp.sse.endpoint",
                stream = %stream_url,
                endpoint = %post_url,
                "sse message endpoint announced"
            );
            return Ok(Self { client, post_url, events });
        }

        Err(SseTransportError::MissingEndpoint)
    }

    pub fn post_url(&self) -> &Url {
        &self.post_url
    }
}

/// Endpoints are usually relative (`/messages/?session_id=..`) and must stay on
/// the stream's origin.
pub fn resolve_endpoint(stream_url: &Url, endpoint: &str) -> Result<Url, SseTransportError> {
    let endpoint = endpoint.trim();
    let resolved = stream_url.join(endpoint).map_err(|error| SseTransportError::InvalidUrl {
        url: endpoint.to_string(),
        reason: error.to_string(),
    })?;
    if resolved.origin() != stream_url.origin() {
        return Err(SseTransportError::InvalidUrl {
            url: endpoint.to_string(),
            reason: format!("endpoint origin differs from stream origin {}", stream_url.origin().ascii_serialization()),
        });
    }
    Ok(resolved)
}

/// `None` for events that carry no server message; undecodable payloads are
/// logged and skipped.
pub fn decode_message(event: Sse) -> Option<ServerJsonRpcMessage> {
    match event.event.as_deref() {
        None | Some("message") => {}
        Some(other) => {
            debug!(event_name = "mcp.sse.event_ignored", kind = other, "ignoring sse event");
            return None;
        }
    }

    let data = event.data?;
    match serde_json::from_str(&data) {
        Ok(message) => Some(message),
        Err(error) => {
            warn!(event_name = "mcp.sse.decode_failed", error = %error, "dropping undecodable sse message");
            None
        }
    }
}

impl Transport<RoleClient> for SseClientTransport {
    type Error = SseTransportError;

    fn send(
        &mut self,
        item: ClientJsonRpcMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let client = self.client.clone();
        let post_url = self.post_url.clone();
        async move {
            client.post(post_url).json(&item).send().await?.error_for_status()?;
            Ok(())
        }
    }

    fn receive(&mut self) -> impl Future<Output = Option<ServerJsonRpcMessage>> + Send {
        async move {
            while let Some(event) = self.events.next().await {
                match event {
                    Ok(event) => {
                        if let Some(message) = decode_message(event) {
                            return Some(message);
                        }
                    }
                    Err(error) => {
                        warn!(event_name = "mcp.sse.stream_failed", error = %error, "sse stream broke");
                        return None;
                    }
                }
            }
            None
        }
    }

    /// Dropping the stream closes the `GET`; the server ends the session with it.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.events = futures::stream::empty().boxed();
        std::future::ready(Ok(()))
    }
}
