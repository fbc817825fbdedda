//! `OpenAiCompatibleClient::complete_streaming` against an in-process
//! chat-completions endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use datapilot_agent::{LlmClient, OpenAiCompatibleClient};
use datapilot_core::config::{AppConfig, LlmConfig};
use datapilot_core::Message;

const STREAMED_ANSWER: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"There are \"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"42\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\" orders.\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
);

#[derive(Clone, Copy)]
enum Mode {
    Stream,
    IgnoreStreamFlag,
    FailFirst,
}

#[derive(Clone)]
struct Endpoint {
    mode: Mode,
    requests: Arc<AtomicUsize>,
    stream_flags: Arc<Mutex<Vec<Value>>>,
}

async fn chat_completions(State(endpoint): State<Endpoint>, Json(body): Json<Value>) -> Response {
    let attempt = endpoint.requests.fetch_add(1, Ordering::SeqCst);
    endpoint.stream_flags.lock().expect("lock").push(body["stream"].clone());

    match endpoint.mode {
        Mode::FailFirst if attempt == 0 => (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response(),
        Mode::Stream | Mode::FailFirst => ([(CONTENT_TYPE, "text/event-stream")], STREAMED_ANSWER).into_response(),
        Mode::IgnoreStreamFlag => Json(json!({
            "choices": [{"message": {"role": "assistant", "content": "There are 42 orders."}}]
        }))
        .into_response(),
    }
}

async fn spawn_endpoint(mode: Mode) -> (LlmConfig, Endpoint) {
    let endpoint =
        Endpoint { mode, requests: Arc::new(AtomicUsize::new(0)), stream_flags: Arc::new(Mutex::new(Vec::new())) };
    let app = Router::new().route("/v1/chat/completions", post(chat_completions)).with_state(endpoint.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let config = LlmConfig {
        base_url: Some(format!("http://{addr}/v1")),
        max_retries: 1,
        timeout_secs: 5,
        ..AppConfig::default().llm
    };
    (config, endpoint)
}

async fn collect(config: &LlmConfig) -> (String, Vec<String>) {
    let client = OpenAiCompatibleClient::from_config(config).expect("client");
    let tokens = Mutex::new(Vec::new());
    let on_token = |text: &str| tokens.lock().expect("lock").push(text.to_string());

    let reply = client
        .complete_streaming(&[Message::user("how many orders?")], &[], &on_token)
        .await
        .expect("completion");
    let tokens = tokens.into_inner().expect("lock");
    (reply.content, tokens)
}

#[tokio::test]
async fn deltas_are_forwarded_as_they_arrive() {
    let (config, endpoint) = spawn_endpoint(Mode::Stream).await;

    let (content, tokens) = collect(&config).await;

    assert_eq!(content, "There are 42 orders.");
    assert_eq!(tokens, vec!["There are ", "42", " orders."]);
    assert_eq!(*endpoint.stream_flags.lock().expect("lock"), vec![json!(true)]);
}

#[tokio::test]
async fn servers_that_ignore_streaming_report_the_answer_once() {
    let (config, _endpoint) = spawn_endpoint(Mode::IgnoreStreamFlag).await;

    let (content, tokens) = collect(&config).await;

    assert_eq!(content, "There are 42 orders.");
    assert_eq!(tokens, vec!["There are 42 orders."]);
}

#[tokio::test]
async fn failures_before_the_first_token_are_retried() {
    let (config, endpoint) = spawn_endpoint(Mode::FailFirst).await;

    let (content, tokens) = collect(&config).await;

    assert_eq!(content, "There are 42 orders.");
    assert_eq!(tokens.len(), 3);
    assert_eq!(endpoint.requests.load(Ordering::SeqCst), 2);
}
