use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use datapilot_core::config::{AppConfig, BackendTransport, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

fn field(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Field {
    Field { key, value, env_keys }
}

struct ConfigFile {
    path: PathBuf,
    doc: Value,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file = detect_config_path().and_then(|path| load_config_file(&path));
    render(&config, file.as_ref())
}

fn render(config: &AppConfig, file: Option<&ConfigFile>) -> String {
    let fields = vec![
        field("database.url", config.database.url.clone(), &["DATAPILOT_DATABASE_URL"]),
        field(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["DATAPILOT_DATABASE_MAX_CONNECTIONS"],
        ),
        field(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["DATAPILOT_DATABASE_TIMEOUT_SECS"],
        ),
        field("llm.provider", config.llm.provider.as_str().to_string(), &["DATAPILOT_LLM_PROVIDER"]),
        field("llm.model", config.llm.model.clone(), &["DATAPILOT_LLM_MODEL"]),
        field("llm.base_url", config.llm.resolved_base_url().to_string(), &["DATAPILOT_LLM_BASE_URL"]),
        field(
            "llm.api_key",
            if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" }.to_string(),
            &["DATAPILOT_LLM_API_KEY"],
        ),
        field("llm.temperature", config.llm.temperature.to_string(), &["DATAPILOT_LLM_TEMPERATURE"]),
        field("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["DATAPILOT_LLM_TIMEOUT_SECS"]),
        field("llm.max_retries", config.llm.max_retries.to_string(), &["DATAPILOT_LLM_MAX_RETRIES"]),
        field("agent.max_steps", config.agent.max_steps.to_string(), &["DATAPILOT_AGENT_MAX_STEPS"]),
        field(
            "agent.tool_timeout_secs",
            config.agent.tool_timeout_secs.to_string(),
            &["DATAPILOT_AGENT_TOOL_TIMEOUT_SECS"],
        ),
        field(
            "agent.history_window",
            config.agent.history_window.to_string(),
            &["DATAPILOT_AGENT_HISTORY_WINDOW"],
        ),
        field("agent.sql_dialect", config.agent.sql_dialect.clone(), &["DATAPILOT_AGENT_SQL_DIALECT"]),
        field("agent.query_tool", config.agent.query_tool.clone(), &["DATAPILOT_AGENT_QUERY_TOOL"]),
        field(
            "agent.query_argument",
            config.agent.query_argument.clone(),
            &["DATAPILOT_AGENT_QUERY_ARGUMENT"],
        ),
        field(
            "mcp.servers",
            describe_backends(config),
            &["DATAPILOT_MCP_SERVERS", "MCP_SERVERS_CONFIG", "SIDECAR_URL"],
        ),
        field(
            "mcp.reconnect_backoff_ms",
            config.mcp.reconnect_backoff_ms.to_string(),
            &["DATAPILOT_MCP_RECONNECT_BACKOFF_MS"],
        ),
        field(
            "mcp.close_timeout_secs",
            config.mcp.close_timeout_secs.to_string(),
            &["DATAPILOT_MCP_CLOSE_TIMEOUT_SECS"],
        ),
        field(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["DATAPILOT_SERVER_BIND_ADDRESS"],
        ),
        field("server.port", config.server.port.to_string(), &["DATAPILOT_SERVER_PORT"]),
        field(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["DATAPILOT_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        field(
            "logging.level",
            config.logging.level.clone(),
            &["DATAPILOT_LOGGING_LEVEL", "DATAPILOT_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["DATAPILOT_LOGGING_FORMAT", "DATAPILOT_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        fields
            .into_iter()
            .map(|field| render_line(field.key, &field.value, field_source(field.key, field.env_keys, file))),
    );
    lines.join("\n")
}

/// Backend env maps may carry credentials, so only their keys are shown.
fn describe_backends(config: &AppConfig) -> String {
    if config.mcp.servers.is_empty() {
        return "<none>".to_string();
    }

    config
        .mcp
        .servers
        .iter()
        .map(|backend| match &backend.transport {
            BackendTransport::Stdio { command, args, env } => {
                let env_keys: Vec<&str> = env.keys().map(String::as_str).collect();
                format!(
                    "{}[stdio: {} {}; env: {}]",
                    backend.name,
                    command,
                    args.join(" "),
                    if env_keys.is_empty() { "-".to_string() } else { env_keys.join(",") }
                )
            }
            BackendTransport::StreamableHttp { url } | BackendTransport::Sse { url } => {
                format!("{}[{}: {url}]", backend.name, backend.transport_label())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("datapilot.toml"), PathBuf::from("config/datapilot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file(path: &Path) -> Option<ConfigFile> {
    let raw = fs::read_to_string(path).ok()?;
    let doc = raw.parse::<Value>().ok()?;
    Some(ConfigFile { path: path.to_path_buf(), doc })
}

fn field_source(key_path: &str, env_keys: &[&str], file: Option<&ConfigFile>) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(file) = file {
        if contains_path(&file.doc, key_path) {
            return format!("file ({})", file.path.display());
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
