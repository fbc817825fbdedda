use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a data assistant. Answer questions about the \
connected databases and services. Use the available tools to look data up instead of guessing, \
and explain results briefly in the language the user writes in.";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub mcp: McpConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Reasoning and tool round trips allowed within one turn.
    pub max_steps: u32,
    pub tool_timeout_secs: u64,
    /// Messages the intent classifier looks at.
    pub history_window: usize,
    pub sql_dialect: String,
    /// Name of the tool whose calls carry SQL and pass through the safety gate.
    pub query_tool: String,
    pub query_argument: String,
    pub system_prompt: String,
}

#[derive(Clone, Debug)]
pub struct McpConfig {
    pub servers: Vec<BackendConfig>,
    pub reconnect_backoff_ms: u64,
    pub close_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    pub name: String,
    pub transport: BackendTransport,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum BackendTransport {
    Stdio { command: String, args: Vec<String>, env: BTreeMap<String, String> },
    StreamableHttp { url: String },
    /// Legacy HTTP+SSE: `GET` on the url opens the event stream, requests are
    /// posted to the endpoint the server announces.
    Sse { url: String },
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "deepseek")]
    DeepSeek,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub max_steps: Option<u32>,
    pub sql_dialect: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("`{key}` is not a valid backend map: {source}")]
    InvalidServersJson { key: String, source: serde_json::Error },
    #[error("backend `{name}` is misconfigured: {reason}")]
    InvalidBackend { name: String, reason: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://datapilot.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some(LlmProvider::Ollama.default_base_url().to_string()),
                model: "llama3.1".to_string(),
                temperature: 0.0,
                timeout_secs: 60,
                max_retries: 2,
            },
            agent: AgentConfig {
                max_steps: 25,
                tool_timeout_secs: 60,
                history_window: 3,
                sql_dialect: "mysql".to_string(),
                query_tool: "query".to_string(),
                query_argument: "sql".to_string(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            },
            mcp: McpConfig { servers: Vec::new(), reconnect_backoff_ms: 500, close_timeout_secs: 5 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8000,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
            Self::Ollama => "ollama",
        }
    }

    /// Chat-completions root used when `llm.base_url` is not set.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "deepseek" => Ok(Self::DeepSeek),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|deepseek|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LlmConfig {
    pub fn resolved_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

impl BackendConfig {
    pub fn transport_label(&self) -> &'static str {
        match self.transport {
            BackendTransport::Stdio { .. } => "stdio",
            BackendTransport::StreamableHttp { .. } => "streamable_http",
            BackendTransport::Sse { .. } => "sse",
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            BackendTransport::Stdio { .. } => None,
            BackendTransport::StreamableHttp { url } | BackendTransport::Sse { url } => Some(url),
        }
    }

    /// Single legacy SSE backend named `default`, derived from a sidecar root.
    pub fn from_sidecar_url(sidecar_url: &str) -> Self {
        Self {
            name: "default".to_string(),
            transport: BackendTransport::Sse {
                url: format!("{}/sse", sidecar_url.trim_end_matches('/')),
            },
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("datapilot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
                if llm.base_url.is_none() {
                    self.llm.base_url = None;
                }
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_steps) = agent.max_steps {
                self.agent.max_steps = max_steps;
            }
            if let Some(tool_timeout_secs) = agent.tool_timeout_secs {
                self.agent.tool_timeout_secs = tool_timeout_secs;
            }
            if let Some(history_window) = agent.history_window {
                self.agent.history_window = history_window;
            }
            if let Some(sql_dialect) = agent.sql_dialect {
                self.agent.sql_dialect = sql_dialect;
            }
            if let Some(query_tool) = agent.query_tool {
                self.agent.query_tool = query_tool;
            }
            if let Some(query_argument) = agent.query_argument {
                self.agent.query_argument = query_argument;
            }
            if let Some(system_prompt) = agent.system_prompt {
                self.agent.system_prompt = system_prompt;
            }
        }

        if let Some(mcp) = patch.mcp {
            if let Some(servers) = mcp.servers {
                self.mcp.servers = backends_from_map(servers)?;
            }
            if let Some(reconnect_backoff_ms) = mcp.reconnect_backoff_ms {
                self.mcp.reconnect_backoff_ms = reconnect_backoff_ms;
            }
            if let Some(close_timeout_secs) = mcp.close_timeout_secs {
                self.mcp.close_timeout_secs = close_timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DATAPILOT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DATAPILOT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("DATAPILOT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DATAPILOT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DATAPILOT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
            if read_env("DATAPILOT_LLM_BASE_URL").is_none() {
                self.llm.base_url = None;
            }
        }
        if let Some(value) = read_env("DATAPILOT_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DATAPILOT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("DATAPILOT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("DATAPILOT_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("DATAPILOT_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("DATAPILOT_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("DATAPILOT_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("DATAPILOT_AGENT_MAX_STEPS") {
            self.agent.max_steps = parse_u32("DATAPILOT_AGENT_MAX_STEPS", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_AGENT_TOOL_TIMEOUT_SECS") {
            self.agent.tool_timeout_secs =
                parse_u64("DATAPILOT_AGENT_TOOL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_AGENT_HISTORY_WINDOW") {
            self.agent.history_window = parse_usize("DATAPILOT_AGENT_HISTORY_WINDOW", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_AGENT_SQL_DIALECT") {
            self.agent.sql_dialect = value;
        }
        if let Some(value) = read_env("DATAPILOT_AGENT_QUERY_TOOL") {
            self.agent.query_tool = value;
        }
        if let Some(value) = read_env("DATAPILOT_AGENT_QUERY_ARGUMENT") {
            self.agent.query_argument = value;
        }
        if let Some(value) = read_env("DATAPILOT_AGENT_SYSTEM_PROMPT") {
            self.agent.system_prompt = value;
        }

        let servers_json = read_env("DATAPILOT_MCP_SERVERS")
            .map(|value| ("DATAPILOT_MCP_SERVERS", value))
            .or_else(|| read_env("MCP_SERVERS_CONFIG").map(|value| ("MCP_SERVERS_CONFIG", value)));
        if let Some((key, value)) = servers_json {
            let raw: BTreeMap<String, RawBackendConfig> = serde_json::from_str(&value)
                .map_err(|source| ConfigError::InvalidServersJson { key: key.to_string(), source })?;
            self.mcp.servers = backends_from_map(raw)?;
        } else if self.mcp.servers.is_empty() {
            if let Some(sidecar_url) = read_env("SIDECAR_URL") {
                self.mcp.servers = vec![BackendConfig::from_sidecar_url(&sidecar_url)];
            }
        }
        if let Some(value) = read_env("DATAPILOT_MCP_RECONNECT_BACKOFF_MS") {
            self.mcp.reconnect_backoff_ms =
                parse_u64("DATAPILOT_MCP_RECONNECT_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_MCP_CLOSE_TIMEOUT_SECS") {
            self.mcp.close_timeout_secs = parse_u64("DATAPILOT_MCP_CLOSE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DATAPILOT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DATAPILOT_SERVER_PORT") {
            self.server.port = parse_u16("DATAPILOT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DATAPILOT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DATAPILOT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("DATAPILOT_LOGGING_LEVEL").or_else(|| read_env("DATAPILOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DATAPILOT_LOGGING_FORMAT").or_else(|| read_env("DATAPILOT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(max_steps) = overrides.max_steps {
            self.agent.max_steps = max_steps;
        }
        if let Some(sql_dialect) = overrides.sql_dialect {
            self.agent.sql_dialect = sql_dialect;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_agent(&self.agent)?;
        validate_mcp(&self.mcp)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("datapilot.toml"), PathBuf::from("config/datapilot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

/// Converts the `{name: {transport, command, args, env, url}}` shape into typed backends.
/// `http` and `streamable_http` select the streamable HTTP client, `sse` the legacy SSE one.
pub fn backends_from_map(
    raw: BTreeMap<String, RawBackendConfig>,
) -> Result<Vec<BackendConfig>, ConfigError> {
    raw.into_iter()
        .map(|(name, entry)| {
            let transport = entry.transport.as_deref().unwrap_or("stdio").trim().to_ascii_lowercase();
            let transport = match transport.as_str() {
                "stdio" => {
                    let command = entry.command.filter(|value| !value.trim().is_empty()).ok_or_else(
                        || ConfigError::InvalidBackend {
                            name: name.clone(),
                            reason: "stdio transport requires `command`".to_string(),
                        },
                    )?;
                    BackendTransport::Stdio {
                        command,
                        args: entry.args.unwrap_or_default(),
                        env: entry.env.unwrap_or_default(),
                    }
                }
                "sse" | "http" | "streamable_http" | "streamable-http" => {
                    let url = entry.url.filter(|value| !value.trim().is_empty()).ok_or_else(|| {
                        ConfigError::InvalidBackend {
                            name: name.clone(),
                            reason: format!("{transport} transport requires `url`"),
                        }
                    })?;
                    if transport == "sse" {
                        BackendTransport::Sse { url }
                    } else {
                        BackendTransport::StreamableHttp { url }
                    }
                }
                other => {
                    return Err(ConfigError::InvalidBackend {
                        name: name.clone(),
                        reason: format!("unsupported transport `{other}` (expected stdio|http|sse)"),
                    })
                }
            };
            Ok(BackendConfig { name, transport })
        })
        .collect()
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.provider.requires_api_key() {
        let missing = llm
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "llm.api_key is required for openai/deepseek providers".to_string(),
            ));
        }
    }

    let base_url = llm.resolved_base_url();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_steps == 0 {
        return Err(ConfigError::Validation(
            "agent.max_steps must be greater than zero".to_string(),
        ));
    }

    if agent.tool_timeout_secs == 0 || agent.tool_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "agent.tool_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if agent.history_window == 0 {
        return Err(ConfigError::Validation(
            "agent.history_window must be greater than zero".to_string(),
        ));
    }

    if agent.sql_dialect.trim().is_empty() {
        return Err(ConfigError::Validation("agent.sql_dialect must not be empty".to_string()));
    }

    if agent.query_tool.trim().is_empty() || agent.query_argument.trim().is_empty() {
        return Err(ConfigError::Validation(
            "agent.query_tool and agent.query_argument must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_mcp(mcp: &McpConfig) -> Result<(), ConfigError> {
    for backend in &mcp.servers {
        if backend.name.trim().is_empty() {
            return Err(ConfigError::Validation("mcp backend names must not be empty".to_string()));
        }
        if let Some(url) = backend.url() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "mcp.servers.{}.url must start with http:// or https://",
                    backend.name
                )));
            }
        }
    }

    if mcp.reconnect_backoff_ms > 10_000 {
        return Err(ConfigError::Validation(
            "mcp.reconnect_backoff_ms must be at most 10000".to_string(),
        ));
    }

    if mcp.close_timeout_secs == 0 || mcp.close_timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "mcp.close_timeout_secs must be in range 1..=60".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    agent: Option<AgentPatch>,
    mcp: Option<McpPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_steps: Option<u32>,
    tool_timeout_secs: Option<u64>,
    history_window: Option<usize>,
    sql_dialect: Option<String>,
    query_tool: Option<String>,
    query_argument: Option<String>,
    system_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct McpPatch {
    servers: Option<BTreeMap<String, RawBackendConfig>>,
    reconnect_backoff_ms: Option<u64>,
    close_timeout_secs: Option<u64>,
}

/// Loosely typed backend entry, shared by the TOML file and the JSON environment form.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawBackendConfig {
    pub transport: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, BackendTransport, ConfigError, ConfigOverrides, LlmProvider, LoadOptions,
        LogFormat,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_without_any_file_or_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.agent.max_steps == 25, "default step budget should be 25")?;
        ensure(config.agent.sql_dialect == "mysql", "default dialect should be mysql")?;
        ensure(config.mcp.reconnect_backoff_ms == 500, "default backoff should be 500ms")?;
        ensure(
            config.llm.resolved_base_url() == "http://localhost:11434/v1",
            "ollama should resolve to its local endpoint",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_DATAPILOT_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("datapilot.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "deepseek"
api_key = "${TEST_DATAPILOT_LLM_KEY}"
model = "deepseek-chat"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config
                    .llm
                    .api_key
                    .as_ref()
                    .map(|key| key.expose_secret() == "sk-from-env")
                    .unwrap_or(false),
                "api key should be loaded from environment",
            )?;
            ensure(config.llm.provider == LlmProvider::DeepSeek, "provider should be deepseek")?;
            ensure(
                config.llm.resolved_base_url() == "https://api.deepseek.com/v1",
                "switching provider without base_url should use that provider's endpoint",
            )
        })();

        clear_vars(&["TEST_DATAPILOT_LLM_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAPILOT_LOG_LEVEL", "warn");
        env::set_var("DATAPILOT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["DATAPILOT_LOG_LEVEL", "DATAPILOT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAPILOT_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("DATAPILOT_AGENT_MAX_STEPS", "12");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("datapilot.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[agent]
max_steps = 40
sql_dialect = "postgres"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.agent.max_steps == 12, "env step budget should win over file")?;
            ensure(config.agent.sql_dialect == "postgres", "file dialect should win over default")
        })();

        clear_vars(&["DATAPILOT_DATABASE_URL", "DATAPILOT_AGENT_MAX_STEPS"]);
        result
    }

    #[test]
    fn file_servers_are_parsed_into_typed_backends() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("datapilot.toml");
        fs::write(
            &path,
            r#"
[mcp.servers.warehouse]
transport = "stdio"
command = "mcp-mysql"
args = ["--read-only"]
env = { MYSQL_HOST = "db" }

[mcp.servers.billing]
transport = "sse"
url = "http://billing:3000/sse"
"#,
        )
        .map_err(|err| err.to_string())?;

        let config =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.mcp.servers.len() == 2, "both backends should be loaded")?;
        let billing = config
            .mcp
            .servers
            .iter()
            .find(|backend| backend.name == "billing")
            .ok_or_else(|| "billing backend missing".to_string())?;
        ensure(
            matches!(&billing.transport, BackendTransport::Sse { url } if url == "http://billing:3000/sse"),
            "sse backends should use the legacy sse transport",
        )?;
        ensure(billing.transport_label() == "sse", "sse backends report the sse label")?;
        let warehouse = config
            .mcp
            .servers
            .iter()
            .find(|backend| backend.name == "warehouse")
            .ok_or_else(|| "warehouse backend missing".to_string())?;
        ensure(
            matches!(
                &warehouse.transport,
                BackendTransport::Stdio { command, args, env }
                    if command == "mcp-mysql"
                        && args == &vec!["--read-only".to_string()]
                        && env.get("MYSQL_HOST").map(String::as_str) == Some("db")
            ),
            "stdio backend should keep command, args and env",
        )
    }

    #[test]
    fn servers_json_env_wins_and_legacy_sidecar_is_a_fallback() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SIDECAR_URL", "http://mcp-mysql:3000/");

        let result = (|| -> Result<(), String> {
            let legacy = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(legacy.mcp.servers.len() == 1, "sidecar url should produce one backend")?;
            ensure(legacy.mcp.servers[0].name == "default", "legacy backend is named default")?;
            ensure(
                matches!(&legacy.mcp.servers[0].transport,
                    BackendTransport::Sse { url } if url == "http://mcp-mysql:3000/sse"),
                "legacy backend should open the sse stream at <sidecar>/sse",
            )?;

            env::set_var(
                "MCP_SERVERS_CONFIG",
                r#"{"crm": {"transport": "http", "url": "https://crm.internal/mcp"}}"#,
            );
            let configured = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                configured.mcp.servers.len() == 1 && configured.mcp.servers[0].name == "crm",
                "explicit server map should take priority over the sidecar url",
            )
        })();

        clear_vars(&["SIDECAR_URL", "MCP_SERVERS_CONFIG"]);
        result
    }

    #[test]
    fn malformed_backend_entries_are_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAPILOT_MCP_SERVERS", r#"{"broken": {"transport": "stdio"}}"#);
        let missing_command = AppConfig::load(LoadOptions::default());
        env::set_var("DATAPILOT_MCP_SERVERS", "not json");
        let bad_json = AppConfig::load(LoadOptions::default());
        clear_vars(&["DATAPILOT_MCP_SERVERS"]);

        ensure(
            matches!(missing_command, Err(ConfigError::InvalidBackend { ref name, .. }) if name == "broken"),
            "stdio backend without a command should be rejected",
        )?;
        ensure(
            matches!(bad_json, Err(ConfigError::InvalidServersJson { ref key, .. }) if key == "DATAPILOT_MCP_SERVERS"),
            "unparseable server map should name the variable",
        )
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAPILOT_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["DATAPILOT_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAPILOT_LLM_PROVIDER", "openai");
        env::set_var("DATAPILOT_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["DATAPILOT_LLM_PROVIDER", "DATAPILOT_LLM_API_KEY"]);
        result
    }
}
