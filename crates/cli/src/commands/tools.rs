use datapilot_core::config::{AppConfig, LoadOptions};
use datapilot_core::ToolProvider;
use datapilot_mcp::{BackendStatus, McpToolProvider};
use serde::Serialize;

use crate::commands::{async_runtime, CommandResult};

#[derive(Debug, Serialize)]
struct ToolLine {
    name: String,
    backend: String,
    description: String,
    required: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ToolsReport {
    command: &'static str,
    status: &'static str,
    backends: Vec<BackendStatus>,
    tools: Vec<ToolLine>,
}

/// Connects to every configured backend and prints the merged catalog.
pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "tools",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let provider = match McpToolProvider::from_config(&config.mcp) {
        Ok(provider) => provider,
        Err(error) => return CommandResult::failure("tools", "config_validation", error.to_string(), 2),
    };

    let runtime = match async_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "tools",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    runtime.block_on(async {
        let discovered = provider.tools().await;
        let backends = provider.backend_status().await;
        provider.close().await;

        match discovered {
            Ok(tools) => {
                let tools = tools
                    .iter()
                    .map(|tool| ToolLine {
                        name: tool.name.clone(),
                        backend: tool.backend.clone(),
                        description: tool.description.clone(),
                        required: tool
                            .parameters
                            .iter()
                            .filter(|parameter| parameter.required)
                            .map(|parameter| parameter.name.clone())
                            .collect(),
                    })
                    .collect();
                CommandResult::report(0, &ToolsReport { command: "tools", status: "ok", backends, tools })
            }
            Err(error) => CommandResult::failure("tools", "tool_discovery", error.to_string(), 4),
        }
    })
}
