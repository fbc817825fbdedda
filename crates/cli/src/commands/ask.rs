use std::sync::Arc;

use datapilot_agent::{AgentRuntime, BroadcastProgressSink, OpenAiCompatibleClient, RuntimeDeps};
use datapilot_core::config::{AppConfig, LoadOptions};
use datapilot_core::{ProgressKind, ToolProvider};
use datapilot_db::{connect_with_config, migrations, SqlCheckpointStore};
use datapilot_mcp::McpToolProvider;
use tokio::sync::broadcast::error::RecvError;

use crate::commands::{async_runtime, CommandResult};

type Failure = (&'static str, String, u8);

/// Runs one turn against the configured stack. Progress goes to stderr so
/// stdout stays a single JSON line.
pub fn run(thread_id: &str, text: &str) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match async_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    match runtime.block_on(ask(config, thread_id, text)) {
        Ok(answer) => CommandResult::success("ask", answer),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("ask", error_class, message, exit_code)
        }
    }
}

async fn ask(config: AppConfig, thread_id: &str, text: &str) -> Result<String, Failure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5))?;

    let tools = Arc::new(
        McpToolProvider::from_config(&config.mcp)
            .map_err(|error| ("runtime_init", error.to_string(), 6))?,
    );
    let llm = Arc::new(
        OpenAiCompatibleClient::from_config(&config.llm)
            .map_err(|error| ("runtime_init", error.to_string(), 6))?,
    );
    let progress = BroadcastProgressSink::new(64);
    let printer = tokio::spawn(print_progress(progress.subscribe()));

    let agent = AgentRuntime::new(
        &config.agent,
        RuntimeDeps {
            llm,
            tools: tools.clone(),
            checkpoints: Arc::new(SqlCheckpointStore::new(pool.clone())),
            progress: Arc::new(progress),
        },
    )
    .await
    .map_err(|error| ("runtime_init", error.to_string(), 6))?;

    let outcome = agent.run_turn(thread_id, text).await;

    // Dropping every sender lets the printer drain and stop.
    drop(agent);
    let _ = printer.await;
    tools.close().await;
    pool.close().await;

    outcome.map_err(|error| ("turn", error.to_string(), 7))
}

async fn print_progress(mut events: tokio::sync::broadcast::Receiver<datapilot_core::ProgressEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = describe(&event.kind) {
                    eprintln!("[{}] {line}", event.sequence);
                }
            }
            Err(RecvError::Lagged(skipped)) => eprintln!("... {skipped} progress event(s) skipped"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn describe(kind: &ProgressKind) -> Option<String> {
    match kind {
        ProgressKind::TurnStarted => Some("turn started".to_string()),
        ProgressKind::NodeEntered { node } => Some(format!("step: {node}")),
        ProgressKind::ToolStarted { call_id, name } => Some(format!("tool {name} started ({call_id})")),
        ProgressKind::ToolEnded { name, ok, .. } => {
            Some(format!("tool {name} {}", if *ok { "finished" } else { "failed" }))
        }
        // The answer itself is printed on stdout.
        ProgressKind::Token { .. } => None,
        ProgressKind::TurnCompleted { steps } => Some(format!("turn completed in {steps} step(s)")),
    }
}

#[cfg(test)]
mod tests {
    use datapilot_core::ProgressKind;

    use super::describe;

    #[test]
    fn progress_lines_name_nodes_and_tools() {
        assert_eq!(
            describe(&ProgressKind::NodeEntered { node: "reason".to_string() }).as_deref(),
            Some("step: reason")
        );
        assert_eq!(
            describe(&ProgressKind::ToolEnded {
                call_id: "c1".to_string(),
                name: "query".to_string(),
                ok: false,
            })
            .as_deref(),
            Some("tool query failed")
        );
        assert_eq!(describe(&ProgressKind::Token { text: "42".to_string() }), None);
    }
}
