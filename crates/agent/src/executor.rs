use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use datapilot_core::{Message, ProgressKind, ProgressReporter, ToolCall, ToolError, ToolProvider};

use crate::guardrails::SqlGuard;
use crate::tools::ToolBindings;

#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    pub query_tool: String,
    pub query_argument: String,
    pub call_timeout: Duration,
}

#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// One tool result per call, in the order the calls were requested.
    pub results: Vec<Message>,
    /// Calls that failed because a backend could not be reached.
    pub connection_failures: usize,
}

/// A call that survived validation and is ready for dispatch.
enum Prepared {
    Dispatch { arguments: Map<String, Value> },
    Answered { text: String },
}

/// Executes the tool calls of one assistant message: query calls pass the SQL
/// gate first, then every call is dispatched concurrently under its own timeout.
pub struct ToolExecutor {
    provider: Arc<dyn ToolProvider>,
    guard: SqlGuard,
    settings: ExecutorSettings,
}

impl ToolExecutor {
    pub fn new(provider: Arc<dyn ToolProvider>, guard: SqlGuard, settings: ExecutorSettings) -> Self {
        Self { provider, guard, settings }
    }

    pub async fn execute(
        &self,
        calls: &[ToolCall],
        bindings: &ToolBindings,
        progress: &ProgressReporter,
    ) -> ExecutionOutcome {
        let tasks = calls.iter().map(|call| {
            let prepared = self.prepare(call, bindings);
            let provider = Arc::clone(&self.provider);
            let progress = progress.clone();
            let timeout = self.settings.call_timeout;
            let call = call.clone();

            tokio::spawn(async move {
                progress.report(ProgressKind::ToolStarted {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                });
                let outcome = match prepared {
                    Prepared::Answered { text } => Ok(text),
                    Prepared::Dispatch { arguments } => {
                        match tokio::time::timeout(timeout, provider.call(&call.name, arguments)).await {
                            Ok(result) => result,
                            Err(_) => Err(ToolError::Timeout {
                                name: call.name.clone(),
                                secs: timeout.as_secs(),
                            }),
                        }
                    }
                };
                progress.report(ProgressKind::ToolEnded {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    ok: outcome.is_ok(),
                });
                outcome
            })
        });

        let joined = join_all(tasks).await;

        let mut outcome = ExecutionOutcome::default();
        for (call, joined) in calls.iter().zip(joined) {
            let text = match joined {
                Ok(Ok(text)) => {
                    debug!(event_name = "agent.tool.completed", tool = %call.name, call_id = %call.id, "tool call completed");
                    text
                }
                Ok(Err(error)) => {
                    if error.is_connection() {
                        outcome.connection_failures += 1;
                    }
                    warn!(
                        event_name = "agent.tool.failed",
                        tool = %call.name,
                        call_id = %call.id,
                        error = %error,
                        "tool call failed"
                    );
                    format!("Error: {error}")
                }
                Err(join_error) => {
                    warn!(
                        event_name = "agent.tool.aborted",
                        tool = %call.name,
                        call_id = %call.id,
                        error = %join_error,
                        "tool task did not complete"
                    );
                    format!("Error: tool task for {} did not complete: {join_error}", call.name)
                }
            };
            outcome.results.push(Message::tool_result(call.id.clone(), call.name.clone(), text));
        }
        outcome
    }

    fn prepare(&self, call: &ToolCall, bindings: &ToolBindings) -> Prepared {
        let mut arguments = call.arguments.clone();

        if call.name == self.settings.query_tool {
            let raw = arguments
                .get(&self.settings.query_argument)
                .and_then(Value::as_str)
                .unwrap_or_default();
            let validation = self.guard.validate(raw);
            match validation.normalized_query.clone() {
                Some(normalized) if validation.is_safe => {
                    arguments.insert(self.settings.query_argument.clone(), Value::String(normalized));
                }
                _ => {
                    warn!(
                        event_name = "agent.tool.rejected",
                        tool = %call.name,
                        call_id = %call.id,
                        reason = validation.error.as_deref().unwrap_or_default(),
                        "query blocked by sql safety gate"
                    );
                    return Prepared::Answered { text: validation.violation_message() };
                }
            }
        }

        // Unknown tools go to the provider as-is so it can report them.
        let Some(descriptor) = bindings.descriptor(&call.name) else {
            return Prepared::Dispatch { arguments };
        };
        match descriptor.prepare_arguments(arguments) {
            Ok(arguments) => Prepared::Dispatch { arguments },
            Err(reason) => Prepared::Answered {
                text: format!(
                    "Error: {}",
                    ToolError::InvalidArguments { name: call.name.clone(), reason }
                ),
            },
        }
    }
}
