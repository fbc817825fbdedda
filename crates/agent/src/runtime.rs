use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use datapilot_core::config::AgentConfig;
use datapilot_core::{
    ApplicationError, CheckpointStore, ConversationState, DomainError, Intent, Message,
    ProgressKind, ProgressReporter, ProgressSink, ThreadId, ToolProvider,
};

use crate::classifier::IntentClassifier;
use crate::conversation::prepare_history;
use crate::executor::{ExecutorSettings, ToolExecutor};
use crate::guardrails::{GuardError, SqlGuard};
use crate::llm::{LlmClient, LlmError, LlmReply};
use crate::markup::MarkupDecoder;
use crate::tools::ToolBindings;

pub const APOLOGY: &str =
    "Sorry, I could not reach the language model to answer that. Please try again in a moment.";

/// Graph nodes of one turn. `Finish` is terminal and does not consume budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    Classify,
    Reason,
    ExecuteTools,
    Finish,
}

impl Node {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Reason => "reason",
            Self::ExecuteTools => "execute_tools",
            Self::Finish => "finish",
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeBuildError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("tool markup decoder could not be compiled: {0}")]
    Markup(#[from] regex::Error),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("turn stopped after exhausting its budget of {max_steps} steps")]
    StepBudgetExhausted { max_steps: u32 },
}

impl From<TurnError> for ApplicationError {
    fn from(value: TurnError) -> Self {
        match value {
            TurnError::Domain(error) => Self::Domain(error),
            TurnError::StepBudgetExhausted { max_steps } => Self::StepBudgetExhausted { max_steps },
        }
    }
}

/// Ports the runtime drives. All of them are shared handles so one runtime can
/// serve every thread of the process.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolProvider>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub progress: Arc<dyn ProgressSink>,
}

/// Orchestrates turns: classify, then alternate reasoning and tool execution
/// until the model answers without tool calls or the step budget runs out.
pub struct AgentRuntime {
    max_steps: u32,
    system_prompt: String,
    query_tool: String,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolProvider>,
    checkpoints: Arc<dyn CheckpointStore>,
    progress: Arc<dyn ProgressSink>,
    classifier: IntentClassifier,
    executor: ToolExecutor,
    markup: MarkupDecoder,
    bindings: RwLock<Arc<ToolBindings>>,
    bindings_stale: AtomicBool,
    thread_locks: Mutex<HashMap<ThreadId, Arc<Mutex<()>>>>,
}

impl AgentRuntime {
    /// Builds the runtime and binds tools from the provider's current catalog.
    /// An unreachable catalog leaves every intent without tools until the next refresh.
    pub async fn new(config: &AgentConfig, deps: RuntimeDeps) -> Result<Self, RuntimeBuildError> {
        let guard = SqlGuard::new(&config.sql_dialect)?;
        let executor = ToolExecutor::new(
            Arc::clone(&deps.tools),
            guard,
            ExecutorSettings {
                query_tool: config.query_tool.clone(),
                query_argument: config.query_argument.clone(),
                call_timeout: Duration::from_secs(config.tool_timeout_secs),
            },
        );

        let runtime = Self {
            max_steps: config.max_steps,
            system_prompt: config.system_prompt.clone(),
            query_tool: config.query_tool.clone(),
            classifier: IntentClassifier::new(Arc::clone(&deps.llm), config.history_window),
            markup: MarkupDecoder::new()?,
            llm: deps.llm,
            tools: deps.tools,
            checkpoints: deps.checkpoints,
            progress: deps.progress,
            executor,
            bindings: RwLock::new(Arc::new(ToolBindings::default())),
            bindings_stale: AtomicBool::new(false),
            thread_locks: Mutex::new(HashMap::new()),
        };
        runtime.rebind_tools().await;
        Ok(runtime)
    }

    /// Drops the provider's cached catalog and rebuilds the per-intent bindings.
    pub async fn refresh_tools(&self) -> usize {
        self.tools.invalidate().await;
        self.rebind_tools().await
    }

    pub async fn bound_tool_count(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Runs one user turn for `thread_id` and returns the final assistant text.
    /// Turns for the same thread run one at a time.
    pub async fn run_turn(&self, thread_id: &str, user_text: &str) -> Result<String, TurnError> {
        let thread_id = ThreadId::parse(thread_id)?;
        if user_text.trim().is_empty() {
            return Err(DomainError::EmptyMessage.into());
        }

        let lock = self.thread_lock(&thread_id).await;
        let result = {
            let _turn = lock.lock().await;
            self.run_locked_turn(&thread_id, user_text).await
        };
        drop(lock);
        self.release_thread_lock(&thread_id).await;
        result
    }

    async fn run_locked_turn(&self, thread_id: &ThreadId, user_text: &str) -> Result<String, TurnError> {
        let reporter = ProgressReporter::new(thread_id.clone(), Arc::clone(&self.progress));
        reporter.report(ProgressKind::TurnStarted);
        info!(event_name = "agent.turn.started", thread_id = %thread_id, "turn started");

        if self.bindings_stale.swap(false, Ordering::SeqCst) {
            self.refresh_tools().await;
        }
        let bindings = Arc::clone(&*self.bindings.read().await);

        let mut state = self.load_state(thread_id).await;
        state.push(Message::user(user_text));

        let outcome = self.drive(&mut state, &bindings, &reporter).await;
        self.save_state(thread_id, &state).await;

        match outcome {
            Ok((answer, steps)) => {
                reporter.report(ProgressKind::TurnCompleted { steps });
                info!(
                    event_name = "agent.turn.completed",
                    thread_id = %thread_id,
                    intent = state.intent.as_str(),
                    steps,
                    "turn completed"
                );
                Ok(answer)
            }
            Err(error) => {
                warn!(event_name = "agent.turn.failed", thread_id = %thread_id, error = %error, "turn failed");
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut ConversationState,
        bindings: &ToolBindings,
        reporter: &ProgressReporter,
    ) -> Result<(String, u32), TurnError> {
        let mut node = Node::Classify;
        let mut steps = 0u32;

        loop {
            if node == Node::Finish {
                return Ok((final_answer(state), steps));
            }
            if steps >= self.max_steps {
                return Err(TurnError::StepBudgetExhausted { max_steps: self.max_steps });
            }
            steps += 1;
            reporter.report(ProgressKind::NodeEntered { node: node.as_str().to_string() });
            debug!(event_name = "agent.node.entered", node = node.as_str(), step = steps, "node entered");

            node = match node {
                Node::Classify => {
                    state.intent = self.classifier.classify(state).await;
                    Node::Reason
                }
                Node::Reason => match self.reason(state, bindings, reporter).await {
                    Ok(message) => {
                        let next = if message.has_tool_calls() { Node::ExecuteTools } else { Node::Finish };
                        state.push(message);
                        next
                    }
                    Err(error) => {
                        warn!(event_name = "agent.llm.failed", error = %error, "model call failed, answering with apology");
                        reporter.report(ProgressKind::Token { text: APOLOGY.to_string() });
                        state.push(Message::assistant(APOLOGY));
                        Node::Finish
                    }
                },
                Node::ExecuteTools => {
                    let calls = state.pending_tool_calls().to_vec();
                    let outcome = self.executor.execute(&calls, bindings, reporter).await;
                    if outcome.connection_failures > 0 {
                        self.bindings_stale.store(true, Ordering::SeqCst);
                    }
                    for result in outcome.results {
                        state.push(result);
                    }
                    Node::Reason
                }
                Node::Finish => Node::Finish,
            };
        }
    }

    async fn reason(
        &self,
        state: &mut ConversationState,
        bindings: &ToolBindings,
        reporter: &ProgressReporter,
    ) -> Result<Message, LlmError> {
        state.set_system_instruction(self.system_instruction(state.intent));
        let history = prepare_history(&state.messages);
        let on_token = |text: &str| reporter.report(ProgressKind::Token { text: text.to_string() });
        let reply = self.llm.complete_streaming(&history, bindings.for_intent(state.intent), &on_token).await?;
        Ok(self.assistant_message(reply))
    }

    fn assistant_message(&self, reply: LlmReply) -> Message {
        if reply.tool_calls.is_empty() {
            if let Some(decoded) = self.markup.decode(&reply.content) {
                info!(
                    event_name = "agent.markup.recovered",
                    calls = decoded.tool_calls.len(),
                    "recovered tool calls from inline markup"
                );
                return Message::assistant_with_calls(decoded.visible_text, decoded.tool_calls);
            }
        }
        Message::assistant_with_calls(reply.content, reply.tool_calls)
    }

    fn system_instruction(&self, intent: Intent) -> String {
        match intent {
            Intent::Database => format!(
                "{}\n\nIMPORTANT: to answer questions about data you MUST call the '{}' tool. \
                 Do not answer from memory when the answer needs the database.",
                self.system_prompt, self.query_tool
            ),
            Intent::Api | Intent::General => self.system_prompt.clone(),
        }
    }

    async fn rebind_tools(&self) -> usize {
        let bindings = match self.tools.tools().await {
            Ok(catalog) => ToolBindings::build(&catalog, &self.query_tool),
            Err(error) => {
                warn!(event_name = "agent.tools.unavailable", error = %error, "tool catalog unavailable");
                self.bindings_stale.store(true, Ordering::SeqCst);
                ToolBindings::default()
            }
        };
        let count = bindings.len();
        *self.bindings.write().await = Arc::new(bindings);
        info!(event_name = "agent.tools.bound", tools = count, "tool bindings rebuilt");
        count
    }

    async fn load_state(&self, thread_id: &ThreadId) -> ConversationState {
        match self.checkpoints.load(thread_id).await {
            Ok(Some(state)) => state,
            Ok(None) => ConversationState::new(),
            Err(error) => {
                warn!(
                    event_name = "agent.checkpoint.load_failed",
                    thread_id = %thread_id,
                    error = %error,
                    "checkpoint load failed, starting from an empty conversation"
                );
                ConversationState::new()
            }
        }
    }

    async fn save_state(&self, thread_id: &ThreadId, state: &ConversationState) {
        if let Err(error) = self.checkpoints.save(thread_id, state).await {
            warn!(
                event_name = "agent.checkpoint.save_failed",
                thread_id = %thread_id,
                error = %error,
                "checkpoint save failed"
            );
        }
    }

    async fn thread_lock(&self, thread_id: &ThreadId) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        Arc::clone(locks.entry(thread_id.clone()).or_default())
    }

    async fn release_thread_lock(&self, thread_id: &ThreadId) {
        let mut locks = self.thread_locks.lock().await;
        if locks.get(thread_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(thread_id);
        }
    }
}

fn final_answer(state: &ConversationState) -> String {
    state.last().map(Message::text).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use tokio::sync::Mutex;

    use datapilot_core::config::{AgentConfig, AppConfig};
    use datapilot_core::{
        CheckpointError, CheckpointStore, ConversationState, DomainError, InMemoryCheckpointStore,
        InMemoryProgressSink, Intent, Message, NoopProgressSink, ProgressKind, Role, ThreadId,
        ToolCall, ToolDescriptor, ToolError, ToolProvider,
    };

    use super::{AgentRuntime, RuntimeDeps, TurnError, APOLOGY};
    use crate::guardrails::SAFETY_VIOLATION_MARKER;
    use crate::llm::{LlmClient, LlmError, LlmReply};

    /// Answers classifier prompts with `intent` and reasoning calls from a script.
    struct ScriptedLlm {
        intent: &'static str,
        replies: Mutex<VecDeque<Result<LlmReply, LlmError>>>,
        reasoning_requests: Mutex<Vec<(Vec<Message>, Vec<String>)>>,
    }

    impl ScriptedLlm {
        fn new(intent: &'static str, replies: Vec<Result<LlmReply, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                intent,
                replies: Mutex::new(replies.into()),
                reasoning_requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<LlmReply, LlmError> {
            if messages.len() == 1 && messages[0].text().starts_with("You are an intent classifier") {
                return Ok(LlmReply { content: self.intent.to_string(), tool_calls: Vec::new() });
            }
            self.reasoning_requests
                .lock()
                .await
                .push((messages.to_vec(), tools.iter().map(|tool| tool.name.clone()).collect()));
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(LlmReply { content: "done".to_string(), tool_calls: Vec::new() }))
        }
    }

    #[derive(Default)]
    struct RecordingTools {
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
        catalog_reads: AtomicUsize,
        invalidations: AtomicUsize,
        fail_connection: bool,
    }

    #[async_trait]
    impl ToolProvider for RecordingTools {
        async fn tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, ToolError> {
            self.catalog_reads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(vec![
                ToolDescriptor::from_input_schema(
                    "query",
                    Some("Run a read-only SQL query".to_string()),
                    &json!({"properties": {"sql": {"type": "string"}}, "required": ["sql"]}),
                    "warehouse",
                ),
                ToolDescriptor::from_input_schema("service_status", None, &json!({}), "ops"),
            ]))
        }

        async fn call(&self, name: &str, arguments: Map<String, Value>) -> Result<String, ToolError> {
            self.calls.lock().await.push((name.to_string(), arguments));
            if self.fail_connection {
                return Err(ToolError::Connection { backend: "warehouse".into(), message: "closed".into() });
            }
            Ok("[{\"count\": 42}]".to_string())
        }

        async fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&self) {}
    }

    struct FailingStore;

    #[async_trait]
    impl CheckpointStore for FailingStore {
        async fn load(&self, _thread_id: &ThreadId) -> Result<Option<ConversationState>, CheckpointError> {
            Err(CheckpointError::Storage("disk unavailable".to_string()))
        }

        async fn save(&self, _thread_id: &ThreadId, _state: &ConversationState) -> Result<(), CheckpointError> {
            Err(CheckpointError::Storage("disk unavailable".to_string()))
        }
    }

    fn query_call(id: &str, sql: &str) -> ToolCall {
        let mut arguments = Map::new();
        arguments.insert("sql".to_string(), json!(sql));
        ToolCall { id: id.to_string(), name: "query".to_string(), arguments }
    }

    fn text(content: &str) -> Result<LlmReply, LlmError> {
        Ok(LlmReply { content: content.to_string(), tool_calls: Vec::new() })
    }

    fn calls(calls: Vec<ToolCall>) -> Result<LlmReply, LlmError> {
        Ok(LlmReply { content: String::new(), tool_calls: calls })
    }

    fn config(max_steps: u32) -> AgentConfig {
        AgentConfig { max_steps, ..AppConfig::default().agent }
    }

    async fn build_runtime(
        llm: Arc<ScriptedLlm>,
        tools: Arc<RecordingTools>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: InMemoryProgressSink,
        max_steps: u32,
    ) -> AgentRuntime {
        AgentRuntime::new(
            &config(max_steps),
            RuntimeDeps { llm, tools, checkpoints, progress: Arc::new(sink) },
        )
        .await
        .expect("runtime")
    }

    #[tokio::test]
    async fn database_turn_runs_query_and_answers() {
        let llm = ScriptedLlm::new(
            "DATABASE",
            vec![calls(vec![query_call("c1", "select count(*) from orders")]), text("There are 42 orders.")],
        );
        let tools = Arc::new(RecordingTools::default());
        let store = Arc::new(InMemoryCheckpointStore::default());
        let sink = InMemoryProgressSink::default();
        let runtime = build_runtime(llm.clone(), tools.clone(), store.clone(), sink.clone(), 25).await;

        let answer = runtime.run_turn("thread-1", "how many orders?").await.expect("turn");
        assert_eq!(answer, "There are 42 orders.");

        let recorded = tools.calls.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1["sql"], json!("SELECT count(*) FROM orders"));

        let requests = llm.reasoning_requests.lock().await;
        assert_eq!(requests[0].1, vec!["query"]);
        assert!(requests[0].0[0].text().contains("MUST call the 'query' tool"));

        let saved = store
            .load(&ThreadId("thread-1".to_string()))
            .await
            .expect("load")
            .expect("state saved");
        assert_eq!(saved.intent, Intent::Database);
        let roles: Vec<Role> = saved.messages.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]);

        let kinds = sink.kinds();
        assert_eq!(kinds.first(), Some(&ProgressKind::TurnStarted));
        assert!(kinds.contains(&ProgressKind::Token { text: "There are 42 orders.".to_string() }));
        assert_eq!(kinds.last(), Some(&ProgressKind::TurnCompleted { steps: 4 }));
    }

    #[tokio::test]
    async fn rejected_query_reaches_the_model_as_a_violation() {
        let llm = ScriptedLlm::new(
            "DATABASE",
            vec![calls(vec![query_call("c1", "DROP TABLE orders")]), text("I can only read data.")],
        );
        let tools = Arc::new(RecordingTools::default());
        let runtime = build_runtime(
            llm.clone(),
            tools.clone(),
            Arc::new(InMemoryCheckpointStore::default()),
            InMemoryProgressSink::default(),
            25,
        )
        .await;

        let answer = runtime.run_turn("t", "drop the orders table").await.expect("turn");
        assert_eq!(answer, "I can only read data.");
        assert!(tools.calls.lock().await.is_empty());

        let requests = llm.reasoning_requests.lock().await;
        let tool_result = requests[1].0.iter().find(|message| message.role == Role::Tool).expect("tool result");
        assert!(tool_result.text().starts_with(SAFETY_VIOLATION_MARKER));
    }

    #[tokio::test]
    async fn general_intent_binds_no_tools_and_api_binds_the_rest() {
        let llm = ScriptedLlm::new("GENERAL", vec![text("Hello!")]);
        let runtime = build_runtime(
            llm.clone(),
            Arc::new(RecordingTools::default()),
            Arc::new(InMemoryCheckpointStore::default()),
            InMemoryProgressSink::default(),
            25,
        )
        .await;
        runtime.run_turn("t", "hi").await.expect("turn");
        assert!(llm.reasoning_requests.lock().await[0].1.is_empty());

        let llm = ScriptedLlm::new("API", vec![text("All services are up.")]);
        let runtime = build_runtime(
            llm.clone(),
            Arc::new(RecordingTools::default()),
            Arc::new(InMemoryCheckpointStore::default()),
            InMemoryProgressSink::default(),
            25,
        )
        .await;
        runtime.run_turn("t", "is the billing service up?").await.expect("turn");
        assert_eq!(llm.reasoning_requests.lock().await[0].1, vec!["service_status"]);
    }

    #[tokio::test]
    async fn markup_tool_calls_are_recovered_and_executed() {
        let markup = "Let me check.\n<｜DSML｜function_calls>\n<｜DSML｜invoke name=\"query\">\n\
                      <｜DSML｜parameter name=\"sql\" string=\"true\">SELECT 1</｜DSML｜parameter>\n\
                      </｜DSML｜invoke>\n</｜DSML｜function_calls>";
        let llm = ScriptedLlm::new("DATABASE", vec![text(markup), text("The answer is 1.")]);
        let tools = Arc::new(RecordingTools::default());
        let runtime = build_runtime(
            llm,
            tools.clone(),
            Arc::new(InMemoryCheckpointStore::default()),
            InMemoryProgressSink::default(),
            25,
        )
        .await;

        let answer = runtime.run_turn("t", "what is one?").await.expect("turn");
        assert_eq!(answer, "The answer is 1.");
        assert_eq!(tools.calls.lock().await[0].1["sql"], json!("SELECT 1"));
    }

    #[tokio::test]
    async fn llm_failure_answers_with_apology() {
        let llm = ScriptedLlm::new("GENERAL", vec![Err(LlmError::Transport("connection refused".to_string()))]);
        let runtime = build_runtime(
            llm,
            Arc::new(RecordingTools::default()),
            Arc::new(InMemoryCheckpointStore::default()),
            InMemoryProgressSink::default(),
            25,
        )
        .await;

        assert_eq!(runtime.run_turn("t", "hello").await.expect("turn"), APOLOGY);
    }

    #[tokio::test]
    async fn endless_tool_loop_exhausts_budget_and_still_persists() {
        let replies = (0..10).map(|index| calls(vec![query_call(&format!("c{index}"), "SELECT 1")])).collect();
        let llm = ScriptedLlm::new("DATABASE", replies);
        let store = Arc::new(InMemoryCheckpointStore::default());
        let runtime = build_runtime(
            llm,
            Arc::new(RecordingTools::default()),
            store.clone(),
            InMemoryProgressSink::default(),
            5,
        )
        .await;

        let error = runtime.run_turn("loop", "count forever").await.expect_err("budget");
        assert_eq!(error, TurnError::StepBudgetExhausted { max_steps: 5 });
        let saved = store.load(&ThreadId("loop".to_string())).await.expect("load").expect("persisted");
        assert!(saved.message_count() > 2);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_work() {
        let llm = ScriptedLlm::new("GENERAL", Vec::new());
        let runtime = build_runtime(
            llm.clone(),
            Arc::new(RecordingTools::default()),
            Arc::new(InMemoryCheckpointStore::default()),
            InMemoryProgressSink::default(),
            25,
        )
        .await;

        assert!(matches!(runtime.run_turn("bad id", "hi").await, Err(TurnError::Domain(DomainError::InvalidThreadId(_)))));
        assert_eq!(runtime.run_turn("t", "   ").await, Err(TurnError::Domain(DomainError::EmptyMessage)));
        assert!(llm.reasoning_requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_failures_do_not_fail_the_turn() {
        let llm = ScriptedLlm::new("GENERAL", vec![text("still here")]);
        let runtime = AgentRuntime::new(
            &config(25),
            RuntimeDeps {
                llm,
                tools: Arc::new(RecordingTools::default()),
                checkpoints: Arc::new(FailingStore),
                progress: Arc::new(NoopProgressSink),
            },
        )
        .await
        .expect("runtime");

        assert_eq!(runtime.run_turn("t", "hi").await.expect("turn"), "still here");
    }

    #[tokio::test]
    async fn history_carries_across_turns_with_one_system_message() {
        let llm = ScriptedLlm::new("GENERAL", vec![text("first answer"), text("second answer")]);
        let store = Arc::new(InMemoryCheckpointStore::default());
        let runtime = build_runtime(
            llm.clone(),
            Arc::new(RecordingTools::default()),
            store.clone(),
            InMemoryProgressSink::default(),
            25,
        )
        .await;

        runtime.run_turn("t", "one").await.expect("turn");
        runtime.run_turn("t", "two").await.expect("turn");

        let requests = llm.reasoning_requests.lock().await;
        let second = &requests[1].0;
        assert_eq!(second.iter().filter(|message| message.role == Role::System).count(), 1);
        assert_eq!(second.last().map(Message::text), Some("two".to_string()));
        assert!(second.iter().any(|message| message.text() == "first answer"));
    }

    #[tokio::test]
    async fn connection_failure_rebinds_tools_on_next_turn() {
        let llm = ScriptedLlm::new(
            "DATABASE",
            vec![calls(vec![query_call("c1", "SELECT 1")]), text("backend down"), text("ok")],
        );
        let tools = Arc::new(RecordingTools { fail_connection: true, ..RecordingTools::default() });
        let runtime = build_runtime(
            llm,
            tools.clone(),
            Arc::new(InMemoryCheckpointStore::default()),
            InMemoryProgressSink::default(),
            25,
        )
        .await;
        assert_eq!(tools.catalog_reads.load(Ordering::SeqCst), 1);

        runtime.run_turn("t", "count").await.expect("turn");
        assert_eq!(tools.invalidations.load(Ordering::SeqCst), 0);

        runtime.run_turn("t", "again").await.expect("turn");
        assert_eq!(tools.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(tools.catalog_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn turns_on_one_thread_are_serialized() {
        struct SlowLlm {
            active: AtomicUsize,
            overlap: AtomicUsize,
        }

        #[async_trait]
        impl LlmClient for SlowLlm {
            async fn complete(&self, _messages: &[Message], _tools: &[ToolDescriptor]) -> Result<LlmReply, LlmError> {
                if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                    self.overlap.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(LlmReply { content: "GENERAL".to_string(), tool_calls: Vec::new() })
            }
        }

        let llm = Arc::new(SlowLlm { active: AtomicUsize::new(0), overlap: AtomicUsize::new(0) });
        let runtime = Arc::new(
            AgentRuntime::new(
                &config(25),
                RuntimeDeps {
                    llm: llm.clone(),
                    tools: Arc::new(RecordingTools::default()),
                    checkpoints: Arc::new(InMemoryCheckpointStore::default()),
                    progress: Arc::new(NoopProgressSink),
                },
            )
            .await
            .expect("runtime"),
        );

        let first = tokio::spawn({
            let runtime = Arc::clone(&runtime);
            async move { runtime.run_turn("same", "one").await }
        });
        let second = tokio::spawn({
            let runtime = Arc::clone(&runtime);
            async move { runtime.run_turn("same", "two").await }
        });
        first.await.expect("join").expect("turn");
        second.await.expect("join").expect("turn");

        assert_eq!(llm.overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn turns_on_different_threads_run_concurrently() {
        /// Reasoning calls wait until two of them are inside the model at once.
        struct GatedLlm {
            gate: tokio::sync::Barrier,
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl LlmClient for GatedLlm {
            async fn complete(&self, messages: &[Message], _tools: &[ToolDescriptor]) -> Result<LlmReply, LlmError> {
                if messages.len() == 1 && messages[0].text().starts_with("You are an intent classifier") {
                    return Ok(LlmReply { content: "GENERAL".to_string(), tool_calls: Vec::new() });
                }
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                self.gate.wait().await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(LlmReply { content: "done".to_string(), tool_calls: Vec::new() })
            }
        }

        let llm = Arc::new(GatedLlm {
            gate: tokio::sync::Barrier::new(2),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let runtime = AgentRuntime::new(
            &config(25),
            RuntimeDeps {
                llm: llm.clone(),
                tools: Arc::new(RecordingTools::default()),
                checkpoints: Arc::new(InMemoryCheckpointStore::default()),
                progress: Arc::new(NoopProgressSink),
            },
        )
        .await
        .expect("runtime");

        let both = async { tokio::join!(runtime.run_turn("alpha", "one"), runtime.run_turn("beta", "two")) };
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("turns on different threads must not wait for each other");

        assert_eq!(first.expect("turn"), "done");
        assert_eq!(second.expect("turn"), "done");
        assert_eq!(llm.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn streamed_tokens_are_reported_before_the_checkpoint_is_written() {
        struct StreamingLlm;

        #[async_trait]
        impl LlmClient for StreamingLlm {
            async fn complete(&self, _messages: &[Message], _tools: &[ToolDescriptor]) -> Result<LlmReply, LlmError> {
                Ok(LlmReply { content: "GENERAL".to_string(), tool_calls: Vec::new() })
            }

            async fn complete_streaming(
                &self,
                _messages: &[Message],
                _tools: &[ToolDescriptor],
                on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
            ) -> Result<LlmReply, LlmError> {
                for piece in ["Forty", "-two ", "orders."] {
                    on_token(piece);
                }
                Ok(LlmReply { content: "Forty-two orders.".to_string(), tool_calls: Vec::new() })
            }
        }

        /// Records how many tokens had been reported when each save happened.
        struct ObservingStore {
            sink: InMemoryProgressSink,
            tokens_at_save: std::sync::Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl CheckpointStore for ObservingStore {
            async fn load(&self, _thread_id: &ThreadId) -> Result<Option<ConversationState>, CheckpointError> {
                Ok(None)
            }

            async fn save(&self, _thread_id: &ThreadId, _state: &ConversationState) -> Result<(), CheckpointError> {
                let tokens = self
                    .sink
                    .kinds()
                    .iter()
                    .filter(|kind| matches!(kind, ProgressKind::Token { .. }))
                    .count();
                self.tokens_at_save.lock().expect("lock").push(tokens);
                Ok(())
            }
        }

        let sink = InMemoryProgressSink::default();
        let store = Arc::new(ObservingStore { sink: sink.clone(), tokens_at_save: std::sync::Mutex::new(Vec::new()) });
        let runtime = AgentRuntime::new(
            &config(25),
            RuntimeDeps {
                llm: Arc::new(StreamingLlm),
                tools: Arc::new(RecordingTools::default()),
                checkpoints: store.clone(),
                progress: Arc::new(sink.clone()),
            },
        )
        .await
        .expect("runtime");

        let answer = runtime.run_turn("t", "how many orders?").await.expect("turn");
        assert_eq!(answer, "Forty-two orders.");

        let tokens: Vec<String> = sink
            .kinds()
            .into_iter()
            .filter_map(|kind| match kind {
                ProgressKind::Token { text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["Forty", "-two ", "orders."]);
        assert_eq!(*store.tokens_at_save.lock().expect("lock"), vec![3]);
        assert_eq!(sink.kinds().last(), Some(&ProgressKind::TurnCompleted { steps: 2 }));
    }
}
