use std::sync::Arc;

use tracing::{info, warn};

use datapilot_core::{ConversationState, Intent, Message, Role};

use crate::llm::LlmClient;

const EXCERPT_CHARS: usize = 200;

const CLASSIFIER_PROMPT: &str = "You are an intent classifier. Read the LAST user question in \
the history below and classify it as exactly one of:\n\
- DATABASE: business data lookups, counts, tables or schemas (\"how many...\", \"which tables...\", \"who is...\").\n\
- API: questions about system capabilities, available endpoints, service status or HTTP calls.\n\
- GENERAL: greetings or small talk.\n\n\
History:\n{context}\n\n\
Reply with ONE word only: DATABASE, API or GENERAL.";

/// Routes a conversation to an [`Intent`] with a single model call.
#[derive(Clone)]
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
    window: usize,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, window: usize) -> Self {
        Self { llm, window: window.max(1) }
    }

    /// Never fails: any model error routes to [`Intent::General`].
    pub async fn classify(&self, state: &ConversationState) -> Intent {
        let prompt = CLASSIFIER_PROMPT.replace("{context}", &self.context(state));
        match self.llm.complete(&[Message::user(prompt)], &[]).await {
            Ok(reply) => {
                let intent = Intent::from_label(&reply.content);
                info!(event_name = "agent.intent.classified", intent = intent.as_str(), "intent classified");
                intent
            }
            Err(error) => {
                warn!(
                    event_name = "agent.intent.failed",
                    error = %error,
                    "intent classification failed, routing to GENERAL"
                );
                Intent::General
            }
        }
    }

    fn context(&self, state: &ConversationState) -> String {
        state
            .recent(self.window)
            .into_iter()
            .map(|message| {
                let speaker = if message.role == Role::User { "User" } else { "AI" };
                let excerpt: String = message.text().chars().take(EXCERPT_CHARS).collect();
                format!("{speaker}: {excerpt}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
