use std::collections::HashSet;

use datapilot_core::{Message, MessageContent, Role};

/// Repairs a persisted history so it satisfies the chat protocol the model expects:
///
/// - structured tool results are flattened to a single text string,
/// - an assistant message whose tool calls are not all answered by the tool
///   results directly after it is rewritten to plain text, and those partial
///   results are dropped with it,
/// - tool results that answer no preceding call are dropped.
pub fn prepare_history(messages: &[Message]) -> Vec<Message> {
    let mut prepared = Vec::with_capacity(messages.len());
    let mut index = 0;

    while index < messages.len() {
        let message = &messages[index];

        if message.has_tool_calls() {
            let results_end = messages[index + 1..]
                .iter()
                .position(|next| next.role != Role::Tool)
                .map(|offset| index + 1 + offset)
                .unwrap_or(messages.len());
            let results = &messages[index + 1..results_end];

            let answered: HashSet<&str> =
                results.iter().filter_map(|result| result.tool_call_id.as_deref()).collect();
            let complete = message.tool_calls.iter().all(|call| answered.contains(call.id.as_str()));

            if complete {
                let requested: HashSet<&str> =
                    message.tool_calls.iter().map(|call| call.id.as_str()).collect();
                prepared.push(message.clone());
                prepared.extend(
                    results
                        .iter()
                        .filter(|result| {
                            result.tool_call_id.as_deref().is_some_and(|id| requested.contains(id))
                        })
                        .map(flatten_tool_result),
                );
            } else {
                prepared.push(interrupted_placeholder(message));
            }

            index = results_end;
            continue;
        }

        // Tool results are only kept as part of the block that answers them.
        if message.role != Role::Tool {
            prepared.push(message.clone());
        }
        index += 1;
    }

    prepared
}

fn flatten_tool_result(message: &Message) -> Message {
    let mut flattened = message.clone();
    if message.content.is_structured() {
        flattened.content = MessageContent::Text(message.content.flatten());
    }
    flattened
}

fn interrupted_placeholder(message: &Message) -> Message {
    let names: Vec<&str> = message.tool_calls.iter().map(|call| call.name.as_str()).collect();
    let notice = format!(
        "(tool request for {} was interrupted before its results arrived)",
        names.join(", ")
    );
    let text = message.text();
    if text.trim().is_empty() {
        Message::assistant(notice)
    } else {
        Message::assistant(format!("{}\n{notice}", text.trim_end()))
    }
}
