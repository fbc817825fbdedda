//! Recovery of tool calls that a model wrote inline as markup instead of
//! returning them through the structured tool-call channel.
//!
//! The grammar is the DSML invocation format:
//!
//! ```text
//! <|DSML|function_calls>
//! <|DSML|invoke name="query">
//! <|DSML|parameter name="sql" string="true">SELECT 1</|DSML|parameter>
//! </|DSML|invoke>
//! </|DSML|function_calls>
//! ```
//!
//! Models emit both the ASCII bar and the fullwidth `｜`, sometimes mixed.

use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

use datapilot_core::ToolCall;

const DELIM: &str = "[|｜]";

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedMarkup {
    pub tool_calls: Vec<ToolCall>,
    /// Input with every invocation block and wrapper tag removed.
    pub visible_text: String,
}

#[derive(Clone, Debug)]
pub struct MarkupDecoder {
    marker: Regex,
    invoke: Regex,
    parameter: Regex,
    wrapper: Regex,
}

impl MarkupDecoder {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            marker: Regex::new(&format!("<{DELIM}DSML{DELIM}"))?,
            invoke: Regex::new(&format!(
                r#"(?s)<{DELIM}DSML{DELIM}invoke\s+name="([^"]*)"\s*>(.*?)</{DELIM}DSML{DELIM}invoke\s*>"#
            ))?,
            parameter: Regex::new(&format!(
                r#"(?s)<{DELIM}DSML{DELIM}parameter\s+name="([^"]*)"([^>]*)>(.*?)</{DELIM}DSML{DELIM}parameter\s*>"#
            ))?,
            wrapper: Regex::new(&format!(r"</?{DELIM}DSML{DELIM}function_calls\s*>"))?,
        })
    }

    pub fn contains_markup(&self, text: &str) -> bool {
        self.marker.is_match(text)
    }

    /// Returns `None` when the text holds no complete invocation.
    pub fn decode(&self, text: &str) -> Option<DecodedMarkup> {
        if !self.contains_markup(text) {
            return None;
        }

        let tool_calls: Vec<ToolCall> = self
            .invoke
            .captures_iter(text)
            .filter_map(|invoke| {
                let name = invoke.get(1)?.as_str().trim();
                if name.is_empty() {
                    return None;
                }
                let body = invoke.get(2).map(|body| body.as_str()).unwrap_or_default();
                Some(ToolCall {
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    name: name.to_string(),
                    arguments: self.parameters(body),
                })
            })
            .collect();

        if tool_calls.is_empty() {
            return None;
        }

        let without_invokes = self.invoke.replace_all(text, "");
        let visible_text = self.wrapper.replace_all(&without_invokes, "").trim().to_string();
        Some(DecodedMarkup { tool_calls, visible_text })
    }

    fn parameters(&self, body: &str) -> Map<String, Value> {
        let mut arguments = Map::new();
        for parameter in self.parameter.captures_iter(body) {
            let Some(name) = parameter.get(1).map(|name| name.as_str().trim()) else {
                continue;
            };
            let attributes = parameter.get(2).map(|attrs| attrs.as_str()).unwrap_or_default();
            let raw = parameter.get(3).map(|value| value.as_str().trim()).unwrap_or_default();
            arguments.insert(name.to_string(), parameter_value(attributes, raw));
        }
        arguments
    }
}

/// `string="false"` marks a JSON literal; anything else, or JSON that does not parse, stays text.
fn parameter_value(attributes: &str, raw: &str) -> Value {
    let json_literal = attributes.contains(r#"string="false""#);
    if json_literal {
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}
