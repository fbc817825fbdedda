use datapilot_core::ToolDescriptor;

use crate::session::{CallOutcome, ContentBlock, RemoteTool};

pub fn descriptor(tool: &RemoteTool, backend: &str) -> ToolDescriptor {
    ToolDescriptor::from_input_schema(&tool.name, tool.description.clone(), &tool.input_schema, backend)
}

/// Renders a call result as the single string the model sees. Text parts are
/// joined by newlines, other parts become bracketed placeholders, and a result
/// flagged as failed by the backend is prefixed with `Error:`.
pub fn render_outcome(outcome: CallOutcome) -> String {
    let parts: Vec<String> = outcome
        .blocks
        .into_iter()
        .map(|block| match block {
            ContentBlock::Text(text) => text,
            ContentBlock::Image { mime_type } => format!("[image: {mime_type}]"),
            ContentBlock::Audio { mime_type } => format!("[audio: {mime_type}]"),
            ContentBlock::Resource { text: Some(text), .. } => text,
            ContentBlock::Resource { uri, text: None } => format!("[resource: {uri}]"),
            ContentBlock::Link { uri } => format!("[resource: {uri}]"),
        })
        .collect();

    let mut rendered = parts.join("\n");
    if rendered.is_empty() {
        if let Some(structured) = outcome.structured {
            rendered = structured.to_string();
        }
    }

    if outcome.is_error {
        format!("Error: {rendered}")
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use datapilot_core::ParameterType;

    use super::{descriptor, render_outcome};
    use crate::session::{CallOutcome, ContentBlock, RemoteTool};

    #[test]
    fn mixed_content_becomes_one_display_string() {
        let outcome = CallOutcome {
            blocks: vec![
                ContentBlock::Text("3 rows".to_string()),
                ContentBlock::Image { mime_type: "image/png".to_string() },
                ContentBlock::Resource { uri: "file:///report.csv".to_string(), text: None },
                ContentBlock::Resource { uri: "mem://x".to_string(), text: Some("inline".to_string()) },
            ],
            structured: None,
            is_error: false,
        };

        assert_eq!(render_outcome(outcome), "3 rows\n[image: image/png]\n[resource: file:///report.csv]\ninline");
    }

    #[test]
    fn backend_error_flag_prefixes_text() {
        let outcome = CallOutcome {
            blocks: vec![ContentBlock::Text("Table 'shop.order' doesn't exist".to_string())],
            structured: None,
            is_error: true,
        };
        assert_eq!(render_outcome(outcome), "Error: Table 'shop.order' doesn't exist");
    }

    #[test]
    fn structured_content_fills_an_empty_result() {
        let outcome = CallOutcome { blocks: Vec::new(), structured: Some(json!({"count": 2})), is_error: false };
        assert_eq!(render_outcome(outcome), r#"{"count":2}"#);
    }

    #[test]
    fn descriptor_mirrors_the_input_schema() {
        let tool = RemoteTool {
            name: "get_order".to_string(),
            description: Some("Fetch one order".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"id": {"type": "integer"}, "expand": {"type": ["boolean", "null"]}},
                "required": ["id"]
            }),
        };

        let descriptor = descriptor(&tool, "orders");
        assert_eq!(descriptor.backend, "orders");
        let id = descriptor.parameters.iter().find(|parameter| parameter.name == "id").expect("id");
        assert!(id.required);
        assert_eq!(id.param_type, ParameterType::Integer);
        let expand = descriptor.parameters.iter().find(|parameter| parameter.name == "expand").expect("expand");
        assert!(!expand.required);
        assert_eq!(expand.param_type, ParameterType::Boolean);
    }
}
