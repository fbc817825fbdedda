use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Coarse parameter typing shared by the model-facing schema and argument checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    /// Maps a JSON-schema `type` keyword. Unknown, missing or union types fall back to string.
    pub fn from_schema_type(value: Option<&Value>) -> Self {
        let keyword = match value {
            Some(Value::String(keyword)) => Some(keyword.as_str()),
            Some(Value::Array(options)) => options
                .iter()
                .filter_map(Value::as_str)
                .find(|keyword| *keyword != "null"),
            _ => None,
        };
        match keyword {
            Some("integer") => Self::Integer,
            Some("number") => Self::Number,
            Some("boolean") => Self::Boolean,
            Some("array") => Self::Array,
            Some("object") => Self::Object,
            _ => Self::String,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    /// Converts a value of the wrong JSON type, mostly strings produced by markup recovery.
    fn coerce(self, value: Value) -> Option<Value> {
        if self.accepts(&value) {
            return Some(value);
        }
        match (self, value) {
            (Self::String, Value::Number(number)) => Some(Value::String(number.to_string())),
            (Self::String, Value::Bool(flag)) => Some(Value::String(flag.to_string())),
            (Self::Integer, Value::String(raw)) => raw.trim().parse::<i64>().ok().map(Value::from),
            // 2^63 itself is out of range, hence the strict upper bound.
            (Self::Integer, Value::Number(number)) => number
                .as_f64()
                .filter(|float| float.fract() == 0.0)
                .filter(|float| *float >= i64::MIN as f64 && *float < i64::MAX as f64)
                .map(|float| Value::from(float as i64)),
            (Self::Number, Value::String(raw)) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            (Self::Boolean, Value::String(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::Array | Self::Object, Value::String(raw)) => serde_json::from_str::<Value>(&raw)
                .ok()
                .filter(|parsed| self.accepts(parsed)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub description: Option<String>,
    pub param_type: ParameterType,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    /// Name of the backend that owns the tool.
    pub backend: String,
}

impl ToolDescriptor {
    /// Builds a descriptor from an MCP-style `inputSchema` object.
    pub fn from_input_schema(
        name: impl Into<String>,
        description: Option<String>,
        input_schema: &Value,
        backend: impl Into<String>,
    ) -> Self {
        let required: Vec<&str> = input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let parameters = input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| {
                properties
                    .iter()
                    .map(|(param_name, schema)| ParameterSpec {
                        name: param_name.clone(),
                        description: schema
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        param_type: ParameterType::from_schema_type(schema.get("type")),
                        required: required.contains(&param_name.as_str()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: name.into(),
            description: description.unwrap_or_default(),
            parameters,
            backend: backend.into(),
        }
    }

    /// JSON schema handed to the model for function calling.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for parameter in &self.parameters {
            let mut schema = Map::new();
            schema.insert("type".to_string(), json!(parameter.param_type.as_str()));
            if let Some(description) = &parameter.description {
                schema.insert("description".to_string(), json!(description));
            }
            properties.insert(parameter.name.clone(), Value::Object(schema));
            if parameter.required {
                required.push(json!(parameter.name));
            }
        }
        json!({ "type": "object", "properties": properties, "required": required })
    }

    /// Checks required parameters and coerces declared ones into their declared type.
    /// Undeclared arguments pass through untouched.
    pub fn prepare_arguments(&self, mut arguments: Map<String, Value>) -> Result<Map<String, Value>, String> {
        for parameter in &self.parameters {
            match arguments.remove(&parameter.name) {
                None | Some(Value::Null) if parameter.required => {
                    return Err(format!("missing required argument `{}`", parameter.name));
                }
                None => {}
                Some(Value::Null) => {
                    arguments.insert(parameter.name.clone(), Value::Null);
                }
                Some(value) => {
                    let coerced = parameter.param_type.coerce(value).ok_or_else(|| {
                        format!(
                            "argument `{}` must be of type {}",
                            parameter.name,
                            parameter.param_type.as_str()
                        )
                    })?;
                    arguments.insert(parameter.name.clone(), coerced);
                }
            }
        }
        Ok(arguments)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{ParameterType, ToolDescriptor};

    fn descriptor() -> ToolDescriptor {
        ToolDescriptor::from_input_schema(
            "search_customers",
            Some("Find customers".to_string()),
            &json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Customer name"},
                    "limit": {"type": "integer"},
                    "active": {"type": "boolean"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "score": {"type": ["number", "null"]},
                    "opaque": {}
                },
                "required": ["name"]
            }),
            "crm",
        )
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn schema_types_map_coarsely_with_string_fallback() {
        let descriptor = descriptor();
        let types: Vec<(String, ParameterType, bool)> = descriptor
            .parameters
            .iter()
            .map(|parameter| (parameter.name.clone(), parameter.param_type, parameter.required))
            .collect();

        assert!(types.contains(&("name".to_string(), ParameterType::String, true)));
        assert!(types.contains(&("limit".to_string(), ParameterType::Integer, false)));
        assert!(types.contains(&("score".to_string(), ParameterType::Number, false)));
        assert!(types.contains(&("opaque".to_string(), ParameterType::String, false)));
        assert_eq!(descriptor.backend, "crm");
    }

    #[test]
    fn json_schema_lists_required_parameters() {
        let schema = descriptor().to_json_schema();
        assert_eq!(schema["required"], json!(["name"]));
        assert_eq!(schema["properties"]["limit"]["type"], json!("integer"));
        assert_eq!(schema["properties"]["name"]["description"], json!("Customer name"));
    }

    #[test]
    fn string_arguments_are_coerced_to_declared_types() {
        let prepared = descriptor()
            .prepare_arguments(args(json!({
                "name": "acme",
                "limit": "10",
                "active": "TRUE",
                "tags": "[\"a\",\"b\"]",
                "extra": 1
            })))
            .expect("coercible arguments");

        assert_eq!(prepared["limit"], json!(10));
        assert_eq!(prepared["active"], json!(true));
        assert_eq!(prepared["tags"], json!(["a", "b"]));
        assert_eq!(prepared["extra"], json!(1));
    }

    #[test]
    fn missing_required_or_uncoercible_arguments_are_reported() {
        let missing = descriptor().prepare_arguments(args(json!({"limit": 1})));
        assert_eq!(missing, Err("missing required argument `name`".to_string()));

        let wrong = descriptor().prepare_arguments(args(json!({"name": "a", "limit": "ten"})));
        assert_eq!(wrong, Err("argument `limit` must be of type integer".to_string()));
    }

    #[test]
    fn whole_floats_become_integers_only_inside_the_i64_range() {
        let whole = descriptor().prepare_arguments(args(json!({"name": "a", "limit": 25.0})));
        assert_eq!(whole.map(|prepared| prepared["limit"].clone()), Ok(json!(25)));

        for out_of_range in [json!(1e30), json!(-1e30), json!(9.223372036854775807e18)] {
            let result = descriptor().prepare_arguments(args(json!({"name": "a", "limit": out_of_range})));
            assert_eq!(result, Err("argument `limit` must be of type integer".to_string()));
        }

        let fractional = descriptor().prepare_arguments(args(json!({"name": "a", "limit": 2.5})));
        assert!(fractional.is_err());
    }
}
