use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Either a JSON object or a string holding JSON, depending on the provider.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl FunctionCall {
    /// Arguments as a JSON object, decoding the string form if needed.
    pub fn arguments_object(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        match &self.arguments {
            serde_json::Value::Object(map) => Ok(map.clone()),
            serde_json::Value::Null => Ok(serde_json::Map::new()),
            serde_json::Value::String(s) if s.trim().is_empty() => Ok(serde_json::Map::new()),
            serde_json::Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        }
    }

    /// Arguments rendered as a JSON string, the form OpenAI-style APIs expect.
    pub fn arguments_string(&self) -> String {
        match &self.arguments {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => "{}".to_string(),
            other => other.to_string(),
        }
    }
}

/// Function-calling description of a tool, as sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolSpec {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        ToolSpec {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub tool_type: Option<String>,
    pub function: FunctionCall,
}
