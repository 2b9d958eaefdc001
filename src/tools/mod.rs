//! Tools the agent can call.

pub mod builtins;
mod registry;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ToolSpec;

pub use registry::ToolRegistry;

pub type ToolArgs = Map<String, Value>;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Input schema: `{ "<arg>": { "type", "description", "nullable"?, "default"?, "enum"? } }`
    fn inputs(&self) -> Value;

    fn output_type(&self) -> &str {
        "string"
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String>;

    /// Function-calling description derived from `inputs`; nullable inputs are optional.
    fn spec(&self) -> ToolSpec {
        let inputs = self.inputs();
        let mut properties = Map::new();
        let mut required = Vec::new();

        if let Value::Object(map) = &inputs {
            for (key, schema) in map {
                let nullable = schema.get("nullable").and_then(Value::as_bool).unwrap_or(false);
                if !nullable {
                    required.push(Value::String(key.clone()));
                }
                let mut prop = schema.as_object().cloned().unwrap_or_default();
                prop.remove("nullable");
                properties.insert(key.clone(), Value::Object(prop));
            }
        }

        ToolSpec::function(
            self.name(),
            self.description(),
            serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        )
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name().to_string(),
            description: self.description().to_string(),
            inputs: self.inputs(),
            output_type: self.output_type().to_string(),
        }
    }
}

/// Tool description as listed by `/api/tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub inputs: Value,
    pub output_type: String,
}

pub(crate) fn required_str<'a>(args: &'a ToolArgs, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .with_context(|| format!("missing '{}' argument", key))
}

pub(crate) fn optional_str<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

/// Integers sometimes arrive as strings from smaller models.
pub(crate) fn optional_usize(args: &ToolArgs, key: &str) -> Option<usize> {
    match args.get(key)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
