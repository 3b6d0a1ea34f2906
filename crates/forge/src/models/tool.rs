use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::ToolError;

/// A tool that can be used by a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// A JSON Schema object defining the expected parameters for the tool
    pub input_schema: Value,
}

impl Tool {
    /// Create a new tool with the given name and description
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool as advertised by the external tool catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    /// Parameter schema, when the catalog knows one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolInfo {
    pub fn new<N, D, C>(name: N, description: D, category: C) -> Self
    where
        N: Into<String>,
        D: Into<String>,
        C: Into<String>,
    {
        Self {
            name: name.into(),
            description: description.into(),
            category: category.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

impl From<&ToolInfo> for Tool {
    fn from(info: &ToolInfo) -> Self {
        let schema = info
            .parameters
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
        Tool::new(&info.name, &info.description, schema)
    }
}

/// A tool call requested by the model within a turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    /// Unique within the turn; tool messages answer it by this id
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Set when the call could not be interpreted. It is answered with this
    /// error instead of being executed.
    #[serde(skip)]
    pub error: Option<String>,
}

impl ToolInvocation {
    pub fn new<I: Into<String>, N: Into<String>>(
        id: I,
        name: N,
        input: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            error: None,
        }
    }

    pub fn with_error<S: Into<String>>(mut self, error: S) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Build an invocation from an arbitrary JSON value. Non-object inputs are
    /// wrapped under an `input` key so nothing the model sent is lost.
    pub fn from_value<I: Into<String>, N: Into<String>>(id: I, name: N, input: Value) -> Self {
        let input = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self::new(id, name, input)
    }

    /// Deserialize the input into a statically known parameter shape
    pub fn parse_input<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(Value::Object(self.input.clone())).map_err(|e| {
            ToolError::InvalidParameters(format!(
                "Could not interpret parameters for {} ({}): {}",
                self.name, self.id, e
            ))
        })
    }
}

/// The result of running one tool invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ToolOutcome {
    pub fn success<S: Into<String>>(output: S) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// The text fed back to the model for this outcome
    pub fn as_context_text(&self) -> String {
        match &self.error {
            Some(error) if !error.is_empty() => format!("Error: {}", error),
            _ => self.output.clone(),
        }
    }
}
