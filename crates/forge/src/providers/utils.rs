use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};

use super::base::{ModelResponse, Usage};
use crate::errors::{ForgeError, ForgeResult};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolInvocation};

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": message.role.as_str(),
            "content": message.content,
        });

        if message.role == Role::Tool {
            if let Some(call_id) = &message.tool_call_id {
                converted["tool_call_id"] = json!(call_id);
            }
        }

        if message.has_tool_calls() {
            let tool_calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(&call.name),
                            "arguments": Value::Object(call.input.clone()).to_string(),
                        }
                    })
                })
                .collect();
            converted["tool_calls"] = json!(tool_calls);
            if message.content.is_empty() {
                converted["content"] = Value::Null;
            }
        }

        messages_spec.push(converted);
    }

    messages_spec
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> ForgeResult<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(ForgeError::Configuration(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Convert an OpenAI-shaped chat completion into a [`ModelResponse`]
pub fn openai_response_to_model_response(response: &Value) -> ModelResponse {
    let choice = &response["choices"][0];
    let original = &choice["message"];

    let mut result = ModelResponse {
        content: original["content"].as_str().unwrap_or_default().to_string(),
        model: response["model"].as_str().unwrap_or_default().to_string(),
        usage: get_openai_usage(response),
        finish_reason: choice["finish_reason"]
            .as_str()
            .unwrap_or("stop")
            .to_string(),
        ..Default::default()
    };

    if let Some(tool_calls) = original["tool_calls"].as_array() {
        for (index, tool_call) in tool_calls.iter().enumerate() {
            let id = tool_call["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", index));
            let function_name = tool_call["function"]["name"].as_str().unwrap_or_default();

            // Arguments are a JSON string on the wire, but some local servers
            // send an object directly
            let arguments = &tool_call["function"]["arguments"];
            let input = match arguments {
                Value::String(raw) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                other => other.clone(),
            };
            // An unusable name is kept under a sanitized one and answered with
            // an error, so the model learns about it on the next iteration
            let call = if is_valid_function_name(function_name) {
                ToolInvocation::from_value(id, function_name, input)
            } else {
                tracing::warn!("tool call with invalid function name '{}'", function_name);
                let sanitized = match sanitize_function_name(function_name) {
                    name if name.is_empty() => "invalid_tool".to_string(),
                    name => name,
                };
                ToolInvocation::from_value(id, sanitized, input).with_error(format!(
                    "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                    function_name
                ))
            };
            result.tool_calls.push(call);
        }
    }

    result
}

pub fn get_openai_usage(data: &Value) -> Usage {
    let usage = &data["usage"];
    let tokens = |key: &str| usage[key].as_u64().unwrap_or(0) as u32;
    Usage::new(tokens("prompt_tokens"), tokens("completion_tokens"))
}

/// Map a non-success status onto a provider error, keeping the body for context
pub async fn handle_response(provider: &str, response: Response) -> ForgeResult<Response> {
    match response.status() {
        StatusCode::OK => Ok(response),
        status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
            Err(ForgeError::provider(provider, format!("Server error: {}", status)))
        }
        status => {
            let error_text = response.text().await.unwrap_or_default();
            Err(ForgeError::provider(
                provider,
                format!("Request failed: {} - {}", status, error_text),
            ))
        }
    }
}

pub fn check_openai_context_length_error(error: &Value) -> Option<ForgeError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error");
        Some(ForgeError::provider(
            "openai",
            format!("Context length exceeded. Message: {}", message),
        ))
    } else {
        None
    }
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    const OPENAI_TOOL_USE_RESPONSE: &str = r#"{
        "model": "gpt-4o",
        "choices": [{
            "finish_reason": "tool_calls",
            "message": {
                "role": "assistant",
                "tool_calls": [{
                    "id": "1",
                    "function": {
                        "name": "example_fn",
                        "arguments": "{\"param\": \"value\"}"
                    }
                }]
            }
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 25,
            "total_tokens": 35
        }
    }"#;

    #[test]
    fn test_messages_to_openai_spec() {
        let messages = vec![
            Message::system().with_text("You are helpful"),
            Message::user().with_text("How are you?"),
            Message::assistant()
                .with_tool_call(ToolInvocation::from_value(
                    "tool1",
                    "example",
                    json!({"param1": "value1"}),
                )),
            Message::tool("tool1").with_text("Result"),
        ];

        let spec = messages_to_openai_spec(&messages);

        assert_eq!(spec.len(), 4);
        assert_eq!(spec[0]["role"], "system");
        assert_eq!(spec[1]["content"], "How are you?");
        assert_eq!(spec[2]["role"], "assistant");
        assert!(spec[2]["content"].is_null());
        assert_eq!(spec[2]["tool_calls"][0]["function"]["arguments"], "{\"param1\":\"value1\"}");
        assert_eq!(spec[3]["role"], "tool");
        assert_eq!(spec[3]["content"], "Result");
        assert_eq!(spec[3]["tool_call_id"], spec[2]["tool_calls"][0]["id"]);
    }

    #[test]
    fn test_tools_to_openai_spec() -> anyhow::Result<()> {
        let tool = Tool::new(
            "test_tool",
            "A test tool",
            json!({
                "type": "object",
                "properties": {
                    "input": {"type": "string", "description": "Test parameter"}
                },
                "required": ["input"]
            }),
        );

        let spec = tools_to_openai_spec(&[tool.clone()])?;
        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0]["type"], "function");
        assert_eq!(spec[0]["function"]["name"], "test_tool");

        let err = tools_to_openai_spec(&[tool.clone(), tool]).unwrap_err();
        assert!(err.to_string().contains("Duplicate tool name"));
        Ok(())
    }

    #[test]
    fn test_sanitize_function_name() {
        assert_eq!(sanitize_function_name("hello-world"), "hello-world");
        assert_eq!(sanitize_function_name("hello world"), "hello_world");
        assert_eq!(sanitize_function_name("hello@world"), "hello_world");
        assert!(is_valid_function_name("hello_world"));
        assert!(!is_valid_function_name("hello world"));
    }

    #[test]
    fn test_response_text() {
        let response = json!({
            "model": "codestral",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 15}
        });

        let result = openai_response_to_model_response(&response);
        assert_eq!(result.content, "Hello there");
        assert_eq!(result.model, "codestral");
        assert_eq!(result.usage, Usage::new(12, 15));
        assert!(result.tool_calls.is_empty());
    }

    #[test]
    fn test_response_tool_request() -> anyhow::Result<()> {
        let response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        let result = openai_response_to_model_response(&response);

        assert_eq!(result.finish_reason, "tool_calls");
        assert_eq!(result.tool_calls.len(), 1);
        let mut expected = Map::new();
        expected.insert("param".into(), json!("value"));
        assert_eq!(result.tool_calls[0].input, expected);
        Ok(())
    }

    #[test]
    fn test_response_invalid_arguments_kept_raw() -> anyhow::Result<()> {
        let mut response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        response["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"] =
            json!("invalid json {");
        let result = openai_response_to_model_response(&response);
        assert_eq!(result.tool_calls[0].input["input"], json!("invalid json {"));

        Ok(())
    }

    #[test]
    fn test_response_invalid_function_name_is_answered_with_error() -> anyhow::Result<()> {
        let mut response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        response["choices"][0]["message"]["tool_calls"][0]["function"]["name"] =
            json!("invalid fn");
        let result = openai_response_to_model_response(&response);

        assert_eq!(result.tool_calls.len(), 1);
        let call = &result.tool_calls[0];
        assert_eq!(call.name, "invalid_fn");
        assert!(call
            .error
            .as_deref()
            .is_some_and(|e| e.contains("'invalid fn' had invalid characters")));
        Ok(())
    }

    #[test]
    fn test_check_openai_context_length_error() {
        let error = json!({
            "code": "context_length_exceeded",
            "message": "This message is too long"
        });
        let result = check_openai_context_length_error(&error).unwrap();
        assert!(result.to_string().contains("Context length exceeded"));

        let error = json!({"code": "other_error", "message": "Some other error"});
        assert!(check_openai_context_length_error(&error).is_none());
    }
}
