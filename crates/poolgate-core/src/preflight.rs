use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde_json::{Map, Value};

use poolgate_common::GatewayConfig;
use poolgate_protocol::Dialect;

#[derive(Debug)]
pub struct PreflightError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub message: String,
}

impl PreflightError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: "invalid_request_error",
            message: message.into(),
        }
    }
}

/// Parsed and validated request, ready for admission. `body` holds the bytes
/// that will actually be forwarded; when instructions were injected these
/// are the re-serialized bytes, never the originals.
#[derive(Debug)]
pub struct Preflight {
    pub body: Bytes,
    pub value: Map<String, Value>,
    pub model: String,
    pub stream: bool,
}

pub fn run(
    dialect: Dialect,
    headers: &HeaderMap,
    body: Bytes,
    config: &GatewayConfig,
) -> Result<Preflight, PreflightError> {
    if body.len() > config.body_max_bytes {
        return Err(PreflightError {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            error_type: "invalid_request_error",
            message: format!(
                "Request body exceeds the {} byte limit",
                config.body_max_bytes
            ),
        });
    }
    if body.is_empty() {
        return Err(PreflightError::invalid("Request body is empty"));
    }

    let mut value: Map<String, Value> = serde_json::from_slice(&body)
        .map_err(|_| PreflightError::invalid("Failed to parse request body"))?;

    let model = value
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if model.is_empty() {
        return Err(PreflightError::invalid("model is required"));
    }
    let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let mut body = body;
    if dialect == Dialect::OpenAI {
        let user_agent = headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if inject_default_instructions(&mut value, user_agent, config) {
            body = Bytes::from(
                serde_json::to_vec(&value)
                    .map_err(|_| PreflightError::invalid("Failed to process request body"))?,
            );
        }

        validate_function_call_output(&value)?;
    }

    Ok(Preflight {
        body,
        value,
        model,
        stream,
    })
}

/// The Codex CLI supplies its own instructions; everything else gets the
/// configured default when the field is absent or blank.
fn is_cli_user_agent(user_agent: &str) -> bool {
    user_agent.to_ascii_lowercase().starts_with("codex")
}

fn inject_default_instructions(
    value: &mut Map<String, Value>,
    user_agent: &str,
    config: &GatewayConfig,
) -> bool {
    if is_cli_user_agent(user_agent) {
        return false;
    }
    let existing = value
        .get("instructions")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !existing.trim().is_empty() {
        return false;
    }
    let Some(instructions) = config
        .responses_default_instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return false;
    };
    value.insert(
        "instructions".to_string(),
        Value::String(instructions.to_string()),
    );
    true
}

fn input_items(value: &Map<String, Value>) -> &[Value] {
    value
        .get("input")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn item_type<'a>(item: &'a Value) -> &'a str {
    item.get("type").and_then(Value::as_str).unwrap_or_default()
}

/// A `function_call_output` must be linkable to its originating call:
/// through `previous_response_id`, a sibling `tool_call`/`function_call`
/// with the same `call_id`, or an `item_reference` per `call_id`. Rejecting
/// here avoids a guaranteed upstream 400 after an account was burned.
fn validate_function_call_output(value: &Map<String, Value>) -> Result<(), PreflightError> {
    let outputs: Vec<&Value> = input_items(value)
        .iter()
        .filter(|item| item_type(item) == "function_call_output")
        .collect();
    if outputs.is_empty() {
        return Ok(());
    }

    let previous_response_id = value
        .get("previous_response_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !previous_response_id.trim().is_empty() {
        return Ok(());
    }

    let call_ids: Vec<&str> = outputs
        .iter()
        .filter_map(|item| item.get("call_id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .collect();

    if call_ids.len() < outputs.len() {
        return Err(PreflightError::invalid(
            "function_call_output requires call_id or previous_response_id; \
             if relying on history, ensure store=true and reuse previous_response_id",
        ));
    }

    if has_tool_call_context(value, &call_ids) {
        return Ok(());
    }

    if has_item_reference_for_call_ids(value, &call_ids) {
        return Ok(());
    }

    Err(PreflightError::invalid(
        "function_call_output requires item_reference ids matching each call_id, \
         or previous_response_id/tool_call context; if relying on history, \
         ensure store=true and reuse previous_response_id",
    ))
}

fn has_tool_call_context(value: &Map<String, Value>, call_ids: &[&str]) -> bool {
    call_ids.iter().all(|call_id| {
        input_items(value).iter().any(|item| {
            matches!(item_type(item), "function_call" | "tool_call")
                && item.get("call_id").and_then(Value::as_str) == Some(*call_id)
        })
    })
}

fn has_item_reference_for_call_ids(value: &Map<String, Value>, call_ids: &[&str]) -> bool {
    call_ids.iter().all(|call_id| {
        input_items(value).iter().any(|item| {
            item_type(item) == "item_reference"
                && item.get("id").and_then(Value::as_str) == Some(*call_id)
        })
    })
}
