use serde_json::{Map, Value};

/// Provider-reported token counts, normalized across dialects. OpenAI
/// `input_tokens_details.cached_tokens` maps onto `cache_read`; the OpenAI
/// wire shape has no cache-creation counter, so that side stays zero until a
/// transfer moves tokens into it for billing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTuple {
    pub input: i64,
    pub output: i64,
    pub cache_creation: i64,
    pub cache_read: i64,
}

/// Locate the usage object inside a response payload. Handles the bare body
/// (`usage`), the Anthropic `message_start` frame (`message.usage`), and the
/// OpenAI Responses stream frames (`response.usage`).
pub fn usage_object(value: &Value) -> Option<&Map<String, Value>> {
    if let Some(usage) = value.get("usage").and_then(Value::as_object) {
        return Some(usage);
    }
    if let Some(usage) = value
        .get("message")
        .and_then(|m| m.get("usage"))
        .and_then(Value::as_object)
    {
        return Some(usage);
    }
    value
        .get("response")
        .and_then(|r| r.get("usage"))
        .and_then(Value::as_object)
}

pub fn usage_object_mut(value: &mut Value) -> Option<&mut Map<String, Value>> {
    let path = if value.get("usage").is_some_and(Value::is_object) {
        UsagePath::Bare
    } else if value
        .get("message")
        .and_then(|m| m.get("usage"))
        .is_some_and(Value::is_object)
    {
        UsagePath::Message
    } else if value
        .get("response")
        .and_then(|r| r.get("usage"))
        .is_some_and(Value::is_object)
    {
        UsagePath::Response
    } else {
        return None;
    };

    match path {
        UsagePath::Bare => value.get_mut("usage")?.as_object_mut(),
        UsagePath::Message => value
            .get_mut("message")?
            .get_mut("usage")?
            .as_object_mut(),
        UsagePath::Response => value
            .get_mut("response")?
            .get_mut("usage")?
            .as_object_mut(),
    }
}

enum UsagePath {
    Bare,
    Message,
    Response,
}

pub fn tuple_from_usage(usage: &Map<String, Value>) -> UsageTuple {
    let mut tuple = UsageTuple::default();
    update_tuple_from_usage(usage, &mut tuple);
    tuple
}

/// Fold one usage object into an accumulator, overwriting only the fields it
/// carries. Anthropic streams report cache counters in `message_start` and
/// output tokens in the trailing `message_delta`; the accumulator sees both.
pub fn update_tuple_from_usage(usage: &Map<String, Value>, tuple: &mut UsageTuple) {
    if let Some(v) = usage.get("input_tokens").and_then(Value::as_i64) {
        tuple.input = v;
    }
    if let Some(v) = usage.get("output_tokens").and_then(Value::as_i64) {
        tuple.output = v;
    }
    if let Some(v) = usage
        .get("cache_creation_input_tokens")
        .and_then(Value::as_i64)
    {
        tuple.cache_creation = v;
    }
    if let Some(v) = usage.get("cache_read_input_tokens").and_then(Value::as_i64) {
        tuple.cache_read = v;
    } else if let Some(v) = usage
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
    {
        tuple.cache_read = v;
    }
}

/// Write post-transfer cache counters back into a usage object, touching only
/// the fields the provider shape actually carries.
pub fn apply_cache_rewrite(usage: &mut Map<String, Value>, cache_creation: i64, cache_read: i64) {
    let anthropic_shape = usage.contains_key("cache_creation_input_tokens")
        || usage.contains_key("cache_read_input_tokens");
    if anthropic_shape {
        usage.insert(
            "cache_creation_input_tokens".to_string(),
            Value::from(cache_creation),
        );
        usage.insert(
            "cache_read_input_tokens".to_string(),
            Value::from(cache_read),
        );
        return;
    }
    if let Some(details) = usage
        .get_mut("input_tokens_details")
        .and_then(Value::as_object_mut)
    {
        details.insert("cached_tokens".to_string(), Value::from(cache_read));
    }
}
