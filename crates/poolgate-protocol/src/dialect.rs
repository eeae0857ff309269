use bytes::Bytes;
use serde_json::json;

use crate::sse::encode_event;

/// Inbound endpoint dialect. Decides the upstream path, the credential
/// header, and the shape of error bodies returned to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAI,
    Anthropic,
}

impl Dialect {
    pub fn upstream_path(&self) -> &'static str {
        match self {
            Dialect::OpenAI => "/v1/responses",
            Dialect::Anthropic => "/v1/messages",
        }
    }

    pub fn error_body(&self, error_type: &str, message: &str) -> Bytes {
        let value = match self {
            Dialect::OpenAI => json!({
                "error": {
                    "type": error_type,
                    "message": message,
                }
            }),
            Dialect::Anthropic => json!({
                "type": "error",
                "error": {
                    "type": error_type,
                    "message": message,
                }
            }),
        };
        Bytes::from(value.to_string())
    }
}

/// Error delivery once the SSE stream has started: both dialects emit the
/// same `event: error` frame.
pub fn sse_error_frame(error_type: &str, message: &str) -> Bytes {
    let data = json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });
    encode_event(Some("error"), data.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn openai_error_shape() {
        let body = Dialect::OpenAI.error_body("rate_limit_error", "slow down");
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "rate_limit_error");
        assert_eq!(value["error"]["message"], "slow down");
        assert!(value.get("type").is_none());
    }

    #[test]
    fn anthropic_error_shape() {
        let body = Dialect::Anthropic.error_body("upstream_error", "bad gateway");
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["type"], "upstream_error");
    }

    #[test]
    fn sse_error_frame_shape() {
        let frame = sse_error_frame("upstream_error", "exhausted");
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: error\ndata: "));
        assert!(text.ends_with("\n\n"));
        let data: Value =
            serde_json::from_str(text.trim_start_matches("event: error\ndata: ").trim()).unwrap();
        assert_eq!(data["error"]["type"], "upstream_error");
    }
}
