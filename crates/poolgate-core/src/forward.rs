use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;

use poolgate_protocol::sse::{encode_event, SseFrame, SseFrameScanner};
use poolgate_protocol::usage::{
    apply_cache_rewrite, tuple_from_usage, update_tuple_from_usage, usage_object,
    usage_object_mut, UsageTuple,
};
use poolgate_protocol::Dialect;

use crate::billing::transfer_cache_tokens;
use crate::emit::ClientEmitter;
use crate::errors::is_failover_status;
use crate::registry::Account;
use crate::upstream_client::{UpstreamBody, UpstreamClient, UpstreamRequest};

const ANTHROPIC_VERSION_DEFAULT: &str = "2023-06-01";

/// Headers copied from the inbound request onto the upstream call. Auth is
/// always replaced by the account credential, never forwarded.
const FORWARDABLE_HEADERS: &[&str] = &[
    "accept",
    "anthropic-beta",
    "anthropic-version",
    "openai-beta",
    "user-agent",
    "x-request-id",
];

/// What one upstream attempt produced, captured consistently for the
/// response already sent to the client and for the usage recorder.
#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub status: u16,
    pub model: Option<String>,
    pub upstream_request_id: Option<String>,
    /// Post-transfer usage; identical to what the response body carries.
    pub usage: UsageTuple,
    pub duration_ms: i64,
    pub stream: bool,
    pub sse_errors: Vec<String>,
}

#[derive(Debug)]
pub enum ForwardOutcome {
    Success(ForwardResult),
    /// Transient upstream failure; the caller marks the account failed and
    /// retries elsewhere. `None` means the connection itself failed.
    Failover { status: Option<u16> },
    /// Terminal client error already delivered verbatim.
    ClientError { status: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream transport failed mid-response: {0}")]
    Transport(String),
    #[error("client disconnected")]
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
pub async fn forward(
    client: &dyn UpstreamClient,
    account: &Account,
    dialect: Dialect,
    client_headers: &HeaderMap,
    body: Bytes,
    want_stream: bool,
    transfer_ratio: Option<f64>,
    emitter: &mut ClientEmitter,
) -> Result<ForwardOutcome, ForwardError> {
    let started_at = Instant::now();
    let url = format!(
        "{}{}",
        account.base_url.trim_end_matches('/'),
        dialect.upstream_path()
    );

    let request = UpstreamRequest {
        url,
        headers: build_upstream_headers(dialect, client_headers, account),
        body,
        want_stream,
    };

    let response = match client.send(request).await {
        Ok(response) => response,
        // Nothing reached the client yet; this account can be retried
        // elsewhere.
        Err(_err) => return Ok(ForwardOutcome::Failover { status: None }),
    };

    let status = response.status;
    if is_failover_status(status) {
        return Ok(ForwardOutcome::Failover {
            status: Some(status),
        });
    }

    let upstream_request_id = response
        .header("x-request-id")
        .or_else(|| response.header("request-id"))
        .map(|v| v.to_string());

    if !(200..300).contains(&status) {
        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };
        deliver_client_error(emitter, status, &response.headers, body).await;
        return Ok(ForwardOutcome::ClientError { status });
    }

    match response.body {
        UpstreamBody::Bytes(bytes) => {
            let result = finish_unary(
                emitter,
                status,
                &response.headers,
                bytes,
                transfer_ratio,
                upstream_request_id,
                started_at,
            );
            Ok(ForwardOutcome::Success(result))
        }
        UpstreamBody::Stream(rx) => {
            relay_stream(
                emitter,
                rx,
                status,
                transfer_ratio,
                upstream_request_id,
                started_at,
            )
            .await
        }
    }
}

fn build_upstream_headers(
    dialect: Dialect,
    client_headers: &HeaderMap,
    account: &Account,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = vec![(
        "content-type".to_string(),
        "application/json".to_string(),
    )];
    for name in FORWARDABLE_HEADERS {
        if let Some(value) = client_headers.get(*name).and_then(|v| v.to_str().ok()) {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    match dialect {
        Dialect::OpenAI => {
            headers.push((
                "authorization".to_string(),
                format!("Bearer {}", account.credential),
            ));
        }
        Dialect::Anthropic => {
            headers.push(("x-api-key".to_string(), account.credential.clone()));
            if !headers
                .iter()
                .any(|(name, _)| name == "anthropic-version")
            {
                headers.push((
                    "anthropic-version".to_string(),
                    ANTHROPIC_VERSION_DEFAULT.to_string(),
                ));
            }
        }
    }
    headers
}

async fn deliver_client_error(
    emitter: &mut ClientEmitter,
    status: u16,
    upstream_headers: &[(String, String)],
    body: Bytes,
) {
    if emitter.stream_started() {
        // The upstream body cannot be relayed verbatim once SSE framing is
        // on the wire; deliver its text through the error event shape.
        let message = String::from_utf8_lossy(&body);
        let message = message.trim();
        let message = if message.is_empty() {
            "Upstream rejected the request"
        } else {
            message
        };
        emitter
            .respond_error(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
                "invalid_request_error",
                message,
            )
            .await;
        return;
    }

    let mut headers = HeaderMap::new();
    let content_type = upstream_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.as_str())
        .unwrap_or("application/json");
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(http::header::CONTENT_TYPE, value);
    }
    emitter.respond_unary(
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
        headers,
        body,
    );
}

fn finish_unary(
    emitter: &mut ClientEmitter,
    status: u16,
    upstream_headers: &[(String, String)],
    body: Bytes,
    transfer_ratio: Option<f64>,
    upstream_request_id: Option<String>,
    started_at: Instant,
) -> ForwardResult {
    let mut model = None;
    let mut usage = UsageTuple::default();
    let mut out_body = body;

    if let Ok(mut value) = serde_json::from_slice::<Value>(&out_body) {
        model = reported_model(&value);
        if let Some(usage_map) = usage_object(&value) {
            usage = tuple_from_usage(usage_map);
        }
        if let Some(ratio) = transfer_ratio {
            let (cache_creation, cache_read) =
                transfer_cache_tokens(usage.cache_creation, usage.cache_read, ratio);
            if let Some(usage_map) = usage_object_mut(&mut value) {
                apply_cache_rewrite(usage_map, cache_creation, cache_read);
                out_body = Bytes::from(value.to_string());
            }
            usage.cache_creation = cache_creation;
            usage.cache_read = cache_read;
        }
    }

    let mut headers = HeaderMap::new();
    let content_type = upstream_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.as_str())
        .unwrap_or("application/json");
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(http::header::CONTENT_TYPE, value);
    }
    if let Some(id) = upstream_request_id.as_deref() {
        if let Ok(value) = HeaderValue::from_str(id) {
            headers.insert("x-request-id", value);
        }
    }
    emitter.respond_unary(
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        headers,
        out_body,
    );

    ForwardResult {
        status,
        model,
        upstream_request_id,
        usage,
        duration_ms: started_at.elapsed().as_millis() as i64,
        stream: false,
        sse_errors: Vec::new(),
    }
}

async fn relay_stream(
    emitter: &mut ClientEmitter,
    mut rx: tokio::sync::mpsc::Receiver<Result<Bytes, String>>,
    status: u16,
    transfer_ratio: Option<f64>,
    upstream_request_id: Option<String>,
    started_at: Instant,
) -> Result<ForwardOutcome, ForwardError> {
    let mut scanner = SseFrameScanner::new();
    let mut accumulated = UsageTuple::default();
    let mut sse_errors: Vec<String> = Vec::new();
    let mut model: Option<String> = None;
    let mut forwarded_any = false;

    while let Some(item) = rx.recv().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(message) => {
                if !forwarded_any && !emitter.stream_started() {
                    // Connection died before the client saw anything; the
                    // account is still eligible for failover.
                    return Ok(ForwardOutcome::Failover { status: None });
                }
                return Err(ForwardError::Transport(message));
            }
        };
        for frame in scanner.push(&chunk) {
            relay_frame(
                emitter,
                frame,
                transfer_ratio,
                &mut accumulated,
                &mut sse_errors,
                &mut model,
            )
            .await
            .map_err(|_| ForwardError::Cancelled)?;
            forwarded_any = true;
        }
    }
    if let Some(frame) = scanner.finish() {
        relay_frame(
            emitter,
            frame,
            transfer_ratio,
            &mut accumulated,
            &mut sse_errors,
            &mut model,
        )
        .await
        .map_err(|_| ForwardError::Cancelled)?;
    }

    let usage = match transfer_ratio {
        Some(ratio) => {
            let (cache_creation, cache_read) =
                transfer_cache_tokens(accumulated.cache_creation, accumulated.cache_read, ratio);
            UsageTuple {
                cache_creation,
                cache_read,
                ..accumulated
            }
        }
        None => accumulated,
    };

    Ok(ForwardOutcome::Success(ForwardResult {
        status,
        model,
        upstream_request_id,
        usage,
        duration_ms: started_at.elapsed().as_millis() as i64,
        stream: true,
        sse_errors,
    }))
}

/// Forward one frame. Usage-bearing events with cache counters get the same
/// rewrite as the unary path; everything else is relayed byte-for-byte.
async fn relay_frame(
    emitter: &mut ClientEmitter,
    frame: SseFrame,
    transfer_ratio: Option<f64>,
    accumulated: &mut UsageTuple,
    sse_errors: &mut Vec<String>,
    model: &mut Option<String>,
) -> Result<(), crate::emit::ClientGone> {
    let parsed: Option<Value> = if frame.data.is_empty() {
        None
    } else {
        serde_json::from_str(&frame.data).ok()
    };

    let Some(mut value) = parsed else {
        return emitter.send(frame.raw).await;
    };

    if is_error_event(&frame, &value) {
        sse_errors.push(frame.data.clone());
        return emitter.send(frame.raw).await;
    }

    if model.is_none() {
        *model = reported_model(&value);
    }

    let Some(usage_map) = usage_object(&value) else {
        return emitter.send(frame.raw).await;
    };
    update_tuple_from_usage(usage_map, accumulated);

    let carries_cache_counters = usage_map.contains_key("cache_creation_input_tokens")
        || usage_map.contains_key("cache_read_input_tokens")
        || usage_map.contains_key("input_tokens_details");
    let Some(ratio) = transfer_ratio.filter(|_| carries_cache_counters) else {
        return emitter.send(frame.raw).await;
    };

    let event_usage = tuple_from_usage(usage_map);
    let (cache_creation, cache_read) =
        transfer_cache_tokens(event_usage.cache_creation, event_usage.cache_read, ratio);
    if let Some(usage_map) = usage_object_mut(&mut value) {
        apply_cache_rewrite(usage_map, cache_creation, cache_read);
    }
    emitter
        .send(encode_event(
            frame.event.as_deref(),
            value.to_string().as_bytes(),
        ))
        .await
}

fn is_error_event(frame: &SseFrame, value: &Value) -> bool {
    frame.event.as_deref() == Some("error")
        || value.get("type").and_then(Value::as_str) == Some("error")
}

fn reported_model(value: &Value) -> Option<String> {
    value
        .get("model")
        .or_else(|| value.get("message").and_then(|m| m.get("model")))
        .or_else(|| value.get("response").and_then(|r| r.get("model")))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: 1,
            name: "acct".to_string(),
            group_id: 1,
            base_url: "https://api.upstream.example/".to_string(),
            credential: "sk-upstream".to_string(),
            enabled: true,
            healthy: true,
            max_concurrency: 4,
            supported_models: Vec::new(),
        }
    }

    #[test]
    fn anthropic_headers_replace_auth() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert("authorization", HeaderValue::from_static("Bearer sk-user"));
        client_headers.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        let headers = build_upstream_headers(Dialect::Anthropic, &client_headers, &account());
        assert!(headers
            .iter()
            .any(|(k, v)| k == "x-api-key" && v == "sk-upstream"));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "anthropic-version" && v == ANTHROPIC_VERSION_DEFAULT));
        assert!(headers.iter().any(|(k, _)| k == "anthropic-beta"));
        assert!(!headers.iter().any(|(k, _)| k == "authorization"));
    }

    #[test]
    fn openai_headers_use_account_bearer() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert("authorization", HeaderValue::from_static("Bearer sk-user"));
        let headers = build_upstream_headers(Dialect::OpenAI, &client_headers, &account());
        assert!(headers
            .iter()
            .any(|(k, v)| k == "authorization" && v == "Bearer sk-upstream"));
    }

    #[test]
    fn model_is_read_from_any_dialect_shape() {
        assert_eq!(
            reported_model(&serde_json::json!({"model": "m1"})).as_deref(),
            Some("m1")
        );
        assert_eq!(
            reported_model(&serde_json::json!({"message": {"model": "m2"}})).as_deref(),
            Some("m2")
        );
        assert_eq!(
            reported_model(&serde_json::json!({"response": {"model": "m3"}})).as_deref(),
            Some("m3")
        );
        assert!(reported_model(&serde_json::json!({"id": "x"})).is_none());
    }
}
