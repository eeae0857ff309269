use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio::time::timeout;
use tracing::warn;

use poolgate_common::ERROR_CAPTURE_HEADER_WHITELIST;
use poolgate_storage::{ErrorRecord, Storage, UsageRecord};

/// The recorder runs on a detached context; a request must never wait on it.
const RECORD_TIMEOUT: Duration = Duration::from_secs(10);

const AUTHORIZATION_KEEP_CHARS: usize = 10;

pub fn spawn_usage_record(storage: Arc<dyn Storage>, record: UsageRecord) {
    tokio::spawn(async move {
        match timeout(RECORD_TIMEOUT, storage.insert_usage(&record)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(
                event = "usage_record_failed",
                request_id = %record.request_id,
                error = %err
            ),
            Err(_) => warn!(
                event = "usage_record_failed",
                request_id = %record.request_id,
                error = "timeout"
            ),
        }
    });
}

pub fn spawn_error_record(storage: Arc<dyn Storage>, record: ErrorRecord) {
    tokio::spawn(async move {
        match timeout(RECORD_TIMEOUT, storage.insert_error(&record)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(
                event = "error_record_failed",
                request_id = %record.request_id,
                error = %err
            ),
            Err(_) => warn!(
                event = "error_record_failed",
                request_id = %record.request_id,
                error = "timeout"
            ),
        }
    });
}

/// Whitelisted snapshot of request headers as JSON, with the Authorization
/// value cut down to its first characters so logs never hold a usable key.
pub fn capture_request_headers(headers: &HeaderMap) -> String {
    let mut map = serde_json::Map::new();
    for name in ERROR_CAPTURE_HEADER_WHITELIST {
        let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let value = if name.eq_ignore_ascii_case("authorization") {
            truncate_secret(value)
        } else {
            value.to_string()
        };
        map.insert(name.to_string(), serde_json::Value::String(value));
    }
    serde_json::Value::Object(map).to_string()
}

fn truncate_secret(value: &str) -> String {
    if value.chars().count() <= AUTHORIZATION_KEEP_CHARS {
        return value.to_string();
    }
    let mut out: String = value.chars().take(AUTHORIZATION_KEEP_CHARS).collect();
    out.push('…');
    out
}

/// Best-effort client address for the log row.
pub fn client_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
