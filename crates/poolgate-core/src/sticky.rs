use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use http::HeaderMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

const SESSION_HEADER: &str = "x-session-id";
const SWEEP_THRESHOLD: usize = 4096;

/// Fingerprint used to route a caller's sequential requests to the same
/// account: a dedicated header when present, else the body's
/// `prompt_cache_key`, else empty (no binding).
pub fn derive_session_hash(headers: &HeaderMap, body: &Map<String, Value>) -> String {
    if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return hex_digest(value);
        }
    }
    if let Some(key) = body.get("prompt_cache_key").and_then(Value::as_str) {
        let key = key.trim();
        if !key.is_empty() {
            return hex_digest(key);
        }
    }
    String::new()
}

fn hex_digest(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// In-memory `(group, session_hash) -> account` bindings with lazy TTL
/// expiry. A multi-node deployment would swap this for a shared store; the
/// selector contract does not change.
pub struct StickyStore {
    ttl: Duration,
    bindings: Mutex<HashMap<(i64, String), (i64, Instant)>>,
}

impl StickyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, group_id: i64, session_hash: &str) -> Option<i64> {
        if session_hash.is_empty() {
            return None;
        }
        let mut bindings = self.bindings.lock().expect("sticky map poisoned");
        let key = (group_id, session_hash.to_string());
        match bindings.get(&key) {
            Some((account_id, bound_at)) if bound_at.elapsed() < self.ttl => Some(*account_id),
            Some(_) => {
                bindings.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn bind(&self, group_id: i64, session_hash: &str, account_id: i64) {
        if session_hash.is_empty() {
            return;
        }
        let mut bindings = self.bindings.lock().expect("sticky map poisoned");
        if bindings.len() >= SWEEP_THRESHOLD {
            let ttl = self.ttl;
            bindings.retain(|_, (_, bound_at)| bound_at.elapsed() < ttl);
        }
        bindings.insert(
            (group_id, session_hash.to_string()),
            (account_id, Instant::now()),
        );
    }
}
