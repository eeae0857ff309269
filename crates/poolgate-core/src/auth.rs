use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::{HeaderMap, StatusCode};
use time::OffsetDateTime;

use poolgate_storage::StorageSnapshot;

/// Everything the admission pipeline needs to know about the caller once the
/// API key resolved.
#[derive(Debug, Clone)]
pub struct AuthSubject {
    pub user_id: i64,
    pub key_id: i64,
    pub group_id: i64,
    pub concurrency: i32,
    pub balance_cents: i64,
    pub cache_read_transfer_ratio: Option<f64>,
    pub cache_read_transfer_probability: Option<f64>,
    pub subscription_expires_at: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub struct AuthError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub message: &'static str,
}

impl AuthError {
    fn new(status: StatusCode, error_type: &'static str, message: &'static str) -> Self {
        Self {
            status,
            error_type,
            message,
        }
    }
}

pub trait AuthProvider: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthSubject, AuthError>;
}

#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub subjects_by_key: HashMap<String, AuthSubject>,
}

impl AuthSnapshot {
    pub fn from_storage(snapshot: &StorageSnapshot) -> Self {
        let users: HashMap<i64, _> = snapshot.users.iter().map(|u| (u.id, u)).collect();
        let mut subjects_by_key = HashMap::new();
        for key in &snapshot.api_keys {
            if !key.enabled {
                continue;
            }
            let Some(user) = users.get(&key.user_id) else {
                continue;
            };
            if !user.enabled {
                continue;
            }
            subjects_by_key.insert(
                key.key_value.clone(),
                AuthSubject {
                    user_id: user.id,
                    key_id: key.id,
                    group_id: key.group_id,
                    concurrency: user.concurrency,
                    balance_cents: user.balance_cents,
                    cache_read_transfer_ratio: user.cache_read_transfer_ratio,
                    cache_read_transfer_probability: user.cache_read_transfer_probability,
                    subscription_expires_at: user.subscription_expires_at,
                },
            );
        }
        Self { subjects_by_key }
    }
}

/// ArcSwap-backed key lookup; admin mutations replace the whole snapshot.
#[derive(Debug)]
pub struct MemoryAuth {
    snapshot: ArcSwap<AuthSnapshot>,
}

impl MemoryAuth {
    pub fn new(snapshot: AuthSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: AuthSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl AuthProvider for MemoryAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthSubject, AuthError> {
        let api_key = extract_api_key(headers).ok_or_else(|| {
            AuthError::new(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "Invalid API key",
            )
        })?;

        let snapshot = self.snapshot.load();
        snapshot
            .subjects_by_key
            .get(api_key.as_str())
            .cloned()
            .ok_or_else(|| {
                AuthError::new(
                    StatusCode::UNAUTHORIZED,
                    "authentication_error",
                    "Invalid API key",
                )
            })
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.trim().to_string());
    }
    if let Some(token) = auth.strip_prefix("bearer ") {
        return Some(token.trim().to_string());
    }
    None
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
