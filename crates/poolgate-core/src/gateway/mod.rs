use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use poolgate_protocol::Dialect;
use poolgate_storage::{ErrorRecord, Storage, UsageRecord};

use crate::auth::AuthSubject;
use crate::billing::{check_eligibility, effective_transfer, should_transfer};
use crate::concurrency::{calculate_max_wait, Scope, SlotController};
use crate::core::CoreState;
use crate::emit::ClientEmitter;
use crate::errors::{map_upstream_error, ErrorKind};
use crate::forward::{forward, ForwardError, ForwardOutcome};
use crate::preflight;
use crate::recorder::{
    capture_request_headers, client_ip_from_headers, spawn_error_record, spawn_usage_record,
};
use crate::select::{select_account, Admission, SelectError};
use crate::sticky::derive_session_hash;

/// Decrements a wait counter exactly once: explicitly after the slot is
/// granted, or on drop for every early-return path.
struct WaitGuard<'a> {
    slots: &'a SlotController,
    scope: Scope,
    armed: bool,
}

impl<'a> WaitGuard<'a> {
    fn new(slots: &'a SlotController, scope: Scope) -> Self {
        Self {
            slots,
            scope,
            armed: true,
        }
    }

    fn release(&mut self) {
        if self.armed {
            self.armed = false;
            self.slots.decrement_wait(self.scope);
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Request context for error logging. Fields fill in as the pipeline learns
/// them; each `record` call ships a complete error row off the request path.
struct ErrorReporter {
    storage: Arc<dyn Storage>,
    dialect: Dialect,
    request_id: String,
    started_at: Instant,
    subject: AuthSubject,
    request_headers_json: String,
    user_agent: Option<String>,
    client_ip: Option<String>,
    model: Option<String>,
    stream: bool,
    account_id: Option<i64>,
}

impl ErrorReporter {
    fn new(
        storage: Arc<dyn Storage>,
        dialect: Dialect,
        subject: AuthSubject,
        headers: &HeaderMap,
    ) -> Self {
        Self {
            storage,
            dialect,
            request_id: format!("err-{}", Uuid::new_v4()),
            started_at: Instant::now(),
            subject,
            request_headers_json: capture_request_headers(headers),
            user_agent: headers
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
            client_ip: client_ip_from_headers(headers),
            model: None,
            stream: false,
            account_id: None,
        }
    }

    fn record(
        &self,
        kind: ErrorKind,
        status: StatusCode,
        message: &str,
        upstream_status: Option<u16>,
        upstream_message: Option<String>,
        sse_errors: &[String],
    ) {
        let error_body = self.dialect.error_body(kind.as_str(), message);
        let record = ErrorRecord {
            request_id: self.request_id.clone(),
            user_id: self.subject.user_id,
            api_key_id: self.subject.key_id,
            group_id: Some(self.subject.group_id),
            account_id: self.account_id,
            model: self.model.clone(),
            stream: self.stream,
            user_agent: self.user_agent.clone(),
            client_ip: self.client_ip.clone(),
            duration_ms: self.started_at.elapsed().as_millis() as i64,
            error_type: kind.as_str().to_string(),
            status_code: status.as_u16() as i32,
            error_message: message.to_string(),
            error_body: String::from_utf8_lossy(&error_body).to_string(),
            request_headers_json: self.request_headers_json.clone(),
            upstream_status_code: upstream_status.map(|s| s as i32),
            upstream_error_message: upstream_message,
            sse_errors_json: if sse_errors.is_empty() {
                None
            } else {
                serde_json::to_string(sse_errors).ok()
            },
        };
        spawn_error_record(self.storage.clone(), record);
    }
}

/// Drive one gateway request end to end: preflight, user admission, billing
/// re-check, then the select/forward failover loop. Runs detached from the
/// axum handler; all client output goes through the emitter.
pub async fn run_request(
    state: Arc<CoreState>,
    dialect: Dialect,
    trace_id: String,
    headers: HeaderMap,
    body: Bytes,
    mut emitter: ClientEmitter,
) {
    let config = state.config.load_full();

    let subject = match state.auth.authenticate(&headers) {
        Ok(subject) => subject,
        Err(err) => {
            emitter
                .respond_error(err.status, err.error_type, err.message)
                .await;
            return;
        }
    };

    let mut reporter =
        ErrorReporter::new(state.storage.clone(), dialect, subject.clone(), &headers);

    let pf = match preflight::run(dialect, &headers, body, &config) {
        Ok(pf) => pf,
        Err(err) => {
            reporter.record(
                ErrorKind::InvalidRequest,
                err.status,
                &err.message,
                None,
                None,
                &[],
            );
            emitter
                .respond_error(err.status, err.error_type, &err.message)
                .await;
            return;
        }
    };
    emitter.set_stream_capable(pf.stream);
    reporter.model = Some(pf.model.clone());
    reporter.stream = pf.stream;

    info!(
        event = "request_received",
        trace_id = %trace_id,
        user_id = subject.user_id,
        model = %pf.model,
        is_stream = pf.stream
    );

    let wait_timeout = Duration::from_secs(config.slot_wait_timeout_secs);
    let ping_interval =
        (config.ping_interval_secs > 0).then(|| Duration::from_secs(config.ping_interval_secs));

    // Wait-queue gate, then the user slot.
    let user_scope = Scope::User(subject.user_id);
    let max_wait = calculate_max_wait(subject.concurrency);
    if !state.slots.increment_wait(user_scope, max_wait) {
        let message = "Too many pending requests, please retry later";
        reporter.record(
            ErrorKind::ConcurrencyLimit,
            StatusCode::TOO_MANY_REQUESTS,
            message,
            None,
            None,
            &[],
        );
        emitter
            .respond_error(StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", message)
            .await;
        return;
    }
    let mut user_wait_guard = WaitGuard::new(&state.slots, user_scope);

    let user_permit = match state
        .slots
        .acquire_with_wait(
            user_scope,
            subject.concurrency.max(0) as u32,
            wait_timeout,
            ping_interval,
            &mut emitter,
        )
        .await
    {
        Ok(permit) => permit,
        Err(err) => {
            debug!(event = "user_slot_rejected", trace_id = %trace_id, error = %err);
            let message = "Concurrency limit exceeded for user, please retry later";
            reporter.record(
                ErrorKind::ConcurrencyLimit,
                StatusCode::TOO_MANY_REQUESTS,
                message,
                None,
                None,
                &[],
            );
            emitter
                .respond_error(StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", message)
                .await;
            return;
        }
    };
    user_wait_guard.release();

    // Balance may have drained while the request queued.
    if let Err(err) = check_eligibility(&subject, OffsetDateTime::now_utc()) {
        let message = err.to_string();
        reporter.record(
            ErrorKind::BillingError,
            err.status(),
            &message,
            None,
            None,
            &[],
        );
        emitter
            .respond_error(err.status(), "billing_error", &message)
            .await;
        return;
    }

    let session_hash = derive_session_hash(&headers, &pf.value);

    // One probability draw per request so every attempt and both usage call
    // sites agree on whether the transfer happened.
    let transfer_ratio = state.registry.group(subject.group_id).and_then(|group| {
        let transfer = effective_transfer(&group, &subject);
        should_transfer(transfer.probability).then_some(transfer.ratio)
    });

    let max_switches = config.max_account_switches;
    let mut switch_count = 0u32;
    let mut failed: HashSet<i64> = HashSet::new();
    let mut last_failover_status: Option<u16> = None;

    loop {
        let selection = match select_account(
            &state.registry,
            &state.slots,
            &state.sticky,
            subject.group_id,
            &session_hash,
            &pf.model,
            &failed,
        ) {
            Ok(selection) => selection,
            Err(SelectError::NoAccount) => {
                if failed.is_empty() {
                    let message = "No available accounts for the requested model";
                    reporter.record(
                        ErrorKind::NoAccount,
                        StatusCode::SERVICE_UNAVAILABLE,
                        message,
                        None,
                        None,
                        &[],
                    );
                    emitter
                        .respond_error(StatusCode::SERVICE_UNAVAILABLE, "api_error", message)
                        .await;
                } else {
                    let (status, client_type, message) = map_upstream_error(last_failover_status);
                    reporter.record(
                        ErrorKind::UpstreamError,
                        status,
                        message,
                        last_failover_status,
                        None,
                        &[],
                    );
                    emitter.respond_error(status, client_type, message).await;
                }
                return;
            }
        };
        let account = selection.account.clone();
        reporter.account_id = Some(account.id);

        let account_permit = match selection.admission {
            Admission::Acquired(permit) => permit,
            Admission::Wait(plan) => {
                let account_scope = Scope::Account(account.id);
                if !state.slots.increment_wait(account_scope, plan.max_waiting) {
                    let message = "Too many pending requests, please retry later";
                    reporter.record(
                        ErrorKind::ConcurrencyLimit,
                        StatusCode::TOO_MANY_REQUESTS,
                        message,
                        None,
                        None,
                        &[],
                    );
                    emitter
                        .respond_error(StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", message)
                        .await;
                    return;
                }
                let mut account_wait_guard = WaitGuard::new(&state.slots, account_scope);
                let permit = match state
                    .slots
                    .acquire_with_wait(
                        account_scope,
                        plan.max_active,
                        wait_timeout,
                        ping_interval,
                        &mut emitter,
                    )
                    .await
                {
                    Ok(permit) => permit,
                    Err(err) => {
                        debug!(
                            event = "account_slot_rejected",
                            trace_id = %trace_id,
                            account_id = account.id,
                            error = %err
                        );
                        let message = "Concurrency limit exceeded for account, please retry later";
                        reporter.record(
                            ErrorKind::ConcurrencyLimit,
                            StatusCode::TOO_MANY_REQUESTS,
                            message,
                            None,
                            None,
                            &[],
                        );
                        emitter
                            .respond_error(
                                StatusCode::TOO_MANY_REQUESTS,
                                "rate_limit_error",
                                message,
                            )
                            .await;
                        return;
                    }
                };
                account_wait_guard.release();
                // Best-effort: a failed binding only costs session affinity.
                state
                    .sticky
                    .bind(subject.group_id, &session_hash, account.id);
                permit
            }
        };

        let outcome = forward(
            state.upstream.as_ref(),
            &account,
            dialect,
            &headers,
            pf.body.clone(),
            pf.stream,
            transfer_ratio,
            &mut emitter,
        )
        .await;
        drop(account_permit);

        match outcome {
            Ok(ForwardOutcome::Failover { status }) => {
                failed.insert(account.id);
                last_failover_status = status;
                if switch_count >= max_switches {
                    let (mapped, client_type, message) = map_upstream_error(status);
                    reporter.record(
                        ErrorKind::UpstreamError,
                        mapped,
                        message,
                        status,
                        None,
                        &[],
                    );
                    emitter.respond_error(mapped, client_type, message).await;
                    return;
                }
                switch_count += 1;
                warn!(
                    event = "account_failover",
                    trace_id = %trace_id,
                    account_id = account.id,
                    upstream_status = ?status,
                    switch = switch_count,
                    max_switches = max_switches
                );
                continue;
            }
            Ok(ForwardOutcome::ClientError { status }) => {
                reporter.record(
                    ErrorKind::UpstreamError,
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
                    "Upstream rejected the request",
                    Some(status),
                    None,
                    &[],
                );
                info!(
                    event = "request_completed",
                    trace_id = %trace_id,
                    account_id = account.id,
                    status = status,
                    terminal_client_error = true
                );
                return;
            }
            Ok(ForwardOutcome::Success(result)) => {
                if !result.sse_errors.is_empty() {
                    debug!(
                        event = "stream_errors_observed",
                        trace_id = %trace_id,
                        count = result.sse_errors.len()
                    );
                }
                let record = UsageRecord {
                    request_id: trace_id.clone(),
                    user_id: subject.user_id,
                    api_key_id: subject.key_id,
                    group_id: subject.group_id,
                    account_id: account.id,
                    model: result.model.clone().unwrap_or_else(|| pf.model.clone()),
                    stream: result.stream,
                    user_agent: reporter.user_agent.clone(),
                    client_ip: reporter.client_ip.clone(),
                    duration_ms: result.duration_ms,
                    input_tokens: result.usage.input,
                    output_tokens: result.usage.output,
                    cache_creation_input_tokens: result.usage.cache_creation,
                    cache_read_input_tokens: result.usage.cache_read,
                    upstream_request_id: result.upstream_request_id.clone(),
                };
                spawn_usage_record(state.storage.clone(), record);
                info!(
                    event = "request_completed",
                    trace_id = %trace_id,
                    account_id = account.id,
                    status = result.status,
                    elapsed_ms = result.duration_ms,
                    is_stream = result.stream
                );
                drop(user_permit);
                return;
            }
            Err(ForwardError::Transport(message)) => {
                reporter.record(
                    ErrorKind::ForwardError,
                    StatusCode::BAD_GATEWAY,
                    "Upstream request failed",
                    None,
                    Some(message.clone()),
                    &[],
                );
                warn!(
                    event = "forward_failed",
                    trace_id = %trace_id,
                    account_id = account.id,
                    error = %message
                );
                emitter
                    .respond_error(
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        "Upstream request failed",
                    )
                    .await;
                return;
            }
            Err(ForwardError::Cancelled) => {
                reporter.record(
                    ErrorKind::ForwardError,
                    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
                    "Client disconnected before the response completed",
                    None,
                    None,
                    &[],
                );
                info!(event = "client_disconnected", trace_id = %trace_id);
                return;
            }
        }
    }
}
