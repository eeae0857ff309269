use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use poolgate_protocol::Dialect;

use crate::core::CoreState;
use crate::emit::{ClientEmitter, ResponseDecision};
use crate::gateway::run_request;

pub async fn openai_responses(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    gateway_entry(state, Dialect::OpenAI, headers, body).await
}

pub async fn anthropic_messages(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    gateway_entry(state, Dialect::Anthropic, headers, body).await
}

/// Spawn the pipeline and answer with whatever it decides. The pipeline task
/// outlives this handler for streaming responses; dropping the body receiver
/// on client disconnect is what cancels it.
async fn gateway_entry(
    state: Arc<CoreState>,
    dialect: Dialect,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let (emitter, decision_rx, body_rx) = ClientEmitter::channel(dialect);
    tokio::spawn(run_request(
        state,
        dialect,
        trace_id.clone(),
        headers,
        body,
        emitter,
    ));

    match decision_rx.await {
        Ok(ResponseDecision::Unary {
            status,
            headers,
            body,
        }) => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            resp.headers_mut().extend(headers);
            attach_request_id(&mut resp, &trace_id);
            resp
        }
        Ok(ResponseDecision::Stream { status }) => {
            let stream = ReceiverStream::new(body_rx).map(Ok::<_, Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() = status;
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            resp.headers_mut().insert(
                http::header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache"),
            );
            attach_request_id(&mut resp, &trace_id);
            resp
        }
        Err(_) => {
            // The pipeline died without answering; shape a bare error.
            let body = dialect.error_body("api_error", "Internal gateway error");
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

fn attach_request_id(resp: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert("x-poolgate-request-id", value);
    }
}
