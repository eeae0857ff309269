use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};

use poolgate_protocol::dialect::{sse_error_frame, Dialect};

const SSE_PING_FRAME: &[u8] = b": ping\n\n";

/// How the handler should answer the HTTP exchange. `Unary` carries a
/// complete buffered response; `Stream` tells the handler to hang the body
/// channel off the response and let the pipeline keep writing.
#[derive(Debug)]
pub enum ResponseDecision {
    Unary {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream { status: StatusCode },
}

/// Write side of one client exchange, owned by the request pipeline.
///
/// The response decision is a oneshot back to the axum handler; body bytes go
/// through an mpsc that becomes the streaming body. Client disconnect is
/// observed as the body channel closing, which doubles as the request's
/// cancellation signal for slot waits and the upstream relay.
pub struct ClientEmitter {
    dialect: Dialect,
    stream_capable: bool,
    started: bool,
    decision: Option<oneshot::Sender<ResponseDecision>>,
    body: mpsc::Sender<Bytes>,
}

impl ClientEmitter {
    pub fn channel(
        dialect: Dialect,
    ) -> (
        Self,
        oneshot::Receiver<ResponseDecision>,
        mpsc::Receiver<Bytes>,
    ) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(16);
        (
            Self {
                dialect,
                stream_capable: false,
                started: false,
                decision: Some(decision_tx),
                body: body_tx,
            },
            decision_rx,
            body_rx,
        )
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Set once preflight has parsed the `stream` flag. Heartbeats are only
    /// legal on stream-capable exchanges.
    pub fn set_stream_capable(&mut self, capable: bool) {
        self.stream_capable = capable;
    }

    pub fn stream_started(&self) -> bool {
        self.started
    }

    /// Resolves when the client goes away.
    pub async fn cancelled(&self) {
        self.body.closed().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.body.is_closed()
    }

    /// Detached handle onto the same disconnect signal, for code that must
    /// watch for cancellation while the emitter itself is borrowed mutably.
    pub fn cancellation(&self) -> CancelSignal {
        CancelSignal {
            body: self.body.clone(),
        }
    }

    fn begin_stream(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(ResponseDecision::Stream {
                status: StatusCode::OK,
            });
        }
    }

    /// Keep a waiting long-poll client alive. Opens the stream on first use.
    /// Returns false when the heartbeat could not be delivered.
    pub async fn ping(&mut self) -> bool {
        if !self.stream_capable {
            return true;
        }
        self.begin_stream();
        self.body
            .send(Bytes::from_static(SSE_PING_FRAME))
            .await
            .is_ok()
    }

    /// Forward one chunk of response body, opening the stream if needed.
    pub async fn send(&mut self, chunk: Bytes) -> Result<(), ClientGone> {
        self.begin_stream();
        self.body.send(chunk).await.map_err(|_| ClientGone)
    }

    /// Answer with a complete buffered response. No-op once streaming began.
    pub fn respond_unary(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(ResponseDecision::Unary {
                status,
                headers,
                body,
            });
        }
    }

    /// Streaming-aware error delivery: a dialect JSON body before the stream
    /// starts, an `event: error` frame (then close) afterwards.
    pub async fn respond_error(&mut self, status: StatusCode, error_type: &str, message: &str) {
        if self.started {
            let _ = self.body.send(sse_error_frame(error_type, message)).await;
            return;
        }
        let body = self.dialect.error_body(error_type, message);
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        self.respond_unary(status, headers, body);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("client disconnected")]
pub struct ClientGone;

/// Clonable view of the client-disconnect signal. Holding clones of the body
/// sender does not keep the exchange alive; the signal fires when the
/// receiving side (the HTTP response body) is dropped.
#[derive(Clone)]
pub struct CancelSignal {
    body: mpsc::Sender<Bytes>,
}

impl CancelSignal {
    pub async fn cancelled(&self) {
        self.body.closed().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.body.is_closed()
    }
}
