//! Per-connection lifecycle.
//!
//! Each accepted transport is owned by exactly one lifecycle task running
//! `Connecting → (secure wrap) → Handshaking → Open → Closing → Closed`.
//! The task exclusively owns the read half; the write half sits behind a
//! mutex so send operations (including broadcasts from unrelated tasks)
//! are safe to issue without racing the owner's reads.

use crate::error::WsError;
use crate::frame;
use crate::handler::{RouteHandler, RouteTable};
use crate::handshake;
use crate::security::{SecureTransport, SecureTransportError};
use crate::types::{CloseEvent, ConnectionId, ConnectionState, Frame, OpCode, Transport};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Pause before retrying after a dropped (invalid) frame, so a misbehaving
/// peer cannot spin the receive loop.
const INVALID_FRAME_PAUSE: Duration = Duration::from_millis(20);

/// One live client connection.
pub struct Connection {
    pub id: ConnectionId,
    client_identifier: RwLock<String>,
    metadata: RwLock<HashMap<String, String>>,
    request: RwLock<Option<handshake::HandshakeRequest>>,
    state: tokio::sync::RwLock<ConnectionState>,
    writer: Mutex<Option<WriteHalf<Transport>>>,
    dead: AtomicBool,
    stop_requested: AtomicBool,
}

impl Connection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            client_identifier: RwLock::new(String::new()),
            metadata: RwLock::new(HashMap::new()),
            request: RwLock::new(None),
            state: tokio::sync::RwLock::new(ConnectionState::Connecting),
            writer: Mutex::new(None),
            dead: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        })
    }

    /// Liveness predicate: not torn down and no external stop requested.
    /// The transport itself is not probed: a silently vanished peer keeps
    /// reporting alive until the lifecycle task's next read fails and
    /// marks the connection dead, so liveness can lag the wire by one
    /// read cycle.
    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && !self.stop_requested.load(Ordering::SeqCst)
    }

    /// Requests a cooperative stop; the receive loop observes it on its
    /// next cycle. There is no hard preemption.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Application-assigned identifier, empty until the handler sets one.
    pub fn client_identifier(&self) -> String {
        self.client_identifier.read().unwrap().clone()
    }

    pub fn set_client_identifier(&self, identifier: impl Into<String>) {
        *self.client_identifier.write().unwrap() = identifier.into();
    }

    /// `<client identifier>/<connection id>`, unique per connection even
    /// when several connections share a client identifier.
    pub fn unique_client_identifier(&self) -> String {
        format!("{}/{}", self.client_identifier(), self.id)
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.read().unwrap().get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().unwrap().insert(key.into(), value.into());
    }

    /// Parsed upgrade request, available once the handshake completed.
    pub fn handshake_request(&self) -> Option<handshake::HandshakeRequest> {
        self.request.read().unwrap().clone()
    }

    /// Route this connection upgraded on, empty before the handshake.
    pub fn route(&self) -> String {
        self.request
            .read()
            .unwrap()
            .as_ref()
            .map(|r| r.route.clone())
            .unwrap_or_default()
    }

    // --- send operations ---------------------------------------------------
    //
    // Best-effort by design: each is a no-op on a dead connection, and a
    // write failure on a dying transport is logged, never escalated.

    pub async fn send_text(&self, message: &str) {
        self.send_frame(OpCode::Text, message.as_bytes()).await;
    }

    /// Serializes `value` to JSON and sends it as a text message. A
    /// serialization failure is logged and the send skipped.
    pub async fn send_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(&text).await,
            Err(e) => error!("failed to serialize outbound message on {}: {}", self.id, e),
        }
    }

    pub async fn send_binary(&self, payload: &[u8]) {
        self.send_frame(OpCode::Binary, payload).await;
    }

    pub async fn send_ping(&self) {
        self.send_frame(OpCode::Ping, &[]).await;
    }

    pub async fn send_pong(&self) {
        self.send_frame(OpCode::Pong, &[]).await;
    }

    async fn send_frame(&self, opcode: OpCode, payload: &[u8]) {
        if !self.is_alive() {
            return;
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        if let Err(e) = frame::write_frame(writer, opcode, payload, true).await {
            debug!("dropped write to dying connection {}: {}", self.id, e);
        }
    }

    /// Tears the connection down. First caller wins; later callers observe
    /// Closed and no-op. A Close frame goes out only when an explicit
    /// reason was supplied, with the reason echoed as the payload when
    /// non-empty.
    pub async fn kill(&self, reason: Option<&str>) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closing).await;

        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Some(reason) = reason {
                let payload = close_frame_payload(reason);
                if let Err(e) = frame::write_frame(writer, OpCode::Close, &payload, true).await {
                    debug!("dropped close frame to {}: {}", self.id, e);
                }
            }
            let _ = writer.shutdown().await;
        }
        *guard = None;
        drop(guard);

        self.set_state(ConnectionState::Closed).await;
        debug!("connection {} closed", self.id);
    }
}

fn close_frame_payload(reason: &str) -> Vec<u8> {
    if reason.is_empty() {
        return Vec::new();
    }
    let mut payload = crate::types::CloseCode::Normal.as_u16().to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Buffered state of an in-flight fragmented message. Connection-scoped:
/// reassembly happens here once, not per handler.
#[derive(Default)]
struct FragmentBuffer {
    opcode: Option<OpCode>,
    buffer: Vec<u8>,
}

impl FragmentBuffer {
    fn begin(&mut self, opcode: OpCode, payload: &[u8]) {
        self.opcode = Some(opcode);
        self.buffer.clear();
        self.buffer.extend_from_slice(payload);
    }

    fn push(&mut self, payload: &[u8]) {
        self.buffer.extend_from_slice(payload);
    }

    fn take(&mut self) -> Vec<u8> {
        self.opcode = None;
        std::mem::take(&mut self.buffer)
    }
}

/// Drives one connection from accept to teardown. Spawned by the registry;
/// all failures are contained here and never escalate past this task.
pub(crate) async fn run_lifecycle(
    conn: Arc<Connection>,
    mut transport: Transport,
    routes: Arc<RouteTable>,
    security: Option<Arc<dyn SecureTransport>>,
) {
    if let Some(security) = security {
        transport = match security.wrap(transport).await {
            Ok(wrapped) => wrapped,
            Err(SecureTransportError::Unauthorized) => {
                warn!("secure wrap rejected connection {}", conn.id);
                conn.kill(Some("unauthorized")).await;
                return;
            }
            Err(e) => {
                warn!("secure wrap failed on connection {}: {}", conn.id, e);
                conn.kill(None).await;
                return;
            }
        };
    }

    let (mut reader, writer) = tokio::io::split(transport);
    *conn.writer.lock().await = Some(writer);

    conn.set_state(ConnectionState::Handshaking).await;
    let Some(handler) = negotiate(&conn, &mut reader, &routes).await else {
        return;
    };

    let mut fragments = FragmentBuffer::default();
    while conn.is_alive() {
        match frame::read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if dispatch_frame(&conn, handler.as_ref(), frame, &mut fragments)
                    .await
                    .is_break()
                {
                    break;
                }
            }
            // Dropped frame (missing mask bit or reserved opcode): wait
            // and retry without closing.
            Ok(None) => sleep(INVALID_FRAME_PAUSE).await,
            Err(WsError::PayloadTooLarge(len)) => {
                warn!("connection {} sent oversized frame ({} bytes)", conn.id, len);
                break;
            }
            Err(e) => {
                debug!("receive loop on {} ended: {}", conn.id, e);
                break;
            }
        }
    }

    conn.kill(None).await;
}

/// Runs the handshake and resolves the route handler. Any failure closes
/// the connection with its specific reason and yields `None`; no
/// application callback fires on a failed handshake.
async fn negotiate(
    conn: &Arc<Connection>,
    reader: &mut ReadHalf<Transport>,
    routes: &RouteTable,
) -> Option<Arc<dyn RouteHandler>> {
    let request = match handshake::read_request(reader).await {
        Ok(request) => request,
        Err(WsError::HeaderTooLarge) => {
            conn.kill(Some("http header block too large")).await;
            return None;
        }
        Err(e) => {
            debug!("failed to read upgrade request on {}: {}", conn.id, e);
            conn.kill(None).await;
            return None;
        }
    };

    if let Err(e) = handshake::validate(&request) {
        let reason = match e {
            WsError::Handshake(reason) => reason,
            other => other.to_string(),
        };
        warn!("handshake rejected on {}: {}", conn.id, reason);
        conn.kill(Some(&reason)).await;
        return None;
    }

    // validate() guarantees the key header is present
    let accept_key = request
        .headers
        .get("Sec-WebSocket-Key")
        .map(|key| handshake::compute_accept_key(key))?;

    {
        let mut guard = conn.writer.lock().await;
        let writer = guard.as_mut()?;
        if let Err(e) = handshake::write_accept_response(writer, &accept_key).await {
            debug!("failed to write 101 response on {}: {}", conn.id, e);
            drop(guard);
            conn.kill(None).await;
            return None;
        }
    }

    let route = request.route.clone();
    let query_params = request.query_params.clone();
    *conn.request.write().unwrap() = Some(request);
    conn.set_state(ConnectionState::Open).await;
    info!("connection {} open on route {}", conn.id, route);

    let Some(handler) = routes.get(&route) else {
        conn.kill(Some("invalid route")).await;
        return None;
    };
    handler.on_open(conn, &query_params).await;
    Some(handler)
}

async fn dispatch_frame(
    conn: &Arc<Connection>,
    handler: &dyn RouteHandler,
    frame: Frame,
    fragments: &mut FragmentBuffer,
) -> ControlFlow<()> {
    match frame.opcode {
        OpCode::Close => {
            let event = CloseEvent::from_payload(&frame.payload);
            handler.on_close(conn, event).await;
            conn.kill(Some("")).await;
            ControlFlow::Break(())
        }
        OpCode::Ping => {
            handler.on_ping(conn, &frame.payload).await;
            ControlFlow::Continue(())
        }
        OpCode::Pong => {
            handler.on_pong(conn, &frame.payload).await;
            ControlFlow::Continue(())
        }
        OpCode::Text => {
            let message = String::from_utf8_lossy(&frame.payload);
            if frame.fin {
                handler.on_text(conn, &message).await;
            } else {
                fragments.begin(OpCode::Text, &frame.payload);
                handler.on_text_part(conn, &message, false).await;
            }
            ControlFlow::Continue(())
        }
        OpCode::Binary => {
            if frame.fin {
                handler.on_binary(conn, &frame.payload).await;
            } else {
                fragments.begin(OpCode::Binary, &frame.payload);
                handler.on_binary_part(conn, &frame.payload, false).await;
            }
            ControlFlow::Continue(())
        }
        OpCode::Continuation => {
            match fragments.opcode {
                Some(OpCode::Text) => {
                    let fragment = String::from_utf8_lossy(&frame.payload).into_owned();
                    fragments.push(&frame.payload);
                    handler.on_text_part(conn, &fragment, frame.fin).await;
                    if frame.fin {
                        let whole = fragments.take();
                        handler
                            .on_text(conn, &String::from_utf8_lossy(&whole))
                            .await;
                    }
                }
                Some(OpCode::Binary) => {
                    fragments.push(&frame.payload);
                    handler
                        .on_binary_part(conn, &frame.payload, frame.fin)
                        .await;
                    if frame.fin {
                        let whole = fragments.take();
                        handler.on_binary(conn, &whole).await;
                    }
                }
                // Continuation with no fragmented message in flight
                _ => {}
            }
            ControlFlow::Continue(())
        }
    }
}
