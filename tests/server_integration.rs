//! End-to-end tests over real TCP sockets: handshake, echo traffic,
//! broadcast, and server shutdown.

use async_trait::async_trait;
use riptide_ws::{
    frame, CloseCode, CloseEvent, Connection, OpCode, RouteHandler, RouteTable, SecureTransport,
    SecureTransportError, SecurityConfig, Server, ServerConfig, Transport,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

const MASK_KEY: [u8; 4] = [0x5E, 0x19, 0xC4, 0x70];

fn masked_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
    let mut wire = Vec::with_capacity(payload.len() + 14);
    wire.push(if fin { 0x80 } else { 0x00 } | opcode.as_u4());
    if payload.len() < 126 {
        wire.push(0x80 | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        wire.push(0x80 | 126);
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        wire.push(0x80 | 127);
        wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    wire.extend_from_slice(&MASK_KEY);
    let mut masked = payload.to_vec();
    frame::apply_mask(&mut masked, MASK_KEY);
    wire.extend_from_slice(&masked);
    wire
}

async fn read_server_frame(stream: &mut TcpStream) -> (OpCode, bool, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let fin = header[0] & 0x80 != 0;
    let opcode = OpCode::from_u4(header[0] & 0x0F).unwrap();
    assert_eq!(header[1] & 0x80, 0, "server frames must not be masked");
    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (opcode, fin, payload)
}

/// Connects and completes the upgrade handshake on `route`.
async fn connect(server: &Server, route: &str) -> TcpStream {
    let addr = server.local_addr().unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let upgrade = format!(
        "GET {route} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(upgrade.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let mut read = 0;
    loop {
        let n = stream.read(&mut buf[read..]).await.unwrap();
        assert!(n > 0, "connection closed during handshake");
        read += n;
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let response = String::from_utf8_lossy(&buf[..read]);
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"), "{response}");
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    stream
}

struct Echo;

#[async_trait]
impl RouteHandler for Echo {
    async fn on_text(&self, conn: &Arc<Connection>, message: &str) {
        conn.send_text(message).await;
    }

    async fn on_binary(&self, conn: &Arc<Connection>, payload: &[u8]) {
        conn.send_binary(payload).await;
    }

    async fn on_ping(&self, conn: &Arc<Connection>, _payload: &[u8]) {
        conn.send_pong().await;
    }
}

fn ephemeral_config() -> ServerConfig {
    ServerConfig::default().with_port(0).with_no_delay(true)
}

async fn start_echo_server() -> Arc<Server> {
    let routes = RouteTable::new().route("/echo", Arc::new(Echo));
    let server = Arc::new(Server::new(ephemeral_config(), routes));
    server.run(false).await.unwrap();
    server
}

#[tokio::test]
async fn upgrade_and_echo_text() {
    let server = start_echo_server().await;
    let mut client = connect(&server, "/echo").await;

    client
        .write_all(&masked_frame(OpCode::Text, b"over tcp", true))
        .await
        .unwrap();

    let (opcode, fin, payload) = read_server_frame(&mut client).await;
    assert_eq!(opcode, OpCode::Text);
    assert!(fin);
    assert_eq!(payload, b"over tcp");

    server.stop().await;
}

#[tokio::test]
async fn echo_binary_with_extended_length() {
    let server = start_echo_server().await;
    let mut client = connect(&server, "/echo").await;

    // 16-bit extended length class
    let message: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    client
        .write_all(&masked_frame(OpCode::Binary, &message, true))
        .await
        .unwrap();

    let (opcode, _, payload) = read_server_frame(&mut client).await;
    assert_eq!(opcode, OpCode::Binary);
    assert_eq!(payload, message);

    server.stop().await;
}

#[tokio::test]
async fn ping_gets_ponged() {
    let server = start_echo_server().await;
    let mut client = connect(&server, "/echo").await;

    client
        .write_all(&masked_frame(OpCode::Ping, b"hb", true))
        .await
        .unwrap();

    let (opcode, _, payload) = read_server_frame(&mut client).await;
    assert_eq!(opcode, OpCode::Pong);
    assert!(payload.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn close_handshake_replies_with_close_frame() {
    struct CloseProbe {
        closes: mpsc::UnboundedSender<CloseEvent>,
    }

    #[async_trait]
    impl RouteHandler for CloseProbe {
        async fn on_close(&self, _conn: &Arc<Connection>, event: CloseEvent) {
            let _ = self.closes.send(event);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let routes = RouteTable::new().route("/probe", Arc::new(CloseProbe { closes: tx }));
    let server = Arc::new(Server::new(ephemeral_config(), routes));
    server.run(false).await.unwrap();

    let mut client = connect(&server, "/probe").await;
    let mut payload = 1001u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"leaving");
    client
        .write_all(&masked_frame(OpCode::Close, &payload, true))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.code, CloseCode::GoingAway);
    assert_eq!(event.reason.as_deref(), Some("leaving"));

    // empty-reason close goes back as a bare Close frame
    let (opcode, _, reply) = read_server_frame(&mut client).await;
    assert_eq!(opcode, OpCode::Close);
    assert!(reply.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn rejected_handshake_receives_close_with_reason() {
    let server = start_echo_server().await;
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    // no Sec-WebSocket-Key
    client
        .write_all(b"GET /echo HTTP/1.1\r\nSec-WebSocket-Version: 13\r\n\r\n")
        .await
        .unwrap();

    let (opcode, _, payload) = read_server_frame(&mut client).await;
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);
    assert_eq!(
        &payload[2..],
        b"missing required websocket upgrade headers"
    );

    server.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let server = start_echo_server().await;
    let mut first = connect(&server, "/echo").await;
    let mut second = connect(&server, "/echo").await;

    // wait for both lifecycles to reach Open
    timeout(Duration::from_secs(2), async {
        loop {
            let registry = server.registry();
            if registry.total_connections() == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    sleep(Duration::from_millis(50)).await;

    server.registry().broadcast_text("fanout", None).await;

    for client in [&mut first, &mut second] {
        let (opcode, _, payload) = read_server_frame(client).await;
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload, b"fanout");
    }

    server.stop().await;
}

#[tokio::test]
async fn reaper_prunes_disconnected_clients() {
    let server = start_echo_server().await;
    let client = connect(&server, "/echo").await;

    timeout(Duration::from_secs(2), async {
        while server.registry().total_connections() != 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    drop(client);

    // lifecycle notices the dead transport, then the 500ms reaper sweeps it
    timeout(Duration::from_secs(5), async {
        while server.registry().total_connections() != 0 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn stop_terminates_blocking_run() {
    let routes = RouteTable::new().route("/echo", Arc::new(Echo));
    let server = Arc::new(Server::new(ephemeral_config(), routes));

    server.run(false).await.unwrap();
    assert!(server.is_running());

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move {
            while server.is_running() {
                sleep(Duration::from_millis(20)).await;
            }
        })
    };

    server.stop().await;
    assert!(!server.is_running());
    timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();

    // stopping twice is a no-op
    server.stop().await;
}

/// Refuses every connection, standing in for a TLS layer with failing
/// client authentication.
struct RejectAll;

#[async_trait]
impl SecureTransport for RejectAll {
    async fn wrap(&self, _stream: Transport) -> Result<Transport, SecureTransportError> {
        Err(SecureTransportError::Unauthorized)
    }
}

#[tokio::test]
async fn disabled_security_policy_skips_the_wrapper() {
    let routes = RouteTable::new().route("/echo", Arc::new(Echo));
    let server = Arc::new(Server::with_security(
        ephemeral_config(),
        routes,
        SecurityConfig::default(), // enabled: false
        Arc::new(RejectAll),
    ));
    server.run(false).await.unwrap();

    // the wrapper would reject; with the policy disabled it never runs
    let mut client = connect(&server, "/echo").await;
    client
        .write_all(&masked_frame(OpCode::Text, b"still here", true))
        .await
        .unwrap();
    let (opcode, _, payload) = read_server_frame(&mut client).await;
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, b"still here");

    server.stop().await;
}

#[tokio::test]
async fn enabled_security_policy_rejects_before_handshake() {
    let routes = RouteTable::new().route("/echo", Arc::new(Echo));
    let security = SecurityConfig {
        enabled: true,
        ..SecurityConfig::default()
    };
    let server = Arc::new(Server::with_security(
        ephemeral_config(),
        routes,
        security,
        Arc::new(RejectAll),
    ));
    server.run(false).await.unwrap();

    let addr = server.local_addr().unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();

    // the socket is dropped before any HTTP is read; no 101, no frames
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    server.stop().await;
}

#[tokio::test]
async fn query_params_reach_the_handler() {
    struct ParamProbe {
        params: mpsc::UnboundedSender<HashMap<String, String>>,
    }

    #[async_trait]
    impl RouteHandler for ParamProbe {
        async fn on_open(&self, _conn: &Arc<Connection>, query_params: &HashMap<String, String>) {
            let _ = self.params.send(query_params.clone());
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let routes = RouteTable::new().route("/stream", Arc::new(ParamProbe { params: tx }));
    let server = Arc::new(Server::new(ephemeral_config(), routes));
    server.run(false).await.unwrap();

    let _client = connect(&server, "/stream?token=abc123&room=lobby").await;

    let params = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(params.get("token").map(String::as_str), Some("abc123"));
    assert_eq!(params.get("room").map(String::as_str), Some("lobby"));

    server.stop().await;
}
