//! WebSocket rendezvous server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use playlink_core::validation::{sanitize_client_message, validate_client_message};
use playlink_core::{ClientMessage, ServerMessage, SignalConfig};

use crate::registry::{JoinRequest, SessionRegistry};

/// Maximum bytes inspected when deciding between plain HTTP and WebSocket
const PEEK_LIMIT: usize = 2048;

/// Signal server state
pub struct SignalServer {
    registry: Arc<SessionRegistry>,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config)),
        }
    }

    /// Shared registry (for monitoring and tests)
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let registry = self.registry.clone();
        let interval = registry.config().sweep_interval();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        });

        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, registry).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    /// Number of participants across all sessions
    pub fn participant_count(&self) -> usize {
        self.registry.participant_count()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if is_plain_http(&stream).await? {
        return handle_http_request(&mut stream, &registry).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let participant_id = registry.register_connection(tx);
    debug!("New connection from {} as {}", peer_addr, participant_id);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode {}: {}", msg.event_name(), e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        };

        if let Some(reply) = handle_text(&text, &participant_id, &registry) {
            registry.send_to(&participant_id, reply);
        }
    }

    // Leaves the session (promoting a new host if needed) and drops the outbox
    registry.unregister_connection(&participant_id);
    let _ = writer.await;

    debug!("Connection closed: {}", participant_id);
    Ok(())
}

/// Decode, validate and apply one text frame
///
/// Malformed messages are logged and dropped, except `join-session`, which is
/// answered so the joiner does not wait out its deadline.
fn handle_text(text: &str, participant_id: &str, registry: &SessionRegistry) -> Option<ServerMessage> {
    let msg = match ClientMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(participant = %participant_id, "Discarding malformed message: {}", e);
            return is_join_event(text)
                .then(|| ServerMessage::join_failed(format!("Invalid request: {}", e)));
        }
    };

    if let Err(e) = validate_client_message(&msg) {
        warn!(participant = %participant_id, "Discarding invalid message: {}", e);
        return matches!(msg, ClientMessage::JoinSession { .. })
            .then(|| ServerMessage::join_failed(e.to_string()));
    }

    handle_message(sanitize_client_message(msg), participant_id, registry)
}

fn is_join_event(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(|e| e == "join-session"))
        .unwrap_or(false)
}

/// Handle a single validated message
fn handle_message(
    msg: ClientMessage,
    participant_id: &str,
    registry: &SessionRegistry,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::JoinSession {
            session_id,
            user_id,
            user_name,
            title,
            platform,
            capacity,
        } => {
            let request = JoinRequest {
                user_id,
                user_name,
                title,
                platform,
                capacity,
            };
            match registry.create_or_join(participant_id, &session_id, request) {
                Ok(outcome) => Some(outcome.into_message()),
                Err(e) => {
                    info!(participant = %participant_id, session = %session_id, "Join refused: {}", e);
                    Some(ServerMessage::join_failed(e.to_string()))
                }
            }
        }

        ClientMessage::LeaveSession { session_id } => {
            registry.leave(&session_id, participant_id);
            None
        }

        ClientMessage::Input {
            key,
            kind,
            timestamp,
        } => {
            registry.relay_input(participant_id, key, kind, timestamp);
            None
        }

        ClientMessage::SyncState { state, timestamp } => {
            registry.relay_state(participant_id, state, timestamp);
            None
        }

        ClientMessage::ChatMessage { message } => {
            registry.relay_chat(participant_id, message);
            None
        }

        ClientMessage::GetRoomInfo { session_id } => {
            registry.request_state(&session_id, participant_id);
            None
        }

        ClientMessage::Heartbeat => Some(registry.heartbeat(participant_id)),

        ClientMessage::StartSession { session_id } => {
            registry.start_session(&session_id, participant_id);
            None
        }

        ClientMessage::GetLobbySessions => Some(ServerMessage::LobbySessions {
            sessions: registry.lobby(),
        }),
    }
}

/// Peek at the request head: plain HTTP unless it asks for a WebSocket upgrade
async fn is_plain_http(stream: &TcpStream) -> std::io::Result<bool> {
    let mut buf = [0u8; PEEK_LIMIT];
    for _ in 0..50 {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        let head = &buf[..n];
        if n >= 5 && !(head.starts_with(b"GET ") || head.starts_with(b"HEAD ")) {
            return Ok(false);
        }
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(head).to_ascii_lowercase();
            return Ok(!head.contains("upgrade: websocket"));
        }
        if n == PEEK_LIMIT {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(false)
}

/// Handle an HTTP request (health checks and stats)
async fn handle_http_request(
    stream: &mut TcpStream,
    registry: &SessionRegistry,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let mut request_line = request.lines().next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("GET");
    let path = request_line.next().unwrap_or("/");

    let (status, body) = route_http(path, registry);
    let body = body.to_string();

    // HEAD gets the same headers without the body
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        if method == "HEAD" { "" } else { body.as_str() }
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn route_http(path: &str, registry: &SessionRegistry) -> (&'static str, serde_json::Value) {
    let path = path.split('?').next().unwrap_or(path);
    match path {
        "/" | "/health" => (
            "200 OK",
            serde_json::json!({
                "status": "ok",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "sessions": registry.session_count(),
                "participants": registry.participant_count(),
            }),
        ),
        "/stats" => (
            "200 OK",
            serde_json::json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "sessions": registry.session_count(),
                "participants": registry.participant_count(),
                "connections": registry.connection_count(),
                "protocolVersion": playlink_core::PROTOCOL_VERSION,
                "sessionList": registry.sessions(),
            }),
        ),
        _ => ("404 Not Found", serde_json::json!({ "error": "not found" })),
    }
}
