//! WebSocket to TCP bridge for VNC consoles.
//!
//! Drivers that only expose a raw VNC endpoint get a short-lived token
//! registered here; the browser console connects to `/websockify` with a
//! `token` cookie and its frames are relayed to the endpoint, base64
//! encoded in both directions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use lobster_crypto::random_alphanumeric;

use crate::session::cookie_value;

/// Tokens stop resolving after this long.
pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
const TOKEN_LENGTH: usize = 32;

struct Target {
    addr: String,
    registered: Instant,
}

/// Process-wide console token table.
pub struct Websockify {
    tokens: Mutex<HashMap<String, Target>>,
    url_template: String,
}

impl Websockify {
    /// `url_template` is the console URL given to users; `TOKEN` and
    /// `PASSWORD` in it are substituted on registration.
    pub fn new(url_template: &str) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            url_template: url_template.to_string(),
        }
    }

    /// Register `addr` (`ip:port`) and return a fresh token for it.
    /// Expired tokens are dropped on the way.
    pub fn register(&self, addr: &str) -> String {
        let token = random_alphanumeric(TOKEN_LENGTH);
        let now = Instant::now();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.retain(|_, target| now.duration_since(target.registered) <= TOKEN_TTL);
            tokens.insert(
                token.clone(),
                Target {
                    addr: addr.to_string(),
                    registered: now,
                },
            );
        }
        token
    }

    /// Register `addr` and build the console URL for it.
    pub fn console_url(&self, addr: &str, password: &str) -> String {
        let token = self.register(addr);
        self.url_template
            .replacen("TOKEN", &token, 1)
            .replacen("PASSWORD", password, 1)
    }

    /// Target for a live token.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let tokens = self.tokens.lock().ok()?;
        tokens
            .get(token)
            .filter(|target| target.registered.elapsed() <= TOKEN_TTL)
            .map(|target| target.addr.clone())
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/websockify", get(websockify_handler))
            .with_state(self)
    }
}

async fn websockify_handler(
    State(websockify): State<Arc<Websockify>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(token) = cookie_value(&headers, "token") else {
        debug!("Websockify request without token cookie");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(addr) = websockify.resolve(&token) else {
        debug!("Websockify request with unknown token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    upgrade
        .protocols(["base64"])
        .on_upgrade(move |socket| bridge(socket, addr))
}

async fn bridge(socket: WebSocket, addr: String) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Console target unreachable");
            return;
        }
    };
    debug!(addr = %addr, "Console connection opened");

    let (mut tcp_read, mut tcp_write) = stream.into_split();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let upstream = async {
        while let Some(Ok(message)) = ws_rx.next().await {
            let bytes = match message {
                Message::Text(text) => match STANDARD.decode(text.as_str()) {
                    Ok(bytes) => bytes,
                    Err(_) => break,
                },
                Message::Binary(bytes) => bytes.to_vec(),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if tcp_write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    };

    let downstream = async {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let frame = Message::Text(STANDARD.encode(&buf[..n]).into());
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        () = upstream => {}
        () = downstream => {}
    }
    debug!(addr = %addr, "Console connection closed");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn console_url_substitutes_token_and_password() {
        let ws = Websockify::new("https://vnc.example.com/vnc.html?token=TOKEN&password=PASSWORD");
        let url = ws.console_url("10.0.0.5:5901", "hunter2");
        assert!(url.ends_with("&password=hunter2"));
        let token = url
            .trim_start_matches("https://vnc.example.com/vnc.html?token=")
            .split('&')
            .next()
            .unwrap();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert_eq!(ws.resolve(token).as_deref(), Some("10.0.0.5:5901"));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_expire_after_an_hour() {
        let ws = Websockify::new("TOKEN");
        let token = ws.register("127.0.0.1:5900");
        assert!(ws.resolve(&token).is_some());

        tokio::time::advance(TOKEN_TTL - Duration::from_secs(1)).await;
        assert!(ws.resolve(&token).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ws.resolve(&token).is_none());

        // Registering prunes the expired entry.
        ws.register("127.0.0.1:5901");
        assert_eq!(ws.tokens.lock().unwrap().len(), 1);
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn write_text_frame(stream: &mut TcpStream, text: &str) {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut frame = vec![0x81, 0x80 | u8::try_from(text.len()).unwrap()];
        frame.extend_from_slice(&mask);
        frame.extend(text.bytes().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_text_frame(stream: &mut TcpStream) -> String {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x81);
        let mut payload = vec![0u8; usize::from(header[1] & 0x7f)];
        stream.read_exact(&mut payload).await.unwrap();
        String::from_utf8(payload).unwrap()
    }

    #[tokio::test]
    async fn relays_base64_frames_to_target() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping\n");
            conn.write_all(b"pong\n").await.unwrap();
        });

        let ws = Arc::new(Websockify::new("TOKEN"));
        let token = ws.register(&target_addr.to_string());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, ws.router()).await.unwrap() });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /websockify HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: base64\r\n\
             Cookie: token={token}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");

        write_text_frame(&mut client, &STANDARD.encode(b"ping\n")).await;
        let reply = read_text_frame(&mut client).await;
        assert_eq!(STANDARD.decode(reply).unwrap(), b"pong\n");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_token_does_not_resolve() {
        let ws = Websockify::new("TOKEN");
        ws.register("127.0.0.1:5900");
        assert!(ws.resolve("nope").is_none());
    }
}
