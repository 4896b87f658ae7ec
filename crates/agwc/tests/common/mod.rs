#![allow(dead_code)]

use agw_common::frame::{Frame, RequestFrame};
use agwc::rpc::{ClientNotice, ClientOptions};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const WAIT: Duration = Duration::from_secs(5);
pub const NONCE: &str = "nonce-abc";

/// In-process gateway: every accepted WebSocket is handed to the test,
/// which scripts the server side frame by frame.
pub struct MockGateway {
    pub addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConn { ws }).is_err() {
                    break;
                }
            }
        });
        Self { addr, conns }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("accept loop ended")
    }

    /// Accepts a connection and completes the handshake on it.
    pub async fn accept_connected(&mut self) -> (ServerConn, RequestFrame) {
        let mut conn = self.accept().await;
        let connect = conn.handshake(hello_ok(None)).await;
        (conn, connect)
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send(&mut self, frame: &Frame) {
        self.ws
            .send(Message::Text(frame.serialize()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    pub async fn send_challenge(&mut self) {
        self.send(&Frame::connect_challenge(NONCE)).await;
    }

    /// Next text frame from the client, `None` on close or after `limit`.
    pub async fn try_recv(&mut self, limit: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match msg.ok()? {
                Message::Text(text) => return Some(Frame::parse(&text).unwrap()),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    pub async fn recv_request(&mut self) -> RequestFrame {
        match self.try_recv(WAIT).await {
            Some(Frame::Req(req)) => req,
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    /// Waits for the client's close frame and returns its code and reason.
    pub async fn recv_close(&mut self) -> Option<(u16, String)> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            if let Message::Close(frame) = msg.ok()? {
                return frame.map(|f| (u16::from(f.code), f.reason.to_string()));
            }
        }
    }

    pub async fn reply_ok(&mut self, id: &str, payload: Value) {
        self.send(&Frame::ok(id, payload)).await;
    }

    /// Sends the challenge, reads the `connect` request and accepts it.
    pub async fn handshake(&mut self, hello: Value) -> RequestFrame {
        self.send_challenge().await;
        let connect = self.recv_request().await;
        assert_eq!(connect.method, "connect");
        self.reply_ok(&connect.id, hello).await;
        connect
    }

    pub async fn close(mut self, code: u16, reason: &str) {
        let _ = self
            .ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })))
            .await;
        // Drain until the client acknowledges.
        while let Ok(Some(Ok(_))) = tokio::time::timeout(WAIT, self.ws.next()).await {}
    }
}

pub fn hello_ok(tick_interval_ms: Option<u64>) -> Value {
    let mut hello = json!({
        "type": "hello-ok",
        "protocol": 3,
        "server": { "version": "test", "connId": "c1" },
        "features": { "methods": ["health"], "events": ["tick"] },
        "auth": { "role": "operator", "scopes": ["operator.admin"] },
    });
    if let Some(ms) = tick_interval_ms {
        hello["policy"] = json!({ "tickIntervalMs": ms });
    }
    hello
}

pub fn test_options(url: String) -> ClientOptions {
    let mut opts = ClientOptions::new(url);
    opts.reconnect_base = Duration::from_millis(50);
    opts.reconnect_max = Duration::from_millis(1000);
    opts.challenge_timeout = Duration::from_secs(2);
    opts
}

/// Skips notices until one matches `pred`.
pub async fn next_notice<F>(rx: &mut mpsc::Receiver<ClientNotice>, mut pred: F) -> ClientNotice
where
    F: FnMut(&ClientNotice) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let notice = rx.recv().await.expect("notice channel closed");
            if pred(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("timed out waiting for notice")
}

pub async fn wait_connected(rx: &mut mpsc::Receiver<ClientNotice>) {
    next_notice(rx, |n| matches!(n, ClientNotice::Connected(_))).await;
}

pub fn temp_path(prefix: &str) -> std::path::PathBuf {
    let random_suffix: u64 = rand::random();
    std::env::temp_dir().join(format!("{prefix}_{random_suffix}"))
}
