//! Gateway RPC client.
//!
//! One WebSocket connection to the gateway's control endpoint. Performs the
//! `connect.challenge` handshake (device-signed when an identity is
//! configured), multiplexes concurrent requests by id, forwards server
//! events, and reconnects with exponential backoff whenever the socket
//! closes.

use crate::backoff::ExponentialBackoff;
use crate::identity::DeviceIdentity;
use agw_common::crypto::{self, DeviceAuthParams};
use agw_common::frame::{EventFrame, Frame, ResponseFrame};
use agw_common::types::{self, client_id, client_mode, error_code, event, role, scope};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Default for [`ClientOptions::request_timeout`] and [`RequestOptions`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const NOTICE_CAPACITY: usize = 256;
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;
const CLOSE_POLICY: u16 = 1008;

/// Errors returned by [`RpcClient::request`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// The socket is not open or the handshake has not completed.
    #[error("gateway not connected")]
    NotConnected,
    /// The client was stopped while the request was in flight.
    #[error("gateway client stopped")]
    Stopped,
    /// The connection closed while the request was in flight.
    #[error("gateway closed ({code}): {reason}")]
    ConnectionClosed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The connection closed before the handshake completed.
    #[error("gateway closed before connect ({code}): {reason}")]
    ClosedBeforeConnect {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// No response arrived in time.
    #[error("{method} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Method of the request.
        method: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The gateway answered with `ok: false`.
    #[error("{message}")]
    Server {
        /// Machine-readable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Structured error details.
        details: Option<Value>,
    },
    /// The handshake produced an unusable result.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The frame could not be handed to the socket writer.
    #[error("send failed: {0}")]
    Send(String),
}

impl RpcError {
    /// Machine-readable code: the server's own code for server errors.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::NotConnected => error_code::NOT_CONNECTED,
            Self::Stopped => error_code::CLIENT_STOPPED,
            Self::ConnectionClosed { .. } | Self::ClosedBeforeConnect { .. } => {
                error_code::CONNECTION_CLOSED
            }
            Self::Timeout { .. } => error_code::TIMEOUT,
            Self::Server { code, .. } => code,
            Self::Handshake(_) => error_code::HANDSHAKE_FAILED,
            Self::Send(_) => error_code::SEND_FAILED,
        }
    }
}

/// Connection status of the gateway socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// No socket.
    Disconnected,
    /// Socket opening or handshake pending.
    Connecting,
    /// Handshake complete; requests are accepted.
    Connected,
}

/// Notifications delivered to the client's single subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    /// Handshake completed.
    Connected(HelloOk),
    /// Server-pushed event, verbatim.
    Event(EventFrame),
    /// Event sequence numbers skipped ahead.
    Gap {
        /// Next sequence number that was expected.
        expected: u64,
        /// Sequence number actually received.
        received: u64,
    },
    /// The socket closed.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A connect attempt failed before the session was established.
    ConnectError(String),
    /// A reconnect is scheduled.
    Reconnecting {
        /// Reconnect attempt number, 1-based.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    /// Negotiated protocol revision.
    #[serde(default)]
    pub protocol: Option<u32>,
    /// Server descriptor.
    #[serde(default)]
    pub server: Option<Value>,
    /// Advertised methods and events.
    #[serde(default)]
    pub features: Option<Value>,
    /// Connection policy.
    #[serde(default)]
    pub policy: Option<HelloPolicy>,
    /// Granted authorization.
    #[serde(default)]
    pub auth: Option<HelloAuth>,
}

/// Connection policy announced in `hello-ok`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    /// Cadence of `tick` events.
    #[serde(default)]
    pub tick_interval_ms: Option<u64>,
    /// Largest frame the server accepts.
    #[serde(default)]
    pub max_payload: Option<u64>,
}

/// Authorization granted in `hello-ok`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    /// Granted role.
    #[serde(default)]
    pub role: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Snapshot returned by [`RpcClient::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    /// Socket open and handshake complete.
    pub connected: bool,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempt: u32,
    /// Requests awaiting a response.
    pub pending: usize,
}

/// Per-request options.
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    /// Local timeout.
    pub timeout: Duration,
    /// Keep waiting past an `{"status":"accepted"}` acknowledgement.
    pub expect_final: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            expect_final: false,
        }
    }
}

/// How the client identifies and authenticates itself.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Pre-shared gateway token.
    pub token: Option<String>,
    /// Gateway password.
    pub password: Option<String>,
    /// Client identifier.
    pub client_id: String,
    /// Human-friendly client name.
    pub display_name: Option<String>,
    /// Client version string.
    pub client_version: String,
    /// Platform descriptor.
    pub platform: String,
    /// Operating mode.
    pub mode: String,
    /// Distinguishes several instances of the same client.
    pub instance_id: Option<String>,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Capability flags.
    pub caps: Vec<String>,
    /// Lowest protocol revision accepted.
    pub min_protocol: u32,
    /// Highest protocol revision accepted.
    pub max_protocol: u32,
    /// Timeout applied by [`RpcClient::request`].
    pub request_timeout: Duration,
    /// Timeout for the `connect` request.
    pub connect_timeout: Duration,
    /// Time allowed for the `connect.challenge` event to arrive.
    pub challenge_timeout: Duration,
    /// Reconnect after the socket closes.
    pub auto_reconnect: bool,
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Largest reconnect delay.
    pub reconnect_max: Duration,
}

impl ClientOptions {
    /// Operator backend client for `url` with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            password: None,
            client_id: client_id::GATEWAY_CLIENT.to_string(),
            display_name: None,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: client_mode::BACKEND.to_string(),
            instance_id: None,
            role: role::OPERATOR.to_string(),
            scopes: vec![
                scope::ADMIN.to_string(),
                scope::APPROVALS.to_string(),
                scope::PAIRING.to_string(),
            ],
            caps: Vec::new(),
            min_protocol: types::PROTOCOL_VERSION,
            max_protocol: types::PROTOCOL_VERSION,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_REQUEST_TIMEOUT,
            challenge_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams<'a> {
    min_protocol: u32,
    max_protocol: u32,
    client: ClientInfo<'a>,
    role: &'a str,
    scopes: &'a [String],
    caps: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<ConnectAuth<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<DeviceProof>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientInfo<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    version: &'a str,
    platform: &'a str,
    mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<&'a str>,
}

#[derive(Serialize)]
struct ConnectAuth<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceProof {
    id: String,
    public_key: String,
    signature: String,
    signed_at: u64,
    nonce: String,
}

#[derive(Clone, Copy)]
enum Gate {
    /// Requires a completed handshake.
    Connected,
    /// Only requires the given connection to be open and current; used by
    /// the `connect` request.
    Bootstrap(u64),
}

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
    /// Arms the tick watchdog with the negotiated interval.
    Watchdog(Duration),
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    open: bool,
}

struct PendingRequest {
    expect_final: bool,
    tx: oneshot::Sender<Result<Value, RpcError>>,
    timer: JoinHandle<()>,
}

struct State {
    closed: bool,
    connected: bool,
    conn: Option<Connection>,
    next_conn_id: u64,
    pending: HashMap<String, PendingRequest>,
    /// Id of the in-flight `connect` request.
    handshake_id: Option<String>,
    backoff: ExponentialBackoff,
    reconnect_timer: Option<JoinHandle<()>>,
    last_seq: Option<u64>,
}

struct Inner {
    opts: ClientOptions,
    identity: Option<Arc<DeviceIdentity>>,
    notices: mpsc::Sender<ClientNotice>,
    status_tx: watch::Sender<ConnStatus>,
    state: Mutex<State>,
}

/// Handle to the gateway RPC client. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

fn new_request_id() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{:x}-{suffix:016x}", crypto::unix_now_ms())
}

impl RpcClient {
    /// Creates an idle client and the receiver for its notifications.
    #[must_use]
    pub fn new(
        opts: ClientOptions,
        identity: Option<Arc<DeviceIdentity>>,
    ) -> (Self, mpsc::Receiver<ClientNotice>) {
        let (notices, rx) = mpsc::channel(NOTICE_CAPACITY);
        let (status_tx, _) = watch::channel(ConnStatus::Disconnected);
        let backoff = ExponentialBackoff::new(opts.reconnect_base, opts.reconnect_max);
        let inner = Arc::new(Inner {
            opts,
            identity,
            notices,
            status_tx,
            state: Mutex::new(State {
                closed: false,
                connected: false,
                conn: None,
                next_conn_id: 0,
                pending: HashMap::new(),
                handshake_id: None,
                backoff,
                reconnect_timer: None,
                last_seq: None,
            }),
        });
        (Self { inner }, rx)
    }

    /// Opens the socket and runs the handshake in the background.
    ///
    /// Failures never surface here; they feed the reconnect loop and the
    /// notification channel. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut st = self.inner.lock();
        st.closed = false;
        if st.conn.is_some() || st.reconnect_timer.is_some() {
            debug!("gateway client already started");
            return;
        }
        self.inner.connect_locked(&mut st);
    }

    /// Closes the socket, cancels reconnects and fails pending requests
    /// with [`RpcError::Stopped`]. Idempotent.
    pub fn stop(&self) {
        let (conn, pending) = {
            let mut st = self.inner.lock();
            if st.closed && st.conn.is_none() && st.pending.is_empty() {
                return;
            }
            st.closed = true;
            st.connected = false;
            st.handshake_id = None;
            st.backoff.reset();
            if let Some(timer) = st.reconnect_timer.take() {
                timer.abort();
            }
            let pending: Vec<PendingRequest> = st.pending.drain().map(|(_, p)| p).collect();
            (st.conn.take(), pending)
        };

        if let Some(conn) = conn {
            let _ = conn.tx.send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "client stopped".to_string(),
            });
        }
        for p in pending {
            p.timer.abort();
            let _ = p.tx.send(Err(RpcError::Stopped));
        }
        self.inner.status_tx.send_replace(ConnStatus::Disconnected);
        info!("gateway client stopped");
    }

    /// True when the socket is open and the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Current connection snapshot.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        let st = self.inner.lock();
        ClientStatus {
            connected: st.connected,
            reconnect_attempt: st.backoff.attempt(),
            pending: st.pending.len(),
        }
    }

    /// Watch channel tracking [`ConnStatus`].
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Sends `method` with [`ClientOptions::request_timeout`].
    ///
    /// # Errors
    ///
    /// See [`RpcClient::request_with`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let opts = RequestOptions {
            timeout: self.inner.opts.request_timeout,
            expect_final: false,
        };
        self.request_with(method, params, opts).await
    }

    /// Sends `method` and waits for the correlated response.
    ///
    /// # Errors
    ///
    /// [`RpcError::NotConnected`] without sending anything when the
    /// handshake has not completed; otherwise the server's error, a local
    /// timeout, or a connection-closed / stopped error.
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Value, RpcError> {
        self.inner
            .send_request(method, params, opts, Gate::Connected)
            .await
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notice: ClientNotice) {
        match self.notices.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notice)) => {
                debug!(?notice, "notice dropped: subscriber is not keeping up");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn is_current(st: &State, conn_id: u64) -> bool {
        st.conn.as_ref().is_some_and(|c| c.id == conn_id)
    }

    fn connect_locked(self: &Arc<Self>, st: &mut State) {
        st.next_conn_id += 1;
        let conn_id = st.next_conn_id;
        let (tx, rx) = mpsc::unbounded_channel();
        st.conn = Some(Connection {
            id: conn_id,
            tx,
            open: false,
        });
        st.connected = false;
        st.handshake_id = None;
        st.last_seq = None;
        self.status_tx.send_replace(ConnStatus::Connecting);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let (code, reason) = inner.run_connection(conn_id, rx).await;
            inner.on_close(conn_id, code, reason);
        });
    }

    async fn run_connection(
        self: &Arc<Self>,
        conn_id: u64,
        mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> (u16, String) {
        debug!(url = %self.opts.url, "connecting to gateway");
        let ws = match tokio_tungstenite::connect_async(self.opts.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                let reason = format!("connect failed: {e}");
                self.notify(ClientNotice::ConnectError(reason.clone()));
                return (CLOSE_ABNORMAL, reason);
            }
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        let still_wanted = {
            let mut st = self.lock();
            match st.conn.as_mut().filter(|c| c.id == conn_id) {
                Some(conn) => {
                    conn.open = true;
                    true
                }
                None => false,
            }
        };
        if !still_wanted {
            let _ = ws_tx.send(Message::Close(None)).await;
            return (CLOSE_NORMAL, "client stopped".to_string());
        }

        let challenge_deadline = Instant::now() + self.opts.challenge_timeout;
        let mut challenged = false;
        let mut last_inbound = Instant::now();
        let mut tick_interval: Option<Duration> = None;

        loop {
            let tick_deadline = tick_interval.map(|tick| last_inbound + tick * 2);
            let idle_deadline =
                tick_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return (CLOSE_ABNORMAL, e.to_string()),
                        None => return (CLOSE_ABNORMAL, "connection closed".to_string()),
                    };
                    last_inbound = Instant::now();
                    match msg {
                        Message::Text(text) => self.handle_text(conn_id, &text, &mut challenged),
                        Message::Ping(data) => {
                            if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                                return (CLOSE_ABNORMAL, e.to_string());
                            }
                        }
                        Message::Close(frame) => {
                            return frame.map_or_else(
                                || (CLOSE_NO_STATUS, String::new()),
                                |f| (u16::from(f.code), f.reason.to_string()),
                            );
                        }
                        _ => {}
                    }
                }

                out = out_rx.recv() => {
                    match out {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                                return (CLOSE_ABNORMAL, e.to_string());
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.clone().into(),
                            };
                            let _ = ws_tx.send(Message::Close(Some(frame))).await;
                            return (code, reason);
                        }
                        Some(Outbound::Watchdog(tick)) => {
                            debug!(tick_ms = tick.as_millis() as u64, "tick watchdog armed");
                            tick_interval = Some(tick);
                            last_inbound = Instant::now();
                        }
                        None => return (CLOSE_NORMAL, "client dropped".to_string()),
                    }
                }

                () = tokio::time::sleep_until(challenge_deadline), if !challenged => {
                    let reason = "connect challenge timeout".to_string();
                    warn!(timeout_ms = self.opts.challenge_timeout.as_millis() as u64, "{reason}");
                    self.notify(ClientNotice::ConnectError(reason.clone()));
                    let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(CLOSE_POLICY),
                        reason: reason.clone().into(),
                    }))).await;
                    return (CLOSE_POLICY, reason);
                }

                () = tokio::time::sleep_until(idle_deadline), if tick_deadline.is_some() => {
                    let reason = "tick timeout".to_string();
                    warn!("gateway stopped sending ticks, closing");
                    let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(types::CLOSE_TICK_TIMEOUT),
                        reason: reason.clone().into(),
                    }))).await;
                    return (types::CLOSE_TICK_TIMEOUT, reason);
                }
            }
        }
    }

    fn handle_text(self: &Arc<Self>, conn_id: u64, text: &str, challenged: &mut bool) {
        let frame = match Frame::parse(text) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable frame");
                return;
            }
        };
        match frame {
            Frame::Event(ev) if ev.event == event::CONNECT_CHALLENGE => {
                if *challenged {
                    debug!("ignoring repeated connect challenge");
                    return;
                }
                *challenged = true;
                if let Some(nonce) = ev.challenge_nonce() {
                    self.begin_handshake(conn_id, nonce.to_string());
                } else {
                    let reason = "connect challenge missing nonce".to_string();
                    warn!("{reason}");
                    self.notify(ClientNotice::ConnectError(reason.clone()));
                    self.close_connection(conn_id, CLOSE_POLICY, reason);
                }
            }
            Frame::Event(ev) => self.dispatch_event(ev),
            Frame::Res(res) => self.handle_response(res),
            Frame::HelloOk(body) => self.complete_handshake(conn_id, body),
            Frame::Req(req) => {
                debug!(method = %req.method, "ignoring request from gateway");
            }
        }
    }

    fn dispatch_event(&self, ev: EventFrame) {
        let gap = ev.seq.and_then(|seq| {
            let mut st = self.lock();
            let gap = st
                .last_seq
                .filter(|last| seq > last.saturating_add(1))
                .map(|last| (last + 1, seq));
            st.last_seq = Some(seq);
            gap
        });
        if let Some((expected, received)) = gap {
            warn!(expected, received, "event sequence gap");
            self.notify(ClientNotice::Gap { expected, received });
        }
        self.notify(ClientNotice::Event(ev));
    }

    fn handle_response(&self, res: ResponseFrame) {
        let pending = {
            let mut st = self.lock();
            let Some(entry) = st.pending.get(&res.id) else {
                debug!(id = %res.id, "dropping response for unknown request");
                return;
            };
            let accepted = res.ok
                && res
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("status"))
                    .and_then(Value::as_str)
                    == Some("accepted");
            if entry.expect_final && accepted {
                debug!(id = %res.id, "request accepted, awaiting final response");
                return;
            }
            if st.handshake_id.as_deref() == Some(res.id.as_str()) {
                st.handshake_id = None;
            }
            st.pending.remove(&res.id)
        };
        let Some(pending) = pending else {
            return;
        };
        pending.timer.abort();

        let result = if res.ok {
            Ok(res.payload.unwrap_or(Value::Null))
        } else {
            Err(res.error.map_or_else(
                || RpcError::Server {
                    code: "UNAVAILABLE".to_string(),
                    message: "request failed".to_string(),
                    details: None,
                },
                |e| RpcError::Server {
                    code: e.code,
                    message: e.message,
                    details: e.details,
                },
            ))
        };
        let _ = pending.tx.send(result);
    }

    /// Resolves the in-flight `connect` request with a connection-level
    /// `hello-ok`. A later `res` for the same id is dropped as unknown.
    fn complete_handshake(&self, conn_id: u64, body: Map<String, Value>) {
        let pending = {
            let mut st = self.lock();
            if !Self::is_current(&st, conn_id) || st.connected {
                debug!("ignoring unexpected hello-ok");
                return;
            }
            let Some(id) = st.handshake_id.take() else {
                debug!("ignoring hello-ok with no connect in flight");
                return;
            };
            st.pending.remove(&id)
        };
        let Some(pending) = pending else {
            return;
        };
        pending.timer.abort();
        let _ = pending.tx.send(Ok(Value::Object(body)));
    }

    fn close_connection(&self, conn_id: u64, code: u16, reason: String) {
        let st = self.lock();
        if let Some(conn) = st.conn.as_ref().filter(|c| c.id == conn_id) {
            let _ = conn.tx.send(Outbound::Close { code, reason });
        }
    }

    fn begin_handshake(self: &Arc<Self>, conn_id: u64, nonce: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = match inner.connect_params(&nonce) {
                Ok(params) => {
                    let opts = RequestOptions {
                        timeout: inner.opts.connect_timeout,
                        expect_final: false,
                    };
                    inner
                        .send_request(
                            types::CONNECT_METHOD,
                            Some(params),
                            opts,
                            Gate::Bootstrap(conn_id),
                        )
                        .await
                        .and_then(|payload| inner.accept_hello(payload))
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(hello) => inner.on_connected(conn_id, hello),
                Err(RpcError::Stopped) => {}
                Err(e) => {
                    warn!(error = %e, "gateway handshake failed");
                    inner.notify(ClientNotice::ConnectError(e.to_string()));
                    inner.close_connection(conn_id, CLOSE_POLICY, "connect failed".to_string());
                }
            }
        });
    }

    fn connect_params(&self, nonce: &str) -> Result<Value, RpcError> {
        let opts = &self.opts;
        let device = self.identity.as_ref().map(|identity| {
            let signed_at = crypto::unix_now_ms();
            let payload = crypto::device_auth_payload(&DeviceAuthParams {
                device_id: identity.device_id(),
                client_id: &opts.client_id,
                client_mode: &opts.mode,
                role: &opts.role,
                scopes: &opts.scopes,
                signed_at_ms: signed_at,
                token: opts.token.as_deref(),
                nonce: Some(nonce),
            });
            DeviceProof {
                id: identity.device_id().to_string(),
                public_key: identity.public_key_encoded(),
                signature: identity.sign(payload.as_bytes()),
                signed_at,
                nonce: nonce.to_string(),
            }
        });
        let auth = (opts.token.is_some() || opts.password.is_some()).then(|| ConnectAuth {
            token: opts.token.as_deref(),
            password: opts.password.as_deref(),
        });

        let params = ConnectParams {
            min_protocol: opts.min_protocol,
            max_protocol: opts.max_protocol,
            client: ClientInfo {
                id: &opts.client_id,
                display_name: opts.display_name.as_deref(),
                version: &opts.client_version,
                platform: &opts.platform,
                mode: &opts.mode,
                instance_id: opts.instance_id.as_deref(),
            },
            role: &opts.role,
            scopes: &opts.scopes,
            caps: &opts.caps,
            auth,
            device,
        };
        serde_json::to_value(params).map_err(|e| RpcError::Handshake(e.to_string()))
    }

    fn accept_hello(&self, payload: Value) -> Result<HelloOk, RpcError> {
        let hello: HelloOk = serde_json::from_value(payload)
            .map_err(|e| RpcError::Handshake(format!("malformed hello: {e}")))?;
        if let Some(protocol) = hello.protocol {
            if protocol < self.opts.min_protocol || protocol > self.opts.max_protocol {
                return Err(RpcError::Handshake(format!(
                    "protocol mismatch: server speaks {protocol}, client supports {}..={}",
                    self.opts.min_protocol, self.opts.max_protocol
                )));
            }
        }
        Ok(hello)
    }

    fn on_connected(&self, conn_id: u64, hello: HelloOk) {
        {
            let mut st = self.lock();
            let Some(conn) = st.conn.as_ref().filter(|c| c.id == conn_id) else {
                return;
            };
            let tick = hello
                .policy
                .as_ref()
                .and_then(|p| p.tick_interval_ms)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);
            if let Some(tick) = tick {
                let _ = conn.tx.send(Outbound::Watchdog(tick));
            }
            st.connected = true;
            st.backoff.reset();
        }
        self.status_tx.send_replace(ConnStatus::Connected);
        info!(protocol = ?hello.protocol, "connected to gateway");
        self.notify(ClientNotice::Connected(hello));
    }

    async fn send_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        opts: RequestOptions,
        gate: Gate,
    ) -> Result<Value, RpcError> {
        let rx = {
            let mut st = self.lock();
            let allowed = match gate {
                Gate::Connected => st.connected,
                Gate::Bootstrap(conn_id) => {
                    st.conn.as_ref().is_some_and(|c| c.id == conn_id && c.open)
                }
            };
            let conn = match st.conn.as_ref() {
                Some(conn) if allowed => conn,
                _ => return Err(RpcError::NotConnected),
            };

            let id = new_request_id();
            let text = Frame::request(id.clone(), method, params).serialize();
            if conn.tx.send(Outbound::Text(text)).is_err() {
                return Err(RpcError::Send("connection writer closed".to_string()));
            }

            let (tx, rx) = oneshot::channel();
            let timer = {
                let inner: Weak<Self> = Arc::downgrade(self);
                let id = id.clone();
                let method = method.to_string();
                let timeout = opts.timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = inner.upgrade() {
                        inner.expire(&id, method, timeout);
                    }
                })
            };
            if matches!(gate, Gate::Bootstrap(_)) {
                st.handshake_id = Some(id.clone());
            }
            st.pending.insert(
                id,
                PendingRequest {
                    expect_final: opts.expect_final,
                    tx,
                    timer,
                },
            );
            rx
        };

        rx.await.unwrap_or(Err(RpcError::Stopped))
    }

    fn expire(&self, id: &str, method: String, timeout: Duration) {
        let pending = self.lock().pending.remove(id);
        if let Some(pending) = pending {
            debug!(id, %method, "request timed out");
            let _ = pending.tx.send(Err(RpcError::Timeout { method, timeout }));
        }
    }

    fn on_close(self: &Arc<Self>, conn_id: u64, code: u16, reason: String) {
        let (pending, err, reconnect) = {
            let mut st = self.lock();
            if !Self::is_current(&st, conn_id) {
                return;
            }
            let was_connected = st.connected;
            st.conn = None;
            st.connected = false;
            st.handshake_id = None;

            let pending: Vec<PendingRequest> = st.pending.drain().map(|(_, p)| p).collect();
            let err = if was_connected {
                RpcError::ConnectionClosed {
                    code,
                    reason: reason.clone(),
                }
            } else {
                RpcError::ClosedBeforeConnect {
                    code,
                    reason: reason.clone(),
                }
            };

            let reconnect = (!st.closed && self.opts.auto_reconnect).then(|| {
                let delay = st.backoff.next_delay();
                let attempt = st.backoff.attempt();
                if let Some(timer) = st.reconnect_timer.take() {
                    timer.abort();
                }
                let inner = Arc::clone(self);
                st.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.reconnect_due();
                }));
                (attempt, delay)
            });
            (pending, err, reconnect)
        };

        for p in pending {
            p.timer.abort();
            let _ = p.tx.send(Err(err.clone()));
        }
        self.status_tx.send_replace(ConnStatus::Disconnected);
        warn!(code, %reason, "gateway connection closed");
        self.notify(ClientNotice::Closed { code, reason });

        if let Some((attempt, delay)) = reconnect {
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to gateway");
            self.notify(ClientNotice::Reconnecting { attempt, delay });
        }
    }

    fn reconnect_due(self: &Arc<Self>) {
        let mut st = self.lock();
        // Dropping our own handle detaches it; the task is about to finish.
        st.reconnect_timer = None;
        if st.closed || st.conn.is_some() {
            return;
        }
        self.connect_locked(&mut st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| new_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn error_codes() {
        assert_eq!(RpcError::NotConnected.code(), "NOT_CONNECTED");
        assert_eq!(
            RpcError::Timeout {
                method: "health".into(),
                timeout: Duration::from_millis(50)
            }
            .code(),
            "TIMEOUT"
        );
        assert_eq!(
            RpcError::Handshake("x".into()).code(),
            error_code::HANDSHAKE_FAILED
        );
        assert_eq!(RpcError::Send("x".into()).code(), error_code::SEND_FAILED);
        let server = RpcError::Server {
            code: "INVALID_REQUEST".into(),
            message: "bad".into(),
            details: None,
        };
        assert_eq!(server.code(), "INVALID_REQUEST");
        assert_eq!(server.to_string(), "bad");
    }

    #[test]
    fn connect_params_without_identity_or_auth() {
        let (client, _rx) = RpcClient::new(ClientOptions::new("ws://127.0.0.1:1"), None);
        let params = client.inner.connect_params("n").unwrap();
        assert_eq!(params["minProtocol"], 3);
        assert_eq!(params["maxProtocol"], 3);
        assert_eq!(params["client"]["id"], "gateway-client");
        assert_eq!(params["role"], "operator");
        assert!(params.get("auth").is_none());
        assert!(params.get("device").is_none());
        assert!(params["client"].get("displayName").is_none());
    }

    #[test]
    fn connect_params_sign_nonce_and_token() {
        let identity = Arc::new(DeviceIdentity::from_signing_key(
            ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]),
        ));
        let mut opts = ClientOptions::new("ws://127.0.0.1:1");
        opts.token = Some("secret".into());
        let (client, _rx) = RpcClient::new(opts.clone(), Some(Arc::clone(&identity)));
        let params = client.inner.connect_params("nonce-7").unwrap();

        assert_eq!(params["auth"]["token"], "secret");
        assert!(params["auth"].get("password").is_none());
        let device = &params["device"];
        assert_eq!(device["id"], identity.device_id());
        assert_eq!(device["nonce"], "nonce-7");

        let signed_at = device["signedAt"].as_u64().unwrap();
        let payload = crypto::device_auth_payload(&DeviceAuthParams {
            device_id: identity.device_id(),
            client_id: &opts.client_id,
            client_mode: &opts.mode,
            role: &opts.role,
            scopes: &opts.scopes,
            signed_at_ms: signed_at,
            token: Some("secret"),
            nonce: Some("nonce-7"),
        });
        assert!(crypto::verify_device_signature(
            device["publicKey"].as_str().unwrap(),
            payload.as_bytes(),
            device["signature"].as_str().unwrap(),
        ));
    }

    #[test]
    fn hello_with_foreign_protocol_is_rejected() {
        let (client, _rx) = RpcClient::new(ClientOptions::new("ws://127.0.0.1:1"), None);
        let err = client
            .inner
            .accept_hello(serde_json::json!({ "type": "hello-ok", "protocol": 2 }))
            .unwrap_err();
        assert!(matches!(err, RpcError::Handshake(_)));

        let hello = client
            .inner
            .accept_hello(serde_json::json!({
                "type": "hello-ok",
                "protocol": 3,
                "policy": { "tickIntervalMs": 15000 },
                "auth": { "role": "operator", "scopes": ["operator.admin"] }
            }))
            .unwrap();
        assert_eq!(hello.policy.unwrap().tick_interval_ms, Some(15_000));
        assert_eq!(hello.auth.unwrap().scopes, vec!["operator.admin".to_string()]);
    }

    #[tokio::test]
    async fn handshake_request_is_bound_to_its_connection() {
        let (client, _rx) = RpcClient::new(ClientOptions::new("ws://127.0.0.1:1"), None);
        let (tx, mut out_rx) = mpsc::unbounded_channel();
        client.inner.lock().conn = Some(Connection {
            id: 2,
            tx,
            open: true,
        });

        let err = client
            .inner
            .send_request(
                types::CONNECT_METHOD,
                None,
                RequestOptions::default(),
                Gate::Bootstrap(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NotConnected);
        assert!(out_rx.try_recv().is_err());
        assert_eq!(client.status().pending, 0);
        assert!(client.inner.lock().handshake_id.is_none());
    }

    #[tokio::test]
    async fn request_before_start_is_not_connected() {
        let (client, _rx) = RpcClient::new(ClientOptions::new("ws://127.0.0.1:1"), None);
        let err = client.request("health", None).await.unwrap_err();
        assert_eq!(err, RpcError::NotConnected);
        assert_eq!(client.status().pending, 0);
    }
}
