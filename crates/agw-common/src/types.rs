//! Protocol constants for the agent gateway WebSocket protocol.

/// Protocol revision this client speaks. Sent as both `minProtocol` and
/// `maxProtocol` in the connect request.
pub const PROTOCOL_VERSION: u32 = 3;

/// Method name of the handshake request.
pub const CONNECT_METHOD: &str = "connect";

/// Gateway-issued event names the client reacts to.
pub mod event {
    /// First message on every connection; carries the single-use nonce.
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    /// Periodic liveness event, cadence announced in `hello-ok.policy`.
    pub const TICK: &str = "tick";
}

/// Client identifiers recognised by the gateway.
pub mod client_id {
    /// Generic backend client.
    pub const GATEWAY_CLIENT: &str = "gateway-client";
    /// Command line client.
    pub const CLI: &str = "cli";
}

/// Client operating modes.
pub mod client_mode {
    /// Long-running backend process.
    pub const BACKEND: &str = "backend";
    /// Interactive command line invocation.
    pub const CLI: &str = "cli";
}

/// Authorization roles.
pub mod role {
    /// Full operator access.
    pub const OPERATOR: &str = "operator";
}

/// Permission scopes requested by operator clients.
pub mod scope {
    /// Administrative operations.
    pub const ADMIN: &str = "operator.admin";
    /// Approval workflows.
    pub const APPROVALS: &str = "operator.approvals";
    /// Device pairing.
    pub const PAIRING: &str = "operator.pairing";
}

/// Machine-readable error codes produced locally by the client.
pub mod error_code {
    /// Socket is not open or the handshake has not completed.
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    /// No response arrived within the request timeout.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// The connection closed while the request was in flight.
    pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
    /// The client was stopped while the request was in flight.
    pub const CLIENT_STOPPED: &str = "CLIENT_STOPPED";
    /// The handshake produced an unusable result.
    pub const HANDSHAKE_FAILED: &str = "HANDSHAKE_FAILED";
    /// The frame could not be handed to the socket writer.
    pub const SEND_FAILED: &str = "SEND_FAILED";
}

/// WebSocket close code used when the gateway stops sending ticks.
pub const CLOSE_TICK_TIMEOUT: u16 = 4000;
