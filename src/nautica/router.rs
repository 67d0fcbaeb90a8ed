use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use regex::Regex;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        self,
        error::ProtocolError,
        handshake::{
            machine::TryParse,
            server::{Request, create_response, write_response},
        },
        http::{HeaderValue, Uri, header::SEC_WEBSOCKET_PROTOCOL},
        protocol::Role,
    },
};

use crate::nautica::{
    bridge::{
        channel,
        session::{SessionOptions, SessionReport, TunnelSession},
        transport::SharedDialer,
    },
    telemetry,
};

/// Where an accepted upgrade should be relayed to. Derived from the request
/// path and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub host: String,
    pub port: u16,
    /// Client-supplied `Sec-WebSocket-Protocol` value. Carried along, never checked.
    pub protocol_hint: Option<String>,
}

impl TunnelRequest {
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("path {0:?} does not match /{{host}}-{{port}}")]
    NoMatch(String),
    #[error("port {0} out of range")]
    PortOutOfRange(String),
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("websocket handshake: {0}")]
    Handshake(#[from] tungstenite::Error),
}

/// Maps upgrade request paths onto tunnel sessions.
///
/// The only state is the compiled path pattern and the configured dial
/// strategy; sessions share nothing else.
#[derive(Clone)]
pub struct UpgradeRouter {
    pattern: Regex,
    dialer: SharedDialer,
    opts: SessionOptions,
}

impl UpgradeRouter {
    pub fn new(dialer: SharedDialer, opts: SessionOptions) -> anyhow::Result<Self> {
        // Host may not contain '-', so hyphenated host names never match.
        let pattern = Regex::new(r"^/([^-]+)-([0-9]+)$").context("router: compile path pattern")?;
        Ok(Self {
            pattern,
            dialer,
            opts,
        })
    }

    pub fn dialer_name(&self) -> &'static str {
        self.dialer.name()
    }

    /// Extracts the tunnel target from a request target (origin or absolute form).
    /// Query strings are ignored.
    pub fn route(
        &self,
        request_target: &str,
        protocol_hint: Option<&str>,
    ) -> Result<TunnelRequest, RoutingError> {
        let path = request_target
            .parse::<Uri>()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| request_target.split('?').next().unwrap_or("").to_string());

        let caps = self
            .pattern
            .captures(&path)
            .ok_or_else(|| RoutingError::NoMatch(path.clone()))?;
        let host = caps[1].to_string();
        let port = caps[2]
            .parse::<u16>()
            .map_err(|_| RoutingError::PortOutOfRange(caps[2].to_string()))?;

        Ok(TunnelRequest {
            host,
            port,
            protocol_hint: protocol_hint.map(str::to_string),
        })
    }

    /// Handles one upgrade request whose head has already been read into `head`.
    /// `head` may run past the end of the request head; the extra bytes are
    /// replayed as WebSocket frames.
    ///
    /// On a routing failure the socket is dropped before any byte is written.
    /// Otherwise the WebSocket handshake is completed and the session is spawned;
    /// this returns as soon as the session task is running.
    pub async fn handle_upgrade(
        &self,
        stream: TcpStream,
        head: Bytes,
        request_target: &str,
        protocol_hint: Option<&str>,
        peer: SocketAddr,
    ) -> Result<JoinHandle<SessionReport>, UpgradeError> {
        let request = match self.route(request_target, protocol_hint) {
            Ok(r) => r,
            Err(err) => {
                metrics::counter!(telemetry::UPGRADES_TOTAL, "result" => "rejected").increment(1);
                tracing::debug!(peer = %peer, err = %err, "router: upgrade rejected");
                drop(stream);
                return Err(err.into());
            }
        };

        let ws = match accept(stream, &head).await {
            Ok(ws) => ws,
            Err(err) => {
                metrics::counter!(telemetry::UPGRADES_TOTAL, "result" => "rejected").increment(1);
                tracing::debug!(peer = %peer, err = %err, "router: handshake failed");
                return Err(err.into());
            }
        };

        metrics::counter!(telemetry::UPGRADES_TOTAL, "result" => "accepted").increment(1);

        let sid = telemetry::new_session_id();
        if let Some(hint) = request.protocol_hint.as_deref() {
            tracing::debug!(sid = %sid, hint = %hint, "router: protocol hint (unchecked)");
        }
        tracing::debug!(sid = %sid, peer = %peer, target = %request.target(), "router: upgrade accepted");

        let dialer = self.dialer.clone();
        let session = TunnelSession::new(sid, request, self.opts.clone());
        Ok(tokio::spawn(async move {
            session.run(channel::ws_channel(ws), dialer.as_ref()).await
        }))
    }
}

/// Completes the server handshake for a head that has already been read.
/// Bytes the client sent after the head are the start of the frame stream.
async fn accept(
    mut stream: TcpStream,
    head: &[u8],
) -> tungstenite::Result<WebSocketStream<TcpStream>> {
    let (consumed, req) = Request::try_parse(head)?
        .ok_or(tungstenite::Error::Protocol(ProtocolError::HandshakeIncomplete))?;

    let mut resp = create_response(&req)?;
    if let Some(first) = first_subprotocol(req.headers().get(SEC_WEBSOCKET_PROTOCOL)) {
        if let Ok(v) = HeaderValue::from_str(&first) {
            resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, v);
        }
    }

    let mut out = Vec::with_capacity(256);
    write_response(&mut out, &resp)?;
    stream.write_all(&out).await?;

    let tail = head[consumed..].to_vec();
    Ok(WebSocketStream::from_partially_read(stream, tail, Role::Server, None).await)
}

fn first_subprotocol(v: Option<&HeaderValue>) -> Option<String> {
    let s = v?.to_str().ok()?;
    s.split(',')
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(str::to_string)
}
