use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use hyper::server::conn::http1;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::nautica::{net, router::UpgradeRouter};

/// What the first request on a connection asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum HeadInspect {
    NeedMore,
    NotHttp,
    Http,
    Upgrade {
        request_target: String,
        protocol_hint: Option<String>,
    },
}

/// Classifies a (possibly partial) HTTP/1 request head.
pub fn inspect_head(buf: &[u8]) -> HeadInspect {
    let Some(end) = find_header_end(buf) else {
        return HeadInspect::NeedMore;
    };
    let Ok(head) = std::str::from_utf8(&buf[..end]) else {
        return HeadInspect::NotHttp;
    };

    let mut lines = head.split("\r\n");
    let mut parts = lines.next().unwrap_or("").split_whitespace();
    let _method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if target.is_empty() || !version.starts_with("HTTP/1.") {
        return HeadInspect::NotHttp;
    }

    let mut upgrade = false;
    let mut connection_upgrade = false;
    let mut protocol_hint = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade |= !value.is_empty(),
            "connection" => {
                connection_upgrade |= value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            }
            "sec-websocket-protocol" if !value.is_empty() => {
                protocol_hint = Some(value.to_string())
            }
            _ => {}
        }
    }

    if upgrade && connection_upgrade {
        HeadInspect::Upgrade {
            request_target: target.to_string(),
            protocol_hint,
        }
    } else {
        HeadInspect::Http
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Reads until the request head is complete. `Ok(None)` means the peer went
/// away, sent something that is not HTTP, or exceeded `max_header`.
async fn read_head(
    conn: &mut TcpStream,
    captured: &mut BytesMut,
    max_header: usize,
) -> std::io::Result<Option<HeadInspect>> {
    loop {
        if captured.len() >= max_header {
            return Ok(None);
        }
        let n = (&mut *conn)
            .take((max_header - captured.len()) as u64)
            .read_buf(captured)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        match inspect_head(captured) {
            HeadInspect::NeedMore => continue,
            HeadInspect::NotHttp => return Ok(None),
            other => return Ok(Some(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrontendOptions {
    pub max_header_bytes: usize,
    /// Zero disables the limit.
    pub handshake_timeout: Duration,
}

/// The single public listener: tunnel upgrades go to the [`UpgradeRouter`],
/// everything else that parses as HTTP goes to the API.
#[derive(Clone)]
pub struct Frontend {
    router: UpgradeRouter,
    api: axum::Router,
    opts: FrontendOptions,
}

impl Frontend {
    pub fn new(router: UpgradeRouter, api: axum::Router, opts: FrontendOptions) -> Self {
        Self { router, api, opts }
    }

    async fn handle(&self, mut conn: TcpStream, peer: SocketAddr) {
        let max_header = if self.opts.max_header_bytes == 0 {
            64 * 1024
        } else {
            self.opts.max_header_bytes
        };

        let mut captured = BytesMut::with_capacity(4096.min(max_header));
        let read_fut = read_head(&mut conn, &mut captured, max_header);

        let inspected = if self.opts.handshake_timeout > Duration::ZERO {
            match time::timeout(self.opts.handshake_timeout, read_fut).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::debug!(peer = %peer, "frontend: handshake timeout");
                    return;
                }
            }
        } else {
            read_fut.await
        };

        let kind = match inspected {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                tracing::debug!(peer = %peer, bytes = captured.len(), "frontend: not an http request, dropping");
                return;
            }
            Err(err) => {
                tracing::debug!(peer = %peer, err = %err, "frontend: read failed");
                return;
            }
        };

        let head: Bytes = captured.freeze();
        match kind {
            HeadInspect::Upgrade {
                request_target,
                protocol_hint,
            } => {
                // Failures are already counted and logged by the router.
                let _ = self
                    .router
                    .handle_upgrade(conn, head, &request_target, protocol_hint.as_deref(), peer)
                    .await;
            }
            _ => {
                let io = TokioIo::new(net::PrefixedStream::new(head, conn));
                let svc = TowerToHyperService::new(self.api.clone());
                if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                    tracing::debug!(peer = %peer, err = %err, "frontend: http connection ended");
                }
            }
        }
    }
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    frontend: Frontend,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, dial = frontend.router.dialer_name(), "frontend: listening");

    serve_listener(ln, frontend, shutdown).await
}

pub async fn serve_listener(
    ln: TcpListener,
    frontend: Frontend,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let frontend = Arc::new(frontend);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "frontend: accept failed");
                        time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let f = frontend.clone();
                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(peer = %peer, "frontend: accepted");
                    }
                    f.handle(conn, peer).await;
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};

    use super::*;
    use crate::nautica::bridge::{
        session::SessionOptions,
        transport::{self, DialOptions},
    };

    #[test]
    fn inspect_head_classifies_requests() {
        assert_eq!(inspect_head(b"GET / HTTP/1.1\r\nHost: x\r\n"), HeadInspect::NeedMore);
        assert_eq!(inspect_head(b"\x16\x03\x01\x02\x00\r\n\r\n"), HeadInspect::NotHttp);
        assert_eq!(inspect_head(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n"), HeadInspect::Http);
        assert_eq!(
            inspect_head(b"GET /1.1.1.1-443 HTTP/1.1\r\nUpgrade: websocket\r\nHost: x\r\n\r\n"),
            HeadInspect::Http
        );
        assert_eq!(
            inspect_head(
                b"GET /1.1.1.1-443?ed=1 HTTP/1.1\r\nHost: x\r\nConnection: keep-alive, Upgrade\r\nupgrade: websocket\r\nSec-WebSocket-Protocol: abc\r\n\r\n"
            ),
            HeadInspect::Upgrade {
                request_target: "/1.1.1.1-443?ed=1".into(),
                protocol_hint: Some("abc".into()),
            }
        );
    }

    async fn start(dial: &str) -> (SocketAddr, watch::Sender<bool>) {
        let dialer = transport::dialer_by_name(dial, DialOptions { buffer_size: 32 * 1024 }).unwrap();
        let router = UpgradeRouter::new(
            dialer,
            SessionOptions {
                dial_timeout: Duration::from_secs(2),
                close_timeout: Duration::from_secs(1),
            },
        )
        .unwrap();
        let api = axum::Router::new().route("/health", axum::routing::get(|| async { "ok" }));
        let frontend = Frontend::new(
            router,
            api,
            FrontendOptions {
                max_header_bytes: 1024,
                handshake_timeout: Duration::from_secs(1),
            },
        );

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve_listener(ln, frontend, rx));
        (addr, tx)
    }

    /// TCP target that answers every chunk "PING" with "PONG" and records what it saw.
    async fn pong_target() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let h = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = s.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
                if seen.ends_with(b"PING") {
                    s.write_all(b"PONG").await.unwrap();
                }
            }
            seen
        });
        (addr, h)
    }

    #[tokio::test]
    async fn upgrade_relays_ping_pong_to_tcp_target() {
        let (target, seen) = pong_target().await;
        let (addr, _tx) = start("tcp").await;

        let url = format!("ws://{addr}/127.0.0.1-{}", target.port());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(Message::binary(&b"PING"[..])).await.unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data().as_ref(), b"PONG");

        ws.close(None).await.unwrap();
        let seen = time::timeout(Duration::from_secs(2), seen).await.unwrap().unwrap();
        assert_eq!(seen, b"PING");
    }

    #[tokio::test]
    async fn upgrade_echoes_first_offered_subprotocol() {
        let (target, _seen) = pong_target().await;
        let (addr, _tx) = start("tcp").await;

        let mut req = format!("ws://{addr}/127.0.0.1-{}", target.port())
            .into_client_request()
            .unwrap();
        req.headers_mut().insert(
            "sec-websocket-protocol",
            "5d3f1c8e-0000-4000-8000-000000000000".parse().unwrap(),
        );
        let (_ws, resp) = tokio_tungstenite::connect_async(req).await.unwrap();
        assert_eq!(
            resp.headers().get("sec-websocket-protocol").unwrap(),
            "5d3f1c8e-0000-4000-8000-000000000000"
        );
    }

    #[tokio::test]
    async fn frame_sent_with_upgrade_head_is_relayed() {
        let (target, seen) = pong_target().await;
        let (addr, _tx) = start("tcp").await;

        let mut bytes = format!(
            "GET /127.0.0.1-{} HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            target.port()
        )
        .into_bytes();
        // Masked binary frame carrying "PING".
        let mask = [1u8, 2, 3, 4];
        bytes.extend_from_slice(&[0x82, 0x84]);
        bytes.extend_from_slice(&mask);
        bytes.extend(b"PING".iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(&bytes).await.unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        let pong = [0x82u8, 0x04, b'P', b'O', b'N', b'G'];
        time::timeout(Duration::from_secs(3), async {
            while !got.ends_with(&pong) {
                let n = s.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed early: {got:?}");
                got.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .unwrap();
        assert!(got.starts_with(b"HTTP/1.1 101"), "{got:?}");

        drop(s);
        let seen = time::timeout(Duration::from_secs(3), seen).await.unwrap().unwrap();
        assert_eq!(seen, b"PING");
    }

    #[tokio::test]
    async fn non_matching_path_is_dropped_without_response() {
        let (addr, _tx) = start("tcp").await;

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(
            b"GET /not-a-valid-target HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

        let mut got = Vec::new();
        let res = time::timeout(Duration::from_secs(2), s.read_to_end(&mut got)).await.unwrap();
        // Either a clean EOF or a reset; never a handshake response.
        assert!(res.is_err() || got.is_empty(), "unexpected response: {got:?}");
    }

    #[tokio::test]
    async fn dial_failure_closes_client_without_data() {
        // Reserve a port and release it so nothing listens there.
        let port = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap().port()
        };
        let (addr, _tx) = start("tcp").await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/127.0.0.1-{port}"))
            .await
            .unwrap();

        let next = time::timeout(Duration::from_secs(3), ws.next()).await.unwrap();
        match next {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
            Some(Ok(other)) => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_close_closes_target_connection() {
        let (target, seen) = pong_target().await;
        let (addr, _tx) = start("tcp").await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/127.0.0.1-{}", target.port()))
                .await
                .unwrap();
        ws.send(Message::binary(&b"hello"[..])).await.unwrap();
        ws.close(None).await.unwrap();

        // The target sees EOF within the bound once the bridge closes its side.
        let seen = time::timeout(Duration::from_secs(3), seen).await.unwrap().unwrap();
        assert_eq!(seen, b"hello");
    }

    #[tokio::test]
    async fn nested_ws_dial_relays_messages() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let (s, _) = ln.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(s).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_binary() || msg.is_text() {
                    let mut out = b"echo:".to_vec();
                    out.extend_from_slice(&msg.into_data());
                    ws.send(Message::binary(out)).await.unwrap();
                }
            }
        });
        let (addr, _tx) = start("ws").await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/127.0.0.1-{}", target.port()))
                .await
                .unwrap();
        ws.send(Message::binary(&b"PING"[..])).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data().as_ref(), b"echo:PING");
    }

    #[tokio::test]
    async fn plain_http_goes_to_api() {
        let (addr, _tx) = start("tcp").await;

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"GET /health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut got = String::new();
        s.read_to_string(&mut got).await.unwrap();
        assert!(got.starts_with("HTTP/1.1 200"), "{got}");
        assert!(got.ends_with("ok"), "{got}");
    }

    #[tokio::test]
    async fn garbage_is_dropped() {
        let (addr, _tx) = start("tcp").await;

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"\x16\x03\x01\x00\x05hello\r\n\r\n").await.unwrap();
        let mut got = Vec::new();
        let _ = time::timeout(Duration::from_secs(2), s.read_to_end(&mut got)).await.unwrap();
        assert!(got.is_empty());
    }
}
