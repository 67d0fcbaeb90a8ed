use std::sync::Arc;

use async_trait::async_trait;

use crate::nautica::bridge::channel::Channel;

/// Opens the outbound half of a tunnel session.
///
/// Exactly one strategy is active per process; both hand back the same
/// [`Channel`] abstraction so the relay loop never knows which one it got.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dial(&self, host: &str, port: u16) -> anyhow::Result<Channel>;
}

pub type SharedDialer = Arc<dyn Dialer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Raw TCP stream to the target.
    Tcp,
    /// Nested WebSocket connection to `ws://host:port`.
    Ws,
}

#[derive(Debug, Clone)]
pub struct DialOptions {
    pub buffer_size: usize,
}

pub fn parse_strategy(name: &str) -> anyhow::Result<Strategy> {
    let n = name.trim().to_ascii_lowercase();
    match n.as_str() {
        "" | "tcp" => Ok(Strategy::Tcp),
        "ws" | "websocket" => Ok(Strategy::Ws),
        _ => anyhow::bail!("bridge: unknown dial strategy {name:?} (expected tcp|ws)"),
    }
}

pub mod tcp;
pub mod ws;

pub fn dialer_by_name(name: &str, opts: DialOptions) -> anyhow::Result<SharedDialer> {
    match parse_strategy(name)? {
        Strategy::Tcp => Ok(Arc::new(tcp::TcpDialer::new(opts.buffer_size))),
        Strategy::Ws => Ok(Arc::new(ws::WsDialer::new())),
    }
}
