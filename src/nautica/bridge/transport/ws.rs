use anyhow::Context;
use async_trait::async_trait;

use crate::nautica::{
    bridge::{
        channel::{self, Channel},
        transport::Dialer,
    },
    net,
};

/// Nested-tunnel strategy: each session opens its own WebSocket to `ws://host:port`
/// and maps messages one-to-one.
#[derive(Debug, Default)]
pub struct WsDialer;

impl WsDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for WsDialer {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn dial(&self, host: &str, port: u16) -> anyhow::Result<Channel> {
        let url = format!("ws://{}", net::authority(host, port));
        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("websocket connect {url}"))?;
        Ok(channel::ws_channel(ws))
    }
}
