use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::nautica::bridge::{
    channel::{self, Channel},
    transport::Dialer,
};

/// Direct-stream strategy: bytes are written to and read from a plain TCP connection.
pub struct TcpDialer {
    buffer_size: usize,
}

impl TcpDialer {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, host: &str, port: u16) -> anyhow::Result<Channel> {
        let c = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("tcp connect {host}:{port}"))?;
        Ok(channel::stream_channel(c, self.buffer_size))
    }
}
