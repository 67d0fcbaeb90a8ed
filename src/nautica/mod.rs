pub mod accounts;
pub mod api;
pub mod app;
pub mod bridge;
pub mod config;
pub mod links;
pub mod logging;
pub mod net;
pub mod proxylist;
pub mod router;
pub mod server;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
