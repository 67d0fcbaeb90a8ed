mod nautica;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "nautica",
    version,
    about = "Nautica - WebSocket tunnel bridge with an account and subscription API"
)]
struct Cli {
    /// Path to Nautica config file (.toml/.yaml/.yml). If omitted, uses NAUTICA_CONFIG; then auto-detects nautica.toml > nautica.yaml > nautica.yml from CWD; then falls back to the OS default path (Linux: /etc/nautica/nautica.toml; others: user config dir).
    #[arg(long, env = "NAUTICA_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    nautica::run(cli.config).await
}
