use std::{io, path::PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::nautica::config;

/// Crates that log every frame or request at debug level. Kept at `warn`
/// unless `RUST_LOG` says otherwise.
const QUIET_DEPS: &[&str] = &["hyper", "hyper_util", "tungstenite", "tokio_tungstenite", "reqwest"];

/// Keeps the non-blocking log writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogOutput {
    fn parse(output: &str) -> Self {
        match output.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            path => LogOutput::File(PathBuf::from(path)),
        }
    }

    fn writer(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        Ok(match self {
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Discard => tracing_appender::non_blocking(io::sink()),
            LogOutput::File(p) => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .with_context(|| format!("logging: open {}", p.display()))?;
                tracing_appender::non_blocking(file)
            }
        })
    }
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&logging.level)))
        .context("logging: init filter")?;

    let output = LogOutput::parse(&logging.output);
    let (writer, guard) = output.writer()?;

    let json = logging.format.trim().eq_ignore_ascii_case("json");
    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json && output == LogOutput::Stderr)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if json {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

/// Maps a configured level name onto a filter directive; unknown names mean `info`.
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// The configured level for nautica, with chatty dependencies capped at `warn`.
/// At `error` the cap would raise them, so it is skipped.
fn default_directives(level: &str) -> String {
    let level = level_directive(level);
    let mut out = level.to_string();
    if level != "error" {
        for dep in QUIET_DEPS {
            out.push_str(&format!(",{dep}=warn"));
        }
    }
    out
}
