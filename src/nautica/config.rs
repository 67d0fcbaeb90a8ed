use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::nautica::net;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps NAUTICA_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os("NAUTICA_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("nautica.toml"));
        }
        return Ok(p);
    }

    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["nautica.toml", "nautica.yaml", "nautica.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no nautica.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/nautica/nautica.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("id", "nautica", "nautica")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("nautica.toml"))
    }
}

/// Creates a commented default config at `path` unless something already exists there.
///
/// Returns `true` when a new file was written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_lower(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

fn extension_lower(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = extension_lower(path);
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub domain: String,
    pub public_dir: PathBuf,
    pub logging: LoggingConfig,
    pub bridge: BridgeConfig,
    pub accounts: AccountsConfig,
    pub proxy_list: ProxyListConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Outbound dial strategy: `tcp` (raw stream) or `ws` (nested WebSocket).
    pub dial: String,
    /// Zero disables the dial timeout.
    pub dial_timeout: Duration,
    pub buffer_size: usize,
    pub max_header_bytes: usize,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AccountsConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProxyListConfig {
    pub sources: Vec<String>,
    pub fetch_timeout: Duration,
}

pub const DEFAULT_PROXY_SOURCES: [&str; 3] = [
    "https://raw.githubusercontent.com/FoolVPN-ID/Nautica/refs/heads/main/proxyList.txt",
    "https://raw.githubusercontent.com/Ninadiantea/modevps/main/proxyList.txt",
    "https://raw.githubusercontent.com/mahdibland/ShadowsocksAggregator/master/sub/sub_merge.txt",
];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    domain: String,

    #[serde(default)]
    public_dir: String,

    logging: Option<FileLogging>,

    bridge: Option<FileBridge>,

    accounts: Option<FileAccounts>,

    proxy_list: Option<FileProxyList>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBridge {
    dial: Option<String>,
    dial_timeout_ms: Option<i64>,
    buffer_size: Option<i64>,
    max_header_bytes: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    close_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileAccounts {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileProxyList {
    sources: Option<Vec<String>>,
    fetch_timeout_ms: Option<i64>,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default))
}

fn non_empty(v: Option<&String>, default: &str) -> String {
    match v.map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let b = fc.bridge.as_ref();

        let dial = non_empty(b.and_then(|b| b.dial.as_ref()), "tcp").to_ascii_lowercase();
        crate::nautica::bridge::transport::parse_strategy(&dial)
            .context("config: bridge.dial")?;

        let mut cfg = Config {
            listen_addr: non_empty(Some(&fc.listen_addr), ":3000"),
            domain: non_empty(Some(&fc.domain), "localhost"),
            public_dir: PathBuf::from(non_empty(Some(&fc.public_dir), "public")),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            bridge: BridgeConfig {
                dial,
                dial_timeout: millis(b.and_then(|b| b.dial_timeout_ms), 0),
                buffer_size: b.and_then(|b| b.buffer_size).unwrap_or(0).max(0) as usize,
                max_header_bytes: b.and_then(|b| b.max_header_bytes).unwrap_or(0).max(0)
                    as usize,
                handshake_timeout: millis(b.and_then(|b| b.handshake_timeout_ms), 10_000),
                close_timeout: millis(b.and_then(|b| b.close_timeout_ms), 30_000),
            },
            accounts: AccountsConfig {
                path: PathBuf::from(non_empty(
                    fc.accounts.as_ref().and_then(|a| a.path.as_ref()),
                    "accounts/accounts.json",
                )),
            },
            proxy_list: ProxyListConfig {
                sources: DEFAULT_PROXY_SOURCES.iter().map(|s| s.to_string()).collect(),
                fetch_timeout: millis(
                    fc.proxy_list.as_ref().and_then(|p| p.fetch_timeout_ms),
                    10_000,
                ),
            },
        };

        if cfg.bridge.buffer_size == 0 {
            cfg.bridge.buffer_size = 32 * 1024;
        }
        if cfg.bridge.max_header_bytes == 0 {
            cfg.bridge.max_header_bytes = 64 * 1024;
        }

        if let Some(sources) = fc.proxy_list.as_ref().and_then(|p| p.sources.as_ref()) {
            cfg.proxy_list.sources = sources
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(l) = &fc.logging {
            cfg.logging.level = non_empty(l.level.as_ref(), &cfg.logging.level);
            cfg.logging.format = non_empty(l.format.as_ref(), &cfg.logging.format);
            cfg.logging.output = non_empty(l.output.as_ref(), &cfg.logging.output);
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }

    /// Applies the `PORT` and `DOMAIN` environment overrides the service has always honored.
    pub fn apply_env_overrides(&mut self, port: Option<String>, domain: Option<String>) {
        if let Some(p) = port.map(|p| p.trim().to_string()) {
            if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) {
                self.listen_addr = format!(":{p}");
            }
        }
        if let Some(d) = domain.map(|d| d.trim().to_string()) {
            if !d.is_empty() {
                self.domain = d;
            }
        }
    }

    pub fn listen_port(&self) -> Option<u16> {
        let addr = net::normalize_bind_addr(&self.listen_addr);
        addr.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Nautica configuration (auto-generated)
#
# This file was created because Nautica could not find a configuration file at
# the resolved config path. The defaults below are runnable without edits.
#
# Tunnel clients connect with a WebSocket upgrade to /<host>-<port>; everything
# else on the same port is served by the account/subscription API.

listen_addr = ":3000"
domain = "localhost"
public_dir = "public"

[bridge]
dial = "tcp" # tcp | ws
dial_timeout_ms = 0 # 0 = no timeout
buffer_size = 32768
max_header_bytes = 65536
handshake_timeout_ms = 10000
close_timeout_ms = 30000

[accounts]
path = "accounts/accounts.json"

[proxy_list]
fetch_timeout_ms = 10000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Nautica configuration (auto-generated)
#
# This file was created because Nautica could not find a configuration file at
# the resolved config path. The defaults below are runnable without edits.
#
# Tunnel clients connect with a WebSocket upgrade to /<host>-<port>; everything
# else on the same port is served by the account/subscription API.

listen_addr: ":3000"
domain: "localhost"
public_dir: "public"

bridge:
  dial: "tcp" # tcp | ws
  dial_timeout_ms: 0 # 0 = no timeout
  buffer_size: 32768
  max_header_bytes: 65536
  handshake_timeout_ms: 10000
  close_timeout_ms: 30000

accounts:
  path: "accounts/accounts.json"

proxy_list:
  fetch_timeout_ms: 10000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
