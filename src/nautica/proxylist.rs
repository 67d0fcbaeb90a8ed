use std::{sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// One relay target from a published proxy list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRecord {
    pub id: u64,
    #[serde(rename = "proxyIP")]
    pub proxy_ip: String,
    pub proxy_port: String,
    pub country: String,
    pub org: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Parses `IP,Port,Country,ORG` lines. Blank lines are skipped before ids are
/// assigned; lines without an IP or port are dropped after.
pub fn parse_proxy_list(text: &str) -> Vec<ProxyRecord> {
    text.split('\n')
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .filter_map(|(i, line)| {
            let mut fields = line.split(',').map(str::trim);
            let field = |v: Option<&str>, default: &str| match v {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => default.to_string(),
            };
            let proxy_ip = field(fields.next(), "");
            let proxy_port = field(fields.next(), "");
            if proxy_ip.is_empty() || proxy_port.is_empty() {
                return None;
            }
            Some(ProxyRecord {
                id: i as u64 + 1,
                proxy_ip,
                proxy_port,
                country: field(fields.next(), "Unknown"),
                org: field(fields.next(), "Unknown Org"),
                kind: "proxy".to_string(),
            })
        })
        .collect()
}

pub fn fallback_proxies() -> Vec<ProxyRecord> {
    [
        ("203.194.112.119", "8443", "ID", "Indonesia Proxy"),
        ("1.1.1.1", "443", "SG", "Singapore Proxy"),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (ip, port, country, org))| ProxyRecord {
        id: i as u64 + 1,
        proxy_ip: ip.to_string(),
        proxy_port: port.to_string(),
        country: country.to_string(),
        org: org.to_string(),
        kind: "proxy".to_string(),
    })
    .collect()
}

/// Current proxy list. Readers never block a refresh.
#[derive(Debug, Default)]
pub struct ProxyListStore {
    inner: ArcSwap<Vec<ProxyRecord>>,
}

pub type SharedProxyList = Arc<ProxyListStore>;

impl ProxyListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<ProxyRecord>> {
        self.inner.load_full()
    }

    pub fn replace(&self, list: Vec<ProxyRecord>) {
        self.inner.store(Arc::new(list));
    }

    pub fn find(&self, id: u64) -> Option<ProxyRecord> {
        self.inner.load().iter().find(|p| p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }
}

pub struct ProxyListSource {
    client: reqwest::Client,
    sources: Vec<String>,
}

impl ProxyListSource {
    pub fn new(sources: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("proxy list: build http client")?;
        Ok(Self { client, sources })
    }

    async fn fetch_one(&self, url: &str) -> anyhow::Result<Vec<ProxyRecord>> {
        let body = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {url}"))?
            .text()
            .await
            .with_context(|| format!("read body {url}"))?;
        Ok(parse_proxy_list(&body))
    }

    /// Tries each source in order; the first one yielding at least one record wins.
    pub async fn fetch(&self) -> Option<(String, Vec<ProxyRecord>)> {
        for url in &self.sources {
            match self.fetch_one(url).await {
                Ok(list) if !list.is_empty() => return Some((url.clone(), list)),
                Ok(_) => tracing::warn!(source = %url, "proxy list: source returned no usable records"),
                Err(err) => {
                    tracing::warn!(source = %url, err = %format!("{err:#}"), "proxy list: fetch failed")
                }
            }
        }
        None
    }

    /// Fetches and installs a list into `store`, falling back to the built-in
    /// list when every source fails.
    pub async fn refresh(&self, store: &ProxyListStore) {
        match self.fetch().await {
            Some((url, list)) => {
                tracing::info!(source = %url, proxies = list.len(), "proxy list: loaded");
                store.replace(list);
            }
            None => {
                tracing::warn!("proxy list: all sources failed, using fallback list");
                store.replace(fallback_proxies());
            }
        }
    }
}
