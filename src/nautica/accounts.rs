use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfigs {
    pub vless: String,
    pub trojan: String,
    pub shadowsocks: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    pub proxy_name: String,
    pub proxy_country: String,
    pub proxy_org: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub configs: AccountConfigs,
    pub subscription: String,
}

/// Account list persisted as a single JSON snapshot.
#[derive(Debug)]
pub struct AccountStore {
    path: PathBuf,
    accounts: RwLock<Vec<Account>>,
}

impl AccountStore {
    /// Opens the store at `path`, creating its directory. A missing or
    /// unreadable snapshot starts an empty store.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("accounts: mkdir {}", parent.display()))?;
            }
        }

        let accounts = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<Vec<Account>>(&raw) {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(path = %path.display(), err = %err, "accounts: invalid snapshot, starting empty");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                tracing::warn!(path = %path.display(), err = %err, "accounts: unreadable snapshot, starting empty");
                Vec::new()
            }
        };

        tracing::info!(path = %path.display(), accounts = accounts.len(), "accounts: loaded");
        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
        })
    }

    pub async fn list(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    /// Persists first; memory only changes once the snapshot is on disk.
    pub async fn insert(&self, account: Account) -> anyhow::Result<()> {
        let mut accounts = self.accounts.write().await;
        let mut next = accounts.clone();
        next.push(account);
        save(&self.path, &next).await?;
        *accounts = next;
        Ok(())
    }

    /// Returns false when no account has this id.
    pub async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let mut accounts = self.accounts.write().await;
        let next: Vec<Account> = accounts.iter().filter(|a| a.id != id).cloned().collect();
        if next.len() == accounts.len() {
            return Ok(false);
        }
        save(&self.path, &next).await?;
        *accounts = next;
        Ok(true)
    }

    /// One subscription link per line.
    pub async fn subscription(&self) -> String {
        self.accounts
            .read()
            .await
            .iter()
            .map(|a| format!("{}\n", a.subscription))
            .collect()
    }
}

async fn save(path: &Path, accounts: &[Account]) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(accounts).context("accounts: encode")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body)
        .await
        .with_context(|| format!("accounts: write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("accounts: rename to {}", path.display()))?;
    Ok(())
}
