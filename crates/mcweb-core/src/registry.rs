use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tokio::sync::RwLock;

use crate::{record::ServerRecord, running::RunningSet};

/// Every server instance found under the configured root folders.
#[derive(Debug)]
pub struct ServerRegistry {
    roots: Vec<PathBuf>,
    whitelist_file: String,
    records: RwLock<Vec<Arc<ServerRecord>>>,
}

impl ServerRegistry {
    pub fn new(roots: Vec<PathBuf>, whitelist_file: impl Into<String>) -> Self {
        Self {
            roots,
            whitelist_file: whitelist_file.into(),
            records: RwLock::new(Vec::new()),
        }
    }

    /// Rescan every root and swap in the new record list.
    ///
    /// Running records carry over untouched and win any display-name clash;
    /// otherwise the first folder found under a name wins. Returns the number
    /// of records afterwards.
    pub async fn refresh(&self, running: &RunningSet) -> usize {
        let mut scanned = Vec::new();
        for root in &self.roots {
            match scan_root(root, &self.whitelist_file).await {
                Ok(mut found) => scanned.append(&mut found),
                Err(e) => {
                    tracing::warn!(root = %root.display(), error = %format!("{e:#}"), "skipping unreadable server folder");
                }
            }
        }

        let mut records = self.records.write().await;
        let running = running.lock().await;

        let mut next: Vec<Arc<ServerRecord>> = running.values().cloned().collect();
        let mut seen: HashSet<String> = running.keys().cloned().collect();
        for record in scanned {
            if seen.insert(record.display_name().to_string()) {
                next.push(Arc::new(record));
            } else {
                tracing::debug!(server = %record.display_name(), folder = %record.folder_path().display(), "duplicate server name ignored");
            }
        }

        *records = next;
        tracing::info!(servers = records.len(), running = running.len(), "server registry refreshed");
        records.len()
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<ServerRecord>> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.display_name() == name)
            .cloned()
    }

    pub async fn records(&self) -> Vec<Arc<ServerRecord>> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

async fn scan_root(root: &Path, whitelist_file: &str) -> anyhow::Result<Vec<ServerRecord>> {
    let root_users = read_whitelist(&root.join(whitelist_file)).await;

    let mut dir = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("read server folder {}", root.display()))?;

    let mut entries = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .with_context(|| format!("list server folder {}", root.display()))?
    {
        let is_dir = tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir {
            entries.push(entry);
        }
    }
    entries.sort_by_key(|e| e.file_name());

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        let id = entry.file_name().to_string_lossy().into_owned();
        let mut users = root_users.clone();
        users.extend(read_whitelist(&path.join(whitelist_file)).await);
        out.push(ServerRecord::new(id, path, users));
    }
    Ok(out)
}

/// Users listed in a whitelist file. A missing or unreadable file lists
/// nobody, which means "no restriction from this scope".
pub async fn read_whitelist(path: &Path) -> BTreeSet<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => parse_whitelist(&raw),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "whitelist not readable");
            }
            BTreeSet::new()
        }
    }
}

pub fn parse_whitelist(raw: &str) -> BTreeSet<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
