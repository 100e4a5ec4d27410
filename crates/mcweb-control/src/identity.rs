use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use mcweb_core::{IdentityResolver, SupervisorError};
use tokio::{io::AsyncWriteExt, sync::Mutex, time::Instant};

/// Minimum spacing between datastore rewrites.
pub const MIN_WRITE_INTERVAL: Duration = Duration::from_secs(10);

const USER_IDS_TEMPLATE: &str = "123456789012345678~MeTheAdmin\n876543210987654321=MyFriend\n";

/// Who may log in at all, from `user_ids.txt`.
///
/// One entry per line: `<discord id>=<name>` for a user, `<discord id>~<name>`
/// for an admin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedUsers {
    names: BTreeMap<String, String>,
    admins: BTreeSet<String>,
}

impl AllowedUsers {
    pub fn name_of(&self, discord_id: &str) -> Option<&str> {
        self.names.get(discord_id).map(String::as_str)
    }

    pub fn is_admin(&self, discord_id: &str) -> bool {
        self.admins.contains(discord_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

pub fn parse_user_ids(raw: &str) -> Result<AllowedUsers, SupervisorError> {
    let invalid = |msg: String| SupervisorError::ConfigInvalid(msg);
    let mut users = AllowedUsers::default();
    let mut seen_names = BTreeSet::new();

    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let sep = line
            .find(['=', '~'])
            .ok_or_else(|| invalid(format!("user_ids line {} has no '=' or '~'", idx + 1)))?;
        let id = line[..sep].trim();
        let name = line[sep + 1..].trim();
        if id.is_empty() || name.is_empty() {
            return Err(invalid(format!("user_ids line {} is incomplete", idx + 1)));
        }
        if users.names.contains_key(id) {
            return Err(invalid(format!("Discord ID {id} found multiple times in user_ids")));
        }
        if !seen_names.insert(name.to_string()) {
            return Err(invalid(format!(
                "friendly name {name} found multiple times in user_ids"
            )));
        }
        users.names.insert(id.to_string(), name.to_string());
        if line.as_bytes()[sep] == b'~' {
            users.admins.insert(id.to_string());
        }
    }

    if users.is_empty() {
        return Err(invalid("no allowed users added".to_string()));
    }
    Ok(users)
}

/// Read `user_ids.txt`. A missing file is created from a template and
/// reported as invalid so the operator fills it in first.
pub async fn load_user_ids(path: &Path) -> Result<AllowedUsers, SupervisorError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => parse_user_ids(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::write(path, USER_IDS_TEMPLATE)
                .await
                .map_err(|e| {
                    SupervisorError::ConfigInvalid(format!(
                        "failed to generate {}: {e}",
                        path.display()
                    ))
                })?;
            Err(SupervisorError::ConfigInvalid(format!(
                "generated {}; fill it in with Discord user IDs and friendly names",
                path.display()
            )))
        }
        Err(e) => Err(SupervisorError::ConfigInvalid(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Session token → Discord id map, persisted as a JSON object.
#[derive(Debug)]
pub struct IdentityMap {
    users: AllowedUsers,
    tokens: RwLock<BTreeMap<String, String>>,
    datastore: PathBuf,
    dirty: AtomicBool,
    last_write: Mutex<Option<Instant>>,
}

impl IdentityMap {
    pub fn new(users: AllowedUsers, datastore: PathBuf) -> Self {
        Self {
            users,
            tokens: RwLock::new(BTreeMap::new()),
            datastore,
            dirty: AtomicBool::new(false),
            last_write: Mutex::new(None),
        }
    }

    /// Load the token map from `datastore` if it exists.
    pub async fn load(users: AllowedUsers, datastore: PathBuf) -> Result<Self, SupervisorError> {
        let map = Self::new(users, datastore);
        match tokio::fs::read(&map.datastore).await {
            Ok(raw) => {
                let tokens: BTreeMap<String, String> =
                    serde_json::from_slice(&raw).map_err(|e| {
                        SupervisorError::ConfigInvalid(format!(
                            "malformed datastore {}: {e}",
                            map.datastore.display()
                        ))
                    })?;
                tracing::info!(sessions = tokens.len(), "loaded session datastore");
                *map.tokens.write().unwrap_or_else(PoisonError::into_inner) = tokens;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SupervisorError::ConfigInvalid(format!(
                    "failed to read datastore {}: {e}",
                    map.datastore.display()
                )));
            }
        }
        Ok(map)
    }

    /// Attach `token` to `discord_id`, replacing any older session of that
    /// user. Refused for ids that aren't allowed.
    pub fn bind(&self, token: &str, discord_id: &str) -> bool {
        if self.users.name_of(discord_id).is_none() {
            return false;
        }
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.retain(|_, id| id != discord_id);
        tokens.insert(token.to_string(), discord_id.to_string());
        self.dirty.store(true, Ordering::SeqCst);
        true
    }

    pub fn unbind(&self, token: &str) -> bool {
        let removed = self
            .tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some();
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Write hook after a mapping change. Skipped when nothing changed or
    /// the last write was under [`MIN_WRITE_INTERVAL`] ago.
    pub async fn maybe_persist(&self) -> anyhow::Result<bool> {
        let mut last = self.last_write.lock().await;
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < MIN_WRITE_INTERVAL) {
            return Ok(false);
        }
        self.write().await?;
        *last = Some(now);
        Ok(true)
    }

    /// Write now if anything changed, ignoring the throttle.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let mut last = self.last_write.lock().await;
        if self.dirty.load(Ordering::SeqCst) {
            self.write().await?;
            *last = Some(Instant::now());
        }
        Ok(())
    }

    /// Periodically retry throttled writes so the last change lands on disk.
    pub fn spawn_flusher(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MIN_WRITE_INTERVAL).await;
                if let Err(e) = self.maybe_persist().await {
                    tracing::warn!(error = %format!("{e:#}"), "session datastore write failed");
                }
            }
        });
    }

    async fn write(&self) -> anyhow::Result<()> {
        self.dirty.store(false, Ordering::SeqCst);
        let data = {
            let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_vec(&*tokens).context("serialize session datastore")?
        };

        let tmp = self.datastore.with_extension("json.tmp");
        let res = async {
            let mut f = tokio::fs::File::create(&tmp)
                .await
                .with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(&data)
                .await
                .with_context(|| format!("write {}", tmp.display()))?;
            f.flush().await.ok();
            tokio::fs::rename(&tmp, &self.datastore)
                .await
                .with_context(|| format!("persist {}", self.datastore.display()))
        }
        .await;

        if res.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        res
    }
}

impl IdentityResolver for IdentityMap {
    fn identity_for(&self, token: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        let discord_id = tokens.get(token)?;
        self.users.name_of(discord_id).map(str::to_string)
    }

    fn is_admin(&self, token: &str) -> bool {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens
            .get(token)
            .is_some_and(|discord_id| self.users.is_admin(discord_id))
    }
}
