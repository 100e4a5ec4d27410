use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use mcweb_process::{ConsoleInput, Descendant, ProcessHandle};
use specta::Type;
use tokio::{sync::Mutex, time::Instant};

use crate::identity::Requester;

const REAP_PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Read-only view of a server handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerSnapshot {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub can_administer: bool,
    pub has_log_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Debug)]
pub(crate) enum Probe {
    Idle,
    Alive,
    Exited(Option<ExitStatus>),
}

#[derive(Debug, Default)]
struct RecordState {
    process: Option<ProcessHandle>,
    /// Bumped on every attach, so work aimed at one process can't land on
    /// its successor.
    run: u64,
    log: String,
}

impl RecordState {
    fn holds(&self, run: u64) -> bool {
        self.process.is_some() && self.run == run
    }
}

/// One manageable server instance.
///
/// The process handle and cached log live behind the record's own lock and
/// always change together: a record without a process has an empty log. The
/// lock is never held across console I/O.
#[derive(Debug)]
pub struct ServerRecord {
    id: String,
    display_name: String,
    folder_path: PathBuf,
    authorized_users: BTreeSet<String>,
    state: Mutex<RecordState>,
}

impl ServerRecord {
    pub fn new(
        id: impl Into<String>,
        folder_path: impl Into<PathBuf>,
        authorized_users: BTreeSet<String>,
    ) -> Self {
        let id = id.into();
        let folder_path = folder_path.into();
        let display_name = display_name_for(&folder_path, &id);
        Self {
            id,
            display_name,
            folder_path,
            authorized_users,
            state: Mutex::new(RecordState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn folder_path(&self) -> &Path {
        &self.folder_path
    }

    pub fn authorized_users(&self) -> &BTreeSet<String> {
        &self.authorized_users
    }

    /// Explicitly listed in a whitelist (an open server lists nobody).
    pub fn is_whitelisted(&self, user: &str) -> bool {
        self.authorized_users.contains(user)
    }

    pub fn is_visible_to(&self, requester: &Requester) -> bool {
        requester.is_admin
            || self.authorized_users.is_empty()
            || self.is_whitelisted(&requester.user)
    }

    /// Replacing the process with `None` also drops the cached log.
    pub async fn set_process(&self, handle: Option<ProcessHandle>) {
        let mut state = self.state.lock().await;
        if handle.is_some() {
            state.run += 1;
        } else {
            state.log.clear();
        }
        state.process = handle;
    }

    /// Id of the attached process, if any. Changes with every attach.
    pub(crate) async fn current_run(&self) -> Option<u64> {
        let state = self.state.lock().await;
        state.process.is_some().then_some(state.run)
    }

    /// Ignored while no process is attached, so a log refresh racing a stop
    /// can't resurrect a stale snapshot.
    pub async fn set_log(&self, log: Option<String>) {
        let mut state = self.state.lock().await;
        if state.process.is_none() {
            return;
        }
        state.log = log.unwrap_or_default();
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.process.is_some()
    }

    pub async fn log_snapshot(&self) -> String {
        self.state.lock().await.log.clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.state.lock().await.process.as_ref().map(|p| p.pid())
    }

    /// Drop the process handle and the cached log in one step.
    pub async fn on_stop(&self) {
        let mut state = self.state.lock().await;
        state.process = None;
        state.log.clear();
    }

    /// [`on_stop`](Self::on_stop), but only while `run` is still attached.
    pub(crate) async fn on_stop_run(&self, run: u64) -> bool {
        let mut state = self.state.lock().await;
        if !state.holds(run) {
            return false;
        }
        state.process = None;
        state.log.clear();
        true
    }

    pub async fn snapshot(&self, is_admin: bool, is_viewer: bool) -> ServerSnapshot {
        let state = self.state.lock().await;
        let running = state.process.is_some();
        let has_log_access = is_admin || is_viewer;
        ServerSnapshot {
            id: self.id.clone(),
            name: self.display_name.clone(),
            running,
            can_administer: is_admin,
            has_log_access,
            log: (running && has_log_access).then(|| state.log.clone()),
        }
    }

    /// Write one console line, giving up after `timeout`.
    pub async fn send_line(&self, line: &str, timeout: Duration) -> io::Result<()> {
        let console = self.console(None).await?;
        console.send_line(line, timeout).await
    }

    pub(crate) async fn send_line_to(
        &self,
        run: u64,
        line: &str,
        timeout: Duration,
    ) -> io::Result<()> {
        let console = self.console(Some(run)).await?;
        console.send_line(line, timeout).await
    }

    async fn console(&self, run: Option<u64>) -> io::Result<ConsoleInput> {
        let state = self.state.lock().await;
        let attached = match run {
            Some(run) => state.holds(run),
            None => state.process.is_some(),
        };
        match state.process.as_ref() {
            Some(p) if attached => Ok(p.console()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "server has no process",
            )),
        }
    }

    pub(crate) async fn probe(&self) -> Probe {
        let mut state = self.state.lock().await;
        self.probe_state(&mut state)
    }

    /// Like [`probe`](Self::probe), but a process other than `run` counts as
    /// gone.
    pub(crate) async fn probe_run(&self, run: u64) -> Probe {
        let mut state = self.state.lock().await;
        if !state.holds(run) {
            return Probe::Idle;
        }
        self.probe_state(&mut state)
    }

    fn probe_state(&self, state: &mut RecordState) -> Probe {
        let Some(process) = state.process.as_mut() else {
            return Probe::Idle;
        };
        match process.try_status() {
            Ok(None) => Probe::Alive,
            Ok(Some(status)) => Probe::Exited(Some(status)),
            Err(e) => {
                tracing::warn!(server = %self.display_name, error = %e, "liveness probe failed");
                Probe::Exited(None)
            }
        }
    }

    pub(crate) async fn descendants_of(&self, run: u64) -> Vec<Descendant> {
        let pid = {
            let state = self.state.lock().await;
            match state.process.as_ref() {
                Some(p) if state.holds(run) => p.pid(),
                _ => return Vec::new(),
            }
        };
        mcweb_process::descendants(pid).await
    }

    /// Kill process `run`, wait briefly for it to be reaped, then sweep its
    /// process group. A successor process is left alone. The record lock is
    /// only held for each step, never across the wait.
    pub(crate) async fn terminate(&self, run: u64, reap_wait: Duration) {
        {
            let mut state = self.state.lock().await;
            if !state.holds(run) {
                return;
            }
            if let Some(process) = state.process.as_mut()
                && let Err(e) = process.kill()
            {
                tracing::warn!(server = %self.display_name, pid = process.pid(), error = %e, "kill failed");
            }
        }

        let deadline = Instant::now() + reap_wait;
        while matches!(self.probe_run(run).await, Probe::Alive) {
            if Instant::now() >= deadline {
                tracing::warn!(server = %self.display_name, "process not reaped after kill");
                break;
            }
            tokio::time::sleep(REAP_PROBE_INTERVAL).await;
        }

        let state = self.state.lock().await;
        if let Some(process) = state.process.as_ref()
            && state.holds(run)
        {
            process.kill_group();
        }
    }
}

/// `"<parent folder name> - <id>"`.
pub fn display_name_for(folder_path: &Path, id: &str) -> String {
    let parent = folder_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{parent} - {id}")
}
