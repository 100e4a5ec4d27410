//! Start, stop and reconciliation of server processes.
//!
//! Lock order, outermost first: start lock → registry → running set → record.
//! Start and refresh take the start lock; stop and poll go straight to the
//! running set. No lock is held across a sleep.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use mcweb_process::ProcessHandle;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    config::SupervisorConfig,
    error::SupervisorError,
    identity::Requester,
    log_tail,
    record::{Probe, ServerRecord, ServerSnapshot},
    registry::ServerRegistry,
    running::RunningSet,
};

const EXIT_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const REAP_WAIT: Duration = Duration::from_secs(5);

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub pid: u32,
    pub script: PathBuf,
}

#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    registry: ServerRegistry,
    running: Arc<RunningSet>,
    start_lock: Mutex<()>,
    last_poll: Mutex<Option<Instant>>,
}

impl Supervisor {
    /// Build the supervisor and run the initial registry scan.
    pub async fn new(config: SupervisorConfig) -> Self {
        let registry =
            ServerRegistry::new(config.server_folders.clone(), config.whitelist_file.clone());
        let running = Arc::new(RunningSet::new());
        registry.refresh(&running).await;
        Self {
            config,
            registry,
            running,
            start_lock: Mutex::new(()),
            last_poll: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn running(&self) -> &RunningSet {
        &self.running
    }

    /// Every server the requester may see, sorted by name.
    pub async fn list_servers(&self, requester: &Requester) -> Vec<ServerSnapshot> {
        self.poll(false).await;

        let mut out = Vec::new();
        for record in self.registry.records().await {
            if !record.is_visible_to(requester) {
                continue;
            }
            out.push(record.snapshot(requester.is_admin, true).await);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn start(&self, name: &str, requester: &Requester) -> Result<Started, SupervisorError> {
        let _start = self.start_lock.lock().await;

        let record = self.resolve(name, requester).await?;
        self.poll(true).await;
        if self.running.contains(record.display_name()).await {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }

        let script = find_startup_script(record.folder_path(), &self.config.startup_scripts)
            .await
            .ok_or_else(|| SupervisorError::NoStartupScript(name.to_string()))?;

        let mut handle = ProcessHandle::spawn(&script, record.folder_path()).map_err(|e| {
            tracing::warn!(server = %name, script = %script.display(), error = %e, "spawn failed");
            SupervisorError::StartFailed {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;

        if !handle.is_alive() {
            let reason = match handle.try_status() {
                Ok(Some(status)) => format!("process exited immediately ({status})"),
                _ => "process exited immediately".to_string(),
            };
            tracing::warn!(server = %name, %reason, "server failed to start");
            return Err(SupervisorError::StartFailed {
                name: name.to_string(),
                reason,
            });
        }

        let pid = handle.pid();
        {
            let mut running = self.running.lock().await;
            record.set_process(Some(handle)).await;
            running.insert(record.display_name().to_string(), record.clone());
        }

        tracing::info!(server = %name, pid, requested_by = %requester.user, "server started");
        Ok(Started { pid, script })
    }

    /// Ask the server to stop, escalating to a kill if it doesn't.
    ///
    /// A timeout returns `StopTimeout` right away while the forced shutdown
    /// carries on in a background task.
    pub async fn stop(&self, name: &str, requester: &Requester) -> Result<(), SupervisorError> {
        let record = self.resolve(name, requester).await?;
        self.poll(true).await;
        if !self.running.contains(record.display_name()).await {
            return Err(SupervisorError::NotRunning(name.to_string()));
        }

        // Everything below targets this process only; a server restarted in
        // the meantime is someone else's.
        let run = record
            .current_run()
            .await
            .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?;

        tracing::info!(server = %name, requested_by = %requester.user, "stop requested");
        let deadline = Instant::now() + self.config.stop_timeout;
        if let Err(e) = record
            .send_line_to(run, &self.config.stop_command, self.config.stop_timeout)
            .await
        {
            // Still wait: a closed stdin usually means it's already on its way out.
            tracing::warn!(server = %name, error = %e, "failed to send stop command");
        }

        if wait_for_exit(&record, run, deadline).await {
            release(&self.running, &record, run).await;
            tracing::info!(server = %name, "server stopped");
            return Ok(());
        }

        tracing::warn!(
            server = %name,
            timeout_ms = self.config.stop_timeout.as_millis() as u64,
            "server did not stop in time, escalating"
        );
        let escalation = Escalation {
            record,
            run,
            running: self.running.clone(),
            grace: self.config.runtime_grace,
            markers: self.config.runtime_markers.clone(),
        };
        tokio::spawn(escalation.run());

        Err(SupervisorError::StopTimeout(name.to_string()))
    }

    /// Write a console command to a running server. Admins only.
    pub async fn send_command(
        &self,
        name: &str,
        command: &str,
        requester: &Requester,
    ) -> Result<(), SupervisorError> {
        requester.require_admin()?;
        let record = self.resolve(name, requester).await?;
        self.poll(false).await;
        if !self.running.contains(record.display_name()).await {
            return Err(SupervisorError::NotRunning(name.to_string()));
        }

        let line = command.replace(['\r', '\n'], " ");
        record
            .send_line(&line, self.config.console_timeout)
            .await
            .map_err(|e| {
                tracing::warn!(server = %name, error = %e, "failed to send command");
                if e.kind() == std::io::ErrorKind::TimedOut {
                    SupervisorError::ConsoleUnresponsive(name.to_string())
                } else {
                    SupervisorError::NotRunning(name.to_string())
                }
            })?;
        tracing::info!(server = %name, requested_by = %requester.user, "command sent");
        Ok(())
    }

    /// Rescan the server folders. Admins only.
    pub async fn refresh(&self, requester: &Requester) -> Result<usize, SupervisorError> {
        requester.require_admin()?;
        // Keeps a start from registering a record this refresh is replacing.
        let _start = self.start_lock.lock().await;
        Ok(self.registry.refresh(&self.running).await)
    }

    /// Reconcile the running set with the OS and refresh cached logs.
    ///
    /// Unforced calls run at most once per poll interval. Returns whether a
    /// pass actually ran.
    pub async fn poll(&self, force: bool) -> bool {
        {
            let mut last = self.last_poll.lock().await;
            let now = Instant::now();
            if !force
                && last.is_some_and(|at| now.duration_since(at) < self.config.poll_interval)
            {
                return false;
            }
            *last = Some(now);
        }

        let alive = {
            let mut running = self.running.lock().await;
            let mut exited = Vec::new();
            for (name, record) in running.iter() {
                match record.probe().await {
                    Probe::Alive => {}
                    Probe::Idle => exited.push((name.clone(), None)),
                    Probe::Exited(status) => exited.push((name.clone(), status)),
                }
            }
            for (name, status) in exited {
                if let Some(record) = running.remove(&name) {
                    record.on_stop().await;
                    match status {
                        Some(status) => tracing::info!(server = %name, %status, "server exited"),
                        None => tracing::info!(server = %name, "server exited"),
                    }
                }
            }
            running.values().cloned().collect::<Vec<_>>()
        };

        for record in alive {
            let path = self.config.log_path(record.folder_path());
            if let Some(text) = log_tail::try_tail(&path, self.config.max_log_lines).await {
                record.set_log(Some(text)).await;
            }
        }
        true
    }

    async fn resolve(
        &self,
        name: &str,
        requester: &Requester,
    ) -> Result<Arc<ServerRecord>, SupervisorError> {
        if !is_safe_name(name) {
            return Err(SupervisorError::NotFound);
        }
        let record = self
            .registry
            .lookup(name)
            .await
            .ok_or(SupervisorError::NotFound)?;
        if !record.is_visible_to(requester) {
            return Err(SupervisorError::NotFound);
        }
        Ok(record)
    }
}

/// Forced half of a stop that outlived its graceful window.
struct Escalation {
    record: Arc<ServerRecord>,
    run: u64,
    running: Arc<RunningSet>,
    grace: Duration,
    markers: Vec<String>,
}

impl Escalation {
    async fn run(self) {
        let name = self.record.display_name().to_string();

        let targets: Vec<_> = self
            .record
            .descendants_of(self.run)
            .await
            .into_iter()
            .filter(|d| d.matches_marker(&self.markers))
            .collect();

        if !targets.is_empty() {
            // Launcher scripts wrap a heavier runtime that may still be
            // writing world data.
            tracing::info!(
                server = %name,
                pids = ?targets.iter().map(|d| d.pid).collect::<Vec<_>>(),
                grace_ms = self.grace.as_millis() as u64,
                "runtime still alive, granting save grace period"
            );
            tokio::time::sleep(self.grace).await;
            for target in &targets {
                match mcweb_process::terminate_pid(target.pid) {
                    Ok(()) => tracing::warn!(server = %name, pid = target.pid, process = %target.name, "killed runtime"),
                    Err(e) => tracing::warn!(server = %name, pid = target.pid, error = %e, "failed to kill runtime"),
                }
            }
        }

        self.record.terminate(self.run, REAP_WAIT).await;
        if release(&self.running, &self.record, self.run).await {
            tracing::warn!(server = %name, "server force-stopped");
        } else {
            tracing::info!(server = %name, "server exited before it was force-stopped");
        }
    }
}

/// Take a stopped record out of the running set and clear its state, unless
/// process `run` was already reaped (and maybe replaced) by someone else.
async fn release(running: &RunningSet, record: &ServerRecord, run: u64) -> bool {
    let mut running = running.lock().await;
    if !record.on_stop_run(run).await {
        return false;
    }
    running.remove(record.display_name());
    true
}

/// Poll until process `run` is gone or `deadline` passes.
async fn wait_for_exit(record: &ServerRecord, run: u64, deadline: Instant) -> bool {
    loop {
        if !matches!(record.probe_run(run).await, Probe::Alive) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_PROBE_INTERVAL.min(deadline - now)).await;
    }
}

/// First candidate that exists as a regular file inside `folder`.
pub async fn find_startup_script(folder: &Path, candidates: &[String]) -> Option<PathBuf> {
    for name in candidates {
        let path = folder.join(name);
        if let Ok(meta) = tokio::fs::metadata(&path).await
            && meta.is_file()
        {
            return Some(path);
        }
    }
    None
}

/// Names are display names, never paths.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 512
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_names() {
        assert!(is_safe_name("Modded - survival"));
        assert!(!is_safe_name(""));
        assert!(!is_safe_name("../etc"));
        assert!(!is_safe_name("a/b"));
        assert!(!is_safe_name("a\\b"));
        assert!(!is_safe_name("a\0b"));
    }

    #[tokio::test]
    async fn startup_script_order_and_file_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("start.sh")).unwrap();
        std::fs::write(dir.path().join("run.bat"), "").unwrap();
        std::fs::write(dir.path().join("run.sh"), "").unwrap();

        let names = ["start.sh", "run.sh", "run.bat"].map(String::from);
        let found = find_startup_script(dir.path(), &names).await.unwrap();
        assert_eq!(found, dir.path().join("run.sh"));

        assert!(
            find_startup_script(dir.path(), &["missing.sh".to_string()])
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn unforced_poll_is_throttled() {
        let base = tempfile::tempdir().unwrap();
        let mut cfg = SupervisorConfig::new(vec![base.path().to_path_buf()], vec!["run.sh".into()]);
        cfg.poll_interval = Duration::from_secs(60);
        let sup = Supervisor::new(cfg).await;

        assert!(sup.poll(false).await);
        assert!(!sup.poll(false).await);
        assert!(sup.poll(true).await);
        assert!(sup.poll(true).await);
        assert!(!sup.poll(false).await);
    }

    #[cfg(target_os = "linux")]
    mod lifecycle {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(folder: &Path, name: &str, body: &str) {
            let path = folder.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        /// `<tmp>/Servers/{A,B}` with `run.sh` only in `A`.
        async fn fixture(body: &str, tweak: impl FnOnce(&mut SupervisorConfig)) -> (tempfile::TempDir, Arc<Supervisor>) {
            let base = tempfile::tempdir().unwrap();
            let root = base.path().join("Servers");
            std::fs::create_dir_all(root.join("A")).unwrap();
            std::fs::create_dir_all(root.join("B")).unwrap();
            write_script(&root.join("A"), "run.sh", body);

            let mut cfg = SupervisorConfig::new(vec![root], vec!["start.sh".into(), "run.sh".into()]);
            cfg.stop_timeout = Duration::from_millis(500);
            cfg.runtime_grace = Duration::from_millis(500);
            tweak(&mut cfg);
            let sup = Arc::new(Supervisor::new(cfg).await);
            (base, sup)
        }

        fn admin() -> Requester {
            Requester::new("Owner", true)
        }

        async fn wait_until_stopped(sup: &Supervisor, name: &str, limit: Duration) -> bool {
            let deadline = Instant::now() + limit;
            while Instant::now() < deadline {
                if !sup.running().contains(name).await {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            false
        }

        fn pid_alive(pid: u32) -> bool {
            // Zombies still have a /proc entry; look at the state field.
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => !stat
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
                Err(_) => false,
            }
        }

        #[tokio::test]
        async fn start_scenario_a_and_b() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (_base, sup) = fixture("read line\nexit 0", |_| {}).await;
            let who = admin();

            let started = sup.start("Servers - A", &who).await.unwrap();
            assert!(started.pid > 0);
            assert!(started.script.ends_with("run.sh"));
            assert!(sup.running().contains("Servers - A").await);

            assert!(matches!(
                sup.start("Servers - B", &who).await,
                Err(SupervisorError::NoStartupScript(_))
            ));
            assert!(matches!(
                sup.start("Servers - A", &who).await,
                Err(SupervisorError::AlreadyRunning(_))
            ));
            assert!(matches!(
                sup.start("Servers - C", &who).await,
                Err(SupervisorError::NotFound)
            ));

            sup.stop("Servers - A", &who).await.unwrap();
            assert!(!sup.running().contains("Servers - A").await);
            let record = sup.registry().lookup("Servers - A").await.unwrap();
            assert!(!record.is_running().await);
        }

        #[tokio::test]
        async fn concurrent_starts_register_one_process() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (_base, sup) = fixture("read line\nexit 0", |_| {}).await;

            let mut tasks = Vec::new();
            for _ in 0..4 {
                let sup = sup.clone();
                tasks.push(tokio::spawn(async move {
                    sup.start("Servers - A", &admin()).await
                }));
            }
            let mut ok = 0;
            let mut already = 0;
            for t in tasks {
                match t.await.unwrap() {
                    Ok(_) => ok += 1,
                    Err(SupervisorError::AlreadyRunning(_)) => already += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!((ok, already), (1, 3));
            assert_eq!(sup.running().len().await, 1);

            sup.stop("Servers - A", &admin()).await.unwrap();
        }

        #[tokio::test]
        async fn stop_when_not_running() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (_base, sup) = fixture("read line", |_| {}).await;

            assert!(matches!(
                sup.stop("Servers - B", &admin()).await,
                Err(SupervisorError::NotRunning(_))
            ));
            assert!(sup.running().is_empty().await);
            assert!(matches!(
                sup.stop("../Servers - B", &admin()).await,
                Err(SupervisorError::NotFound)
            ));
        }

        #[tokio::test]
        async fn crash_is_reconciled_by_forced_poll() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (_base, sup) = fixture("read line\nexit 7", |_| {}).await;
            let who = admin();

            sup.start("Servers - A", &who).await.unwrap();
            assert!(sup.poll(true).await);
            assert!(sup.running().contains("Servers - A").await);

            // Any line makes the script exit on its own.
            let record = sup.registry().lookup("Servers - A").await.unwrap();
            record.send_line("boom", Duration::from_secs(1)).await.unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while matches!(record.probe().await, Probe::Alive) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            assert!(sup.poll(true).await);
            assert!(!sup.running().contains("Servers - A").await);
            assert!(!record.is_running().await);
            assert_eq!(record.log_snapshot().await, "");
            assert!(matches!(
                sup.stop("Servers - A", &who).await,
                Err(SupervisorError::NotRunning(_))
            ));
        }

        #[tokio::test]
        async fn poll_refreshes_log_tail() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (base, sup) = fixture("read line", |cfg| cfg.max_log_lines = 2).await;
            let who = admin();
            let logs = base.path().join("Servers").join("A").join("logs");
            std::fs::create_dir_all(&logs).unwrap();
            std::fs::write(logs.join("latest.log"), "one\ntwo\nthree\n").unwrap();

            sup.start("Servers - A", &who).await.unwrap();
            let listed = sup.list_servers(&who).await;
            let a = listed.iter().find(|s| s.name == "Servers - A").unwrap();
            assert!(a.running);

            sup.poll(true).await;
            let listed = sup.list_servers(&who).await;
            let a = listed.iter().find(|s| s.name == "Servers - A").unwrap();
            assert_eq!(a.log.as_deref(), Some("two\nthree\n"));
            let b = listed.iter().find(|s| s.name == "Servers - B").unwrap();
            assert!(!b.running);
            assert!(b.log.is_none());

            // Rotation: the file disappears, the cached tail stays.
            std::fs::remove_file(logs.join("latest.log")).unwrap();
            sup.poll(true).await;
            let record = sup.registry().lookup("Servers - A").await.unwrap();
            assert_eq!(record.log_snapshot().await, "two\nthree\n");

            sup.stop("Servers - A", &who).await.unwrap();
            assert_eq!(record.log_snapshot().await, "");
        }

        #[tokio::test]
        async fn stop_timeout_without_runtime_kills_parent() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            // Swallows the stop line and keeps reading; no runtime child.
            let (_base, sup) = fixture("while :; do read line || sleep 0.05; done", |cfg| {
                cfg.runtime_markers = vec!["java".into()];
            })
            .await;
            let who = admin();

            sup.start("Servers - A", &who).await.unwrap();
            let started = Instant::now();
            let err = sup.stop("Servers - A", &who).await.unwrap_err();
            assert!(err.is_soft());
            assert!(matches!(err, SupervisorError::StopTimeout(_)));

            assert!(wait_until_stopped(&sup, "Servers - A", Duration::from_secs(10)).await);
            // No grace period for a plain launcher.
            assert!(started.elapsed() < Duration::from_millis(500 + 500 + 400));
            let record = sup.registry().lookup("Servers - A").await.unwrap();
            assert!(!record.is_running().await);
        }

        #[tokio::test]
        async fn stop_timeout_with_runtime_child_gets_grace() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (_base, sup) = fixture("sleep 30 &\nwait", |cfg| {
                cfg.runtime_markers = vec!["sleep".into()];
            })
            .await;
            let who = admin();

            sup.start("Servers - A", &who).await.unwrap();
            let record = sup.registry().lookup("Servers - A").await.unwrap();
            let parent = record.pid().await.unwrap();
            let run = record.current_run().await.unwrap();

            // Give the shell a moment to fork its child.
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut child = None;
            while child.is_none() && Instant::now() < deadline {
                child = record
                    .descendants_of(run)
                    .await
                    .into_iter()
                    .find(|d| d.name == "sleep")
                    .map(|d| d.pid);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let child = child.expect("runtime child should appear");

            let started = Instant::now();
            let err = sup.stop("Servers - A", &who).await.unwrap_err();
            assert!(matches!(err, SupervisorError::StopTimeout(_)));
            assert!(pid_alive(child));

            assert!(wait_until_stopped(&sup, "Servers - A", Duration::from_secs(10)).await);
            assert!(started.elapsed() >= Duration::from_millis(1000));
            assert!(!pid_alive(child));
            assert!(!pid_alive(parent));
            assert!(!record.is_running().await);
            assert_eq!(record.log_snapshot().await, "");
        }

        #[tokio::test]
        async fn non_executable_script_fails_to_start() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (base, sup) = fixture("read line", |_| {}).await;
            let script = base.path().join("Servers").join("A").join("run.sh");
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

            assert!(matches!(
                sup.start("Servers - A", &admin()).await,
                Err(SupervisorError::StartFailed { .. })
            ));
            assert!(sup.running().is_empty().await);
        }

        #[tokio::test]
        async fn whitelist_hides_servers_and_gates_admin_ops() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let base = tempfile::tempdir().unwrap();
            let root = base.path().join("Servers");
            std::fs::create_dir_all(root.join("A")).unwrap();
            std::fs::create_dir_all(root.join("B")).unwrap();
            std::fs::write(root.join("B").join("mc_server_web.txt"), "Alice").unwrap();
            write_script(&root.join("A"), "run.sh", "read line");

            let sup = Supervisor::new(SupervisorConfig::new(vec![root.clone()], vec!["run.sh".into()])).await;
            let alice = Requester::new("Alice", false);
            let bob = Requester::new("Bob", false);

            let names = |v: Vec<ServerSnapshot>| v.into_iter().map(|s| s.name).collect::<Vec<_>>();
            assert_eq!(names(sup.list_servers(&alice).await), vec!["Servers - A", "Servers - B"]);
            assert_eq!(names(sup.list_servers(&bob).await), vec!["Servers - A"]);

            // Hidden and unknown look the same.
            assert!(matches!(sup.start("Servers - B", &bob).await, Err(SupervisorError::NotFound)));
            assert!(matches!(sup.refresh(&bob).await, Err(SupervisorError::Unauthorized)));
            assert!(matches!(
                sup.send_command("Servers - A", "say hi", &bob).await,
                Err(SupervisorError::Unauthorized)
            ));

            let admin = Requester::new("Owner", true);
            assert!(matches!(
                sup.send_command("Servers - A", "say hi", &admin).await,
                Err(SupervisorError::NotRunning(_))
            ));

            std::fs::create_dir_all(root.join("C")).unwrap();
            assert_eq!(sup.refresh(&admin).await.unwrap(), 3);
        }

        #[tokio::test]
        async fn send_command_reaches_console() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (base, sup) = fixture("read line\necho \"$line\" > got.txt\nread line", |_| {}).await;
            let who = admin();

            sup.start("Servers - A", &who).await.unwrap();
            sup.send_command("Servers - A", "say hello\nop everyone", &who)
                .await
                .unwrap();

            let got = base.path().join("Servers").join("A").join("got.txt");
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut text = String::new();
            while text.trim().is_empty() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
                text = std::fs::read_to_string(&got).unwrap_or_default();
            }
            assert_eq!(text.trim(), "say hello op everyone");

            sup.stop("Servers - A", &who).await.unwrap();
        }

        #[tokio::test]
        async fn stop_spares_a_server_restarted_meanwhile() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (_base, sup) = fixture("read line\nexit 0", |cfg| {
                cfg.stop_timeout = Duration::from_secs(3);
            })
            .await;
            let who = admin();

            let old_pid = sup.start("Servers - A", &who).await.unwrap().pid;
            let stopper = {
                let sup = sup.clone();
                tokio::spawn(async move { sup.stop("Servers - A", &admin()).await })
            };

            // Restart as soon as the old process is gone, while the stop is
            // still waiting on it.
            let deadline = Instant::now() + Duration::from_secs(5);
            let new_pid = loop {
                match sup.start("Servers - A", &who).await {
                    Ok(started) => break started.pid,
                    Err(SupervisorError::AlreadyRunning(_)) if Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(e) => panic!("restart failed: {e}"),
                }
            };
            assert_ne!(old_pid, new_pid);

            stopper.await.unwrap().unwrap();
            // Nothing left over from the first stop may touch the new process.
            tokio::time::sleep(Duration::from_millis(300)).await;
            let record = sup.registry().lookup("Servers - A").await.unwrap();
            assert!(sup.running().contains("Servers - A").await);
            assert_eq!(record.pid().await, Some(new_pid));
            assert!(pid_alive(new_pid));

            sup.stop("Servers - A", &who).await.unwrap();
            assert!(!sup.running().contains("Servers - A").await);
        }

        #[tokio::test]
        async fn blocked_console_write_does_not_wedge_supervisor() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            // Never reads stdin, so a big enough command fills the pipe.
            let (_base, sup) = fixture("sleep 300", |cfg| {
                cfg.stop_timeout = Duration::from_secs(1);
                cfg.console_timeout = Duration::from_secs(60);
            })
            .await;
            let who = admin();
            sup.start("Servers - A", &who).await.unwrap();

            let command = {
                let sup = sup.clone();
                tokio::spawn(async move {
                    let big = "a".repeat(256 * 1024);
                    sup.send_command("Servers - A", &big, &admin()).await
                })
            };
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!command.is_finished());

            let listed = tokio::time::timeout(Duration::from_secs(2), sup.list_servers(&who))
                .await
                .expect("list_servers must not wait on a blocked console");
            assert!(listed.iter().any(|s| s.name == "Servers - A" && s.running));

            let started = Instant::now();
            let stopped = tokio::time::timeout(Duration::from_secs(5), sup.stop("Servers - A", &who))
                .await
                .expect("stop must stay within its timeout");
            assert!(matches!(stopped, Err(SupervisorError::StopTimeout(_))));
            assert!(started.elapsed() < Duration::from_secs(3));

            assert!(wait_until_stopped(&sup, "Servers - A", Duration::from_secs(10)).await);
            // The killed reader breaks the pipe under the pending write.
            let sent = tokio::time::timeout(Duration::from_secs(5), command)
                .await
                .expect("pending command should fail once the server is gone")
                .unwrap();
            assert!(sent.is_err());
        }

        #[tokio::test]
        async fn unread_console_times_out_command() {
            let _guard = crate::test_support::SPAWN_LOCK.lock().await;
            let (_base, sup) = fixture("sleep 300", |cfg| {
                cfg.stop_timeout = Duration::from_secs(1);
                cfg.console_timeout = Duration::from_millis(300);
            })
            .await;
            let who = admin();
            sup.start("Servers - A", &who).await.unwrap();

            let big = "a".repeat(256 * 1024);
            let sent = tokio::time::timeout(
                Duration::from_secs(5),
                sup.send_command("Servers - A", &big, &who),
            )
            .await
            .expect("command write must be bounded");
            assert!(matches!(sent, Err(SupervisorError::ConsoleUnresponsive(_))));

            assert!(
                tokio::time::timeout(Duration::from_secs(2), sup.list_servers(&who))
                    .await
                    .is_ok()
            );
            let stopped = tokio::time::timeout(Duration::from_secs(5), sup.stop("Servers - A", &who))
                .await
                .expect("stop must stay within its timeout");
            assert!(matches!(stopped, Err(SupervisorError::StopTimeout(_))));
            assert!(wait_until_stopped(&sup, "Servers - A", Duration::from_secs(10)).await);
        }
    }
}
