use std::{
    collections::{BTreeMap, VecDeque},
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, Command},
    sync::Mutex,
    time::Instant,
};

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

/// A process found somewhere below a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descendant {
    pub pid: u32,
    pub name: String,
}

impl Descendant {
    /// Case-insensitive substring match against the process name.
    pub fn matches_marker(&self, markers: &[String]) -> bool {
        let name = self.name.to_ascii_lowercase();
        markers
            .iter()
            .map(|m| m.trim().to_ascii_lowercase())
            .any(|m| !m.is_empty() && name.contains(&m))
    }
}

/// Writer for a process's stdin. Clones share the same pipe.
///
/// Writes never wait past their deadline. A write that times out or fails
/// closes the pipe, since a half-written line would corrupt the next command.
#[derive(Debug, Clone)]
pub struct ConsoleInput {
    pipe: Arc<Mutex<Option<ChildStdin>>>,
}

impl ConsoleInput {
    fn new(stdin: Option<ChildStdin>) -> Self {
        Self {
            pipe: Arc::new(Mutex::new(stdin)),
        }
    }

    /// Write `line` plus a newline, giving up after `timeout`.
    pub async fn send_line(&self, line: &str, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pipe = tokio::time::timeout_at(deadline, self.pipe.lock())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "console is busy"))?;
        let stdin = pipe
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;

        let mut data = line.trim_end_matches(['\r', '\n']).to_string();
        data.push('\n');
        let write = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        };
        let res = tokio::time::timeout_at(deadline, write).await;
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *pipe = None;
                Err(e)
            }
            Err(_) => {
                *pipe = None;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "process is not reading its console",
                ))
            }
        }
    }
}

/// Owned handle to one spawned server process.
///
/// Output is never captured: some server launchers stall once a pipe buffer
/// fills up, so stdout and stderr go to the null device and only stdin is kept
/// for sending console commands.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    console: ConsoleInput,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn `program` with `cwd` as its working directory.
    ///
    /// On unix the child becomes a session leader, so it has no controlling
    /// terminal and its pid doubles as its process group id.
    pub fn spawn(program: &Path, cwd: &Path) -> io::Result<Self> {
        let mut cmd = Command::new(program);
        cmd.current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_CONSOLE);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned process has no pid"))?;
        let console = ConsoleInput::new(child.stdin.take());

        Ok(Self {
            child,
            pid,
            console,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness probe. `Some` once the process has exited.
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.exit = status;
        }
        Ok(status)
    }

    /// Probe errors count as "gone": a handle we can no longer query is not
    /// one we can control either.
    pub fn is_alive(&mut self) -> bool {
        match self.try_status() {
            Ok(status) => status.is_none(),
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "liveness probe failed");
                false
            }
        }
    }

    /// Handle for writing console lines without holding on to `self`.
    pub fn console(&self) -> ConsoleInput {
        self.console.clone()
    }

    /// Forced termination of the process itself. Safe to call repeatedly.
    pub fn kill(&mut self) -> io::Result<()> {
        if self.try_status()?.is_some() {
            return Ok(());
        }
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Forced termination of everything left in the process's group.
    pub fn kill_group(&self) {
        #[cfg(unix)]
        {
            let pgid = self.pid as libc::pid_t;
            if pgid > 0 {
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        }
    }

    /// Wait for exit, giving up after `timeout`.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit {
            return Ok(Some(status));
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(status);
                Ok(Some(status))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Every live process below this one.
    pub async fn descendants(&self) -> Vec<Descendant> {
        descendants(self.pid).await
    }
}

/// SIGKILL a single pid. A pid that is already gone is not an error.
pub fn terminate_pid(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "terminating arbitrary pids is only supported on unix",
        ))
    }
}

#[cfg(target_os = "linux")]
pub async fn descendants(root_pid: u32) -> Vec<Descendant> {
    descendants_in(Path::new("/proc"), root_pid).await
}

#[cfg(not(target_os = "linux"))]
pub async fn descendants(_root_pid: u32) -> Vec<Descendant> {
    Vec::new()
}

/// Walk a procfs-shaped tree and collect every descendant of `root_pid`,
/// breadth first.
pub async fn descendants_in(proc_root: &Path, root_pid: u32) -> Vec<Descendant> {
    let mut dir = match tokio::fs::read_dir(proc_root).await {
        Ok(d) => d,
        Err(e) => {
            tracing::debug!(root = %proc_root.display(), error = %e, "procfs not readable");
            return Vec::new();
        }
    };

    let mut children: BTreeMap<u32, Vec<(u32, String)>> = BTreeMap::new();
    while let Ok(Some(entry)) = dir.next_entry().await {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        // Processes vanish mid-scan; skip anything we can't read.
        let Ok(stat) = tokio::fs::read_to_string(entry.path().join("stat")).await else {
            continue;
        };
        if let Some((name, ppid)) = parse_stat(&stat) {
            children.entry(ppid).or_default().push((pid, name));
        }
    }

    let mut out = Vec::new();
    let mut queue = VecDeque::from([root_pid]);
    while let Some(parent) = queue.pop_front() {
        let Some(kids) = children.remove(&parent) else {
            continue;
        };
        for (pid, name) in kids {
            queue.push_back(pid);
            out.push(Descendant { pid, name });
        }
    }
    out
}

/// `(comm, ppid)` from a `/proc/<pid>/stat` line.
fn parse_stat(stat: &str) -> Option<(String, u32)> {
    // comm may itself contain spaces and parentheses.
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((name, ppid))
}
