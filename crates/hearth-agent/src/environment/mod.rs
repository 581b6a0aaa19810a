//! Process hosting.
//!
//! An [`Environment`] is one place a server process runs: a root directory,
//! a console, and at most one live child at a time. The hosting strategy is
//! a closed set ([`EnvironmentKind`]); every kind goes through the same
//! start/copy/wait/report cycle implemented here and only differs in how the
//! child is launched.

mod container;
mod native;
#[cfg(unix)]
mod tty;

use std::{
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use hearth_process::{EnvironmentId, EnvironmentKind, EnvironmentStatus, ExitReport, RunState};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin},
    sync::watch,
    task::JoinHandle,
};

use crate::config::AgentConfig;
use crate::console::{ConsoleSink, DEFAULT_CONSOLE_LINES};
use crate::error::EnvironmentError;

pub use container::ContainerOptions;

/// Invoked once per started process with `graceful == true` iff it exited successfully.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

type ExitHook = Box<dyn FnOnce(ExitReport) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct ConsoleLogLimits {
    pub max_bytes: u64,
    pub max_files: usize,
}

#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    pub console_lines: usize,
    /// Mirror console output to `<root>/logs/console.log` when set.
    pub console_log: Option<ConsoleLogLimits>,
    pub container: ContainerOptions,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            console_lines: DEFAULT_CONSOLE_LINES,
            console_log: None,
            container: ContainerOptions::default(),
        }
    }
}

impl EnvironmentOptions {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            console_lines: cfg.console_buffer,
            console_log: Some(ConsoleLogLimits {
                max_bytes: cfg.console_log_max_bytes,
                max_files: cfg.console_log_max_files,
            }),
            container: ContainerOptions {
                image: cfg.container_image.clone(),
            },
        }
    }
}

/// Input side of a running process.
pub(crate) enum StdinWriter {
    Pty(tokio::fs::File),
    Pipe(ChildStdin),
}

impl StdinWriter {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            StdinWriter::Pty(f) => {
                f.write_all(data).await?;
                f.flush().await
            }
            StdinWriter::Pipe(p) => {
                p.write_all(data).await?;
                p.flush().await
            }
        }
    }
}

/// A freshly spawned child plus whatever copies its output into the console.
pub(crate) struct Launched {
    pub child: Child,
    pub pid: u32,
    pub stdin: Option<StdinWriter>,
    pub output: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
struct Slot {
    state: RunState,
    pid: Option<u32>,
    provisioning: bool,
    last_exit: Option<ExitReport>,
    stdin: Option<Arc<tokio::sync::Mutex<StdinWriter>>>,
}

impl std::fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdinWriter::Pty(_) => f.write_str("StdinWriter::Pty"),
            StdinWriter::Pipe(_) => f.write_str("StdinWriter::Pipe"),
        }
    }
}

#[derive(Debug)]
struct Shared {
    id: EnvironmentId,
    kind: EnvironmentKind,
    root: PathBuf,
    console: ConsoleSink,
    container: ContainerOptions,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<RunState>,
}

#[derive(Clone, Debug)]
pub struct Environment {
    shared: Arc<Shared>,
}

impl Environment {
    /// Builds an environment rooted at `root` (made absolute). When a console
    /// log mirror is requested this must run inside a tokio runtime.
    pub fn new(
        id: EnvironmentId,
        kind: EnvironmentKind,
        root: impl AsRef<Path>,
        options: EnvironmentOptions,
    ) -> Result<Self, EnvironmentError> {
        let root = std::path::absolute(root.as_ref())?;
        let console = match options.console_log {
            Some(limits) => ConsoleSink::with_file_mirror(
                options.console_lines,
                root.join("logs").join("console.log"),
                limits.max_bytes,
                limits.max_files,
            ),
            None => ConsoleSink::new(options.console_lines),
        };
        let (state_tx, _) = watch::channel(RunState::Stopped);

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                kind,
                root,
                console,
                container: options.container,
                slot: Mutex::new(Slot {
                    state: RunState::Stopped,
                    pid: None,
                    provisioning: false,
                    last_exit: None,
                    stdin: None,
                }),
                state_tx,
            }),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.shared.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: RunState) {
        self.shared.state_tx.send_replace(state);
    }

    pub fn id(&self) -> &EnvironmentId {
        &self.shared.id
    }

    pub fn kind(&self) -> EnvironmentKind {
        self.shared.kind
    }

    pub fn root_directory(&self) -> &Path {
        &self.shared.root
    }

    pub fn console(&self) -> &ConsoleSink {
        &self.shared.console
    }

    pub fn state(&self) -> RunState {
        self.slot().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot().pid
    }

    pub fn last_exit(&self) -> Option<ExitReport> {
        self.slot().last_exit
    }

    pub fn status(&self) -> EnvironmentStatus {
        let slot = self.slot();
        EnvironmentStatus {
            id: self.shared.id.clone(),
            kind: self.shared.kind,
            state: slot.state,
            pid: slot.pid,
            last_exit: slot.last_exit,
        }
    }

    /// Agent-side notice shown alongside process output.
    pub fn display_to_console(&self, message: impl AsRef<str>) {
        let message = message.as_ref().trim_end_matches(['\r', '\n']);
        tracing::debug!(environment = %self.shared.id, "{message}");
        for line in message.lines() {
            self.shared.console.push_line(line.to_string());
        }
    }

    pub async fn create(&self) -> Result<(), EnvironmentError> {
        tokio::fs::create_dir_all(&self.shared.root).await?;
        Ok(())
    }

    /// Removes the root directory. Refused while a process is active.
    pub async fn delete(&self) -> Result<(), EnvironmentError> {
        self.ensure_idle()?;
        match tokio::fs::remove_dir_all(&self.shared.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_idle(&self) -> Result<(), EnvironmentError> {
        let slot = self.slot();
        match (slot.state, slot.pid) {
            (RunState::Stopped, _) => Ok(()),
            (_, Some(pid)) => Err(EnvironmentError::AlreadyRunning { pid }),
            (_, None) => Err(EnvironmentError::Busy("process is starting")),
        }
    }

    /// Resolves `target` inside the root directory. Relative paths must not
    /// climb out with `..`; absolute paths must already lie under the root.
    pub fn resolve_path(&self, target: &str) -> Result<PathBuf, EnvironmentError> {
        let root = &self.shared.root;
        let p = Path::new(target);
        let rel = if p.is_absolute() {
            p.strip_prefix(root)
                .map_err(|_| EnvironmentError::PathEscape(target.to_string()))?
        } else {
            p
        };

        let mut out = root.clone();
        for c in rel.components() {
            match c {
                Component::CurDir => {}
                Component::Normal(seg) => out.push(seg),
                Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                    return Err(EnvironmentError::PathEscape(target.to_string()));
                }
            }
        }
        Ok(out)
    }

    /// Marks the environment as being provisioned until the guard drops.
    /// Background starts are refused meanwhile; [`Environment::execute`] is not.
    pub fn begin_provisioning(&self) -> Result<ProvisioningGuard, EnvironmentError> {
        let mut slot = self.slot();
        match (slot.state, slot.pid) {
            (RunState::Stopped, _) => {}
            (_, Some(pid)) => return Err(EnvironmentError::AlreadyRunning { pid }),
            (_, None) => return Err(EnvironmentError::Busy("process is starting")),
        }
        if slot.provisioning {
            return Err(EnvironmentError::Busy("provisioning in progress"));
        }
        slot.provisioning = true;
        Ok(ProvisioningGuard { env: self.clone() })
    }

    /// Starts `command` in the background and returns its pid once spawned.
    /// `on_complete` runs after output is drained and the exit is recorded.
    pub fn execute_async(
        &self,
        command: &str,
        args: &[String],
        on_complete: Option<CompletionCallback>,
    ) -> Result<u32, EnvironmentError> {
        let hook = on_complete.map(|cb| -> ExitHook { Box::new(move |r| cb(r.graceful)) });
        self.start(command, args, hook, false)
    }

    /// Runs `command` to completion. Allowed while provisioning.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<ExitReport, EnvironmentError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.start(
            command,
            args,
            Some(Box::new(move |report| {
                let _ = tx.send(report);
            })),
            true,
        )?;
        Ok(rx.await.unwrap_or(ExitReport {
            graceful: false,
            code: None,
            signal: None,
        }))
    }

    fn start(
        &self,
        command: &str,
        args: &[String],
        on_exit: Option<ExitHook>,
        during_provisioning: bool,
    ) -> Result<u32, EnvironmentError> {
        {
            let mut slot = self.slot();
            match (slot.state, slot.pid) {
                (RunState::Stopped, _) => {}
                (_, Some(pid)) => return Err(EnvironmentError::AlreadyRunning { pid }),
                (_, None) => return Err(EnvironmentError::Busy("process is starting")),
            }
            if slot.provisioning && !during_provisioning {
                return Err(EnvironmentError::Busy("provisioning in progress"));
            }
            slot.state = RunState::Starting;
            if !slot.provisioning {
                // Each run shows only its own output.
                self.shared.console.clear();
            }
        }
        self.publish(RunState::Starting);

        let launched = match self.launch(command, args) {
            Ok(l) => l,
            Err(err) => {
                self.slot().state = RunState::Stopped;
                self.publish(RunState::Stopped);
                tracing::warn!(environment = %self.shared.id, %command, %err, "spawn failed");
                return Err(err);
            }
        };

        let Launched {
            mut child,
            pid,
            stdin,
            output,
        } = launched;

        {
            let mut slot = self.slot();
            slot.state = RunState::Running;
            slot.pid = Some(pid);
            slot.stdin = stdin.map(|s| Arc::new(tokio::sync::Mutex::new(s)));
        }
        self.publish(RunState::Running);
        tracing::info!(
            environment = %self.shared.id,
            kind = %self.shared.kind,
            pid,
            %command,
            "process started"
        );

        let env = self.clone();
        tokio::spawn(async move {
            let (_, waited) = tokio::join!(
                async {
                    for h in output {
                        let _ = h.await;
                    }
                },
                child.wait()
            );
            let report = match waited {
                Ok(status) => exit_report(status),
                Err(err) => {
                    tracing::warn!(environment = %env.shared.id, pid, %err, "wait failed");
                    ExitReport {
                        graceful: false,
                        code: None,
                        signal: None,
                    }
                }
            };

            {
                let mut slot = env.slot();
                slot.state = RunState::Stopped;
                slot.pid = None;
                slot.stdin = None;
                slot.last_exit = Some(report);
            }
            env.publish(RunState::Stopped);
            tracing::info!(
                environment = %env.shared.id,
                pid,
                graceful = report.graceful,
                code = ?report.code,
                signal = ?report.signal,
                "process exited"
            );

            if let Some(hook) = on_exit {
                hook(report);
            }
        });

        Ok(pid)
    }

    fn launch(&self, command: &str, args: &[String]) -> Result<Launched, EnvironmentError> {
        let root = &self.shared.root;
        if !root.is_dir() {
            return Err(EnvironmentError::Spawn {
                command: command.to_string(),
                cwd: root.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "working directory does not exist",
                ),
            });
        }

        let console = self.shared.console.clone();
        match self.shared.kind {
            #[cfg(unix)]
            EnvironmentKind::Tty => tty::launch(root, command, args, console),
            #[cfg(not(unix))]
            EnvironmentKind::Tty => Err(EnvironmentError::Pty(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "pseudo-terminals require a unix host",
            ))),
            EnvironmentKind::Native => native::launch(root, command, args, console),
            EnvironmentKind::Container => {
                let docker_args = container::docker_run_args(
                    &self.shared.id,
                    &self.shared.container,
                    root,
                    command,
                    args,
                );
                native::launch(root, "docker", &docker_args, console)
            }
        }
    }

    /// Writes `text` to the process input.
    pub async fn send_input(&self, text: &str) -> Result<(), EnvironmentError> {
        let stdin = self
            .slot()
            .stdin
            .clone()
            .ok_or(EnvironmentError::NotRunning)?;
        let mut guard = stdin.lock().await;
        guard.write_all(text.as_bytes()).await?;
        Ok(())
    }

    /// Sends SIGTERM to the process group and moves to `Stopping`. The exit
    /// is still observed and reported by the background task.
    pub fn stop(&self) -> Result<(), EnvironmentError> {
        let pid = {
            let mut slot = self.slot();
            let pid = match (slot.state, slot.pid) {
                (RunState::Running | RunState::Stopping, Some(pid)) => pid,
                _ => return Err(EnvironmentError::NotRunning),
            };
            slot.state = RunState::Stopping;
            pid
        };
        self.publish(RunState::Stopping);
        tracing::info!(environment = %self.shared.id, pid, "stop requested");
        self.signal_or_restore(pid, Signal::Term)
    }

    /// Sends SIGKILL to the process group.
    pub fn kill(&self) -> Result<(), EnvironmentError> {
        let pid = {
            let mut slot = self.slot();
            let Some(pid) = slot.pid else {
                return Err(EnvironmentError::NotRunning);
            };
            slot.state = RunState::Stopping;
            pid
        };
        self.publish(RunState::Stopping);
        tracing::warn!(environment = %self.shared.id, pid, "kill requested");
        self.signal_or_restore(pid, Signal::Kill)
    }

    /// Signals the group; if that fails the process is still alive, so a
    /// `Stopping` state set for this pid goes back to `Running`.
    fn signal_or_restore(&self, pid: u32, sig: Signal) -> Result<(), EnvironmentError> {
        let err = match signal_group(pid, sig) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let restored = {
            let mut slot = self.slot();
            let restore = slot.state == RunState::Stopping && slot.pid == Some(pid);
            if restore {
                slot.state = RunState::Running;
            }
            restore
        };
        if restored {
            self.publish(RunState::Running);
        }
        tracing::warn!(environment = %self.shared.id, pid, ?sig, %err, "signal failed");
        Err(err)
    }

    /// Resolves once the environment is back in `Stopped`.
    pub async fn wait_for_stopped(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == RunState::Stopped).await;
    }
}

/// Held while a provisioning pipeline owns the environment.
#[derive(Debug)]
pub struct ProvisioningGuard {
    env: Environment,
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        self.env.slot().provisioning = false;
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: Signal) -> Result<(), EnvironmentError> {
    // Children are session leaders, so pgid == pid.
    let pgid = i32::try_from(pid).unwrap_or(-1);
    // kill(0) and kill(-1) would hit the agent's own group or every process.
    if pgid <= 1 {
        return Err(EnvironmentError::Signal {
            pgid,
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        });
    }
    let sig = match sig {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // Already gone; the wait task will report it.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(EnvironmentError::Signal { pgid, source: err });
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: Signal) -> Result<(), EnvironmentError> {
    Err(EnvironmentError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process group signals require a unix host",
    )))
}

fn exit_report(status: std::process::ExitStatus) -> ExitReport {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitReport {
        graceful: status.success(),
        code: status.code(),
        signal,
    }
}

/// Runs in the child between fork and exec: new session, and on Linux a
/// parent-death signal so the server does not outlive a crashed agent.
#[cfg(unix)]
pub(crate) fn detach_child(controlling_tty: bool) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    if controlling_tty {
        let rc = unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn env_in(dir: &Path, kind: EnvironmentKind) -> Environment {
        Environment::new(EnvironmentId::new(), kind, dir, EnvironmentOptions::default()).unwrap()
    }

    fn callback() -> (
        CompletionCallback,
        tokio::sync::mpsc::UnboundedReceiver<bool>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Box::new(move |graceful| {
                let _ = tx.send(graceful);
            }),
            rx,
        )
    }

    async fn expect_single(rx: &mut tokio::sync::mpsc::UnboundedReceiver<bool>) -> bool {
        let graceful = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("callback not invoked")
            .expect("callback dropped");
        // Sender is gone after the single invocation.
        assert!(rx.recv().await.is_none());
        graceful
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tty_success_reports_graceful_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        let (cb, mut rx) = callback();

        env.execute_async("/bin/sh", &sh("echo hello from $HOME"), Some(cb))
            .unwrap();
        assert!(expect_single(&mut rx).await);
        assert!(!env.is_running());
        assert_eq!(env.pid(), None);

        let root = env.root_directory().display().to_string();
        let lines = env.console().read_all();
        assert!(
            lines.iter().any(|l| *l == format!("hello from {root}")),
            "console: {lines:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tty_gives_child_a_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        let report = env
            .execute("/bin/sh", &sh("test -t 0 && test -t 1 && echo is-tty"))
            .await
            .unwrap();
        assert!(report.graceful);
        assert!(env.console().read_all().iter().any(|l| l == "is-tty"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_while_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        let (cb, mut rx) = callback();
        let pid = env
            .execute_async("/bin/sh", &sh("sleep 30"), Some(cb))
            .unwrap();
        assert!(env.is_running());

        let err = env.execute_async("/bin/sh", &sh("true"), None).unwrap_err();
        match err {
            EnvironmentError::AlreadyRunning { pid: existing } => assert_eq!(existing, pid),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(env.pid(), Some(pid));

        env.stop().unwrap();
        assert!(!expect_single(&mut rx).await);
        assert_eq!(env.state(), RunState::Stopped);
        assert_eq!(env.last_exit().and_then(|r| r.signal), Some(libc::SIGTERM));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forced_kill_reports_not_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        let (cb, mut rx) = callback();
        env.execute_async("/bin/sh", &sh("trap '' TERM; sleep 30"), Some(cb))
            .unwrap();
        env.kill().unwrap();
        assert!(!expect_single(&mut rx).await);
        assert!(!env.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_zero_exit_is_not_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        let report = env.execute("/bin/sh", &sh("exit 3")).await.unwrap();
        assert!(!report.graceful);
        assert_eq!(report.code, Some(3));
    }

    #[tokio::test]
    async fn missing_binary_fails_and_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        for kind in [EnvironmentKind::Tty, EnvironmentKind::Native] {
            let env = env_in(dir.path(), kind);
            let err = env
                .execute_async("/definitely/not/here", &[], None)
                .unwrap_err();
            assert!(matches!(err, EnvironmentError::Spawn { .. }), "{err}");
            assert_eq!(env.state(), RunState::Stopped);
        }
    }

    #[tokio::test]
    async fn missing_root_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(&dir.path().join("absent"), EnvironmentKind::Native);
        let err = env.execute_async("/bin/true", &[], None).unwrap_err();
        assert!(matches!(err, EnvironmentError::Spawn { .. }));
        assert_eq!(env.state(), RunState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn native_captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        let report = env
            .execute("/bin/sh", &sh("echo out; echo err 1>&2"))
            .await
            .unwrap();
        assert!(report.graceful);
        let lines = env.console().read_all();
        assert!(lines.contains(&"out".to_string()), "{lines:?}");
        assert!(lines.contains(&"err".to_string()), "{lines:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn native_survives_invalid_utf8_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        let report = env
            .execute(
                "/bin/sh",
                &sh("printf 'bad \\377 byte\\n'; sleep 0.3; echo after; printf tail"),
            )
            .await
            .unwrap();
        assert!(report.graceful, "{report:?}");
        assert_eq!(report.signal, None);
        assert_eq!(
            env.console().read_all(),
            vec!["bad \u{FFFD} byte", "after", "tail"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_input_reaches_process() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        let (cb, mut rx) = callback();
        env.execute_async("/bin/sh", &sh("read line; echo got:$line"), Some(cb))
            .unwrap();
        env.send_input("stop\n").await.unwrap();
        assert!(expect_single(&mut rx).await);
        assert!(env.console().read_all().iter().any(|l| l == "got:stop"));
    }

    #[tokio::test]
    async fn failed_signal_leaves_process_running() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        {
            let mut slot = env.slot();
            slot.state = RunState::Running;
            slot.pid = Some(1);
        }

        assert!(matches!(env.stop(), Err(EnvironmentError::Signal { pgid: 1, .. })));
        assert_eq!(env.state(), RunState::Running);
        assert!(env.is_running());

        assert!(matches!(env.kill(), Err(EnvironmentError::Signal { .. })));
        assert_eq!(env.state(), RunState::Running);
    }

    #[tokio::test]
    async fn stop_when_idle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        assert!(matches!(env.stop(), Err(EnvironmentError::NotRunning)));
        assert!(matches!(
            env.send_input("x").await,
            Err(EnvironmentError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn provisioning_blocks_background_start() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        let guard = env.begin_provisioning().unwrap();
        assert!(matches!(
            env.begin_provisioning(),
            Err(EnvironmentError::Busy(_))
        ));
        assert!(matches!(
            env.execute_async("/bin/true", &[], None),
            Err(EnvironmentError::Busy(_))
        ));
        let report = env.execute("/bin/true", &[]).await.unwrap();
        assert!(report.graceful);
        drop(guard);
        assert!(env.begin_provisioning().is_ok());
    }

    #[test]
    fn resolve_path_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        let root = env.root_directory().to_path_buf();

        assert_eq!(
            env.resolve_path("./plugins/a.jar").unwrap(),
            root.join("plugins").join("a.jar")
        );
        let abs = root.join("server.jar");
        assert_eq!(env.resolve_path(abs.to_str().unwrap()).unwrap(), abs);
        assert!(env.resolve_path("../escape").is_err());
        assert!(env.resolve_path("a/../../b").is_err());
        assert!(env.resolve_path("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn display_to_console_splits_lines() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        env.display_to_console("first\nsecond\n");
        assert_eq!(env.console().read_all(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn delete_removes_root() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(&dir.path().join("srv"), EnvironmentKind::Native);
        env.create().await.unwrap();
        assert!(env.root_directory().is_dir());
        env.delete().await.unwrap();
        assert!(!env.root_directory().exists());
    }
}
