//! Child processes, their lifecycle events and the reaper that produces them.

use crate::command::ExitCode;
use crate::env::Frame;
use crate::error::{ExecError, ExecResult};
use crate::redirect::{self, Redirection};
use crate::terminal::{JOB_CONTROL_SIGNALS, Terminal};
use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpid, setpgid, tcsetpgrp};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal as listen};
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

/// Where a process is in its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopped,
    Exited(ExitCode),
    /// The process could not be waited for; it has no status.
    Failed(String),
}

impl ProcessState {
    pub fn is_done(&self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Failed(_))
    }
}

/// Lifecycle transition reported for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stopped,
    Continued,
    Exited(ExitCode),
    Error(String),
}

type Listener = Box<dyn Fn(&ProcessEvent) + Send + Sync>;

/// One OS process started by the shell.
pub struct Process {
    pid: Pid,
    name: String,
    pgid: Option<Pid>,
    detached: bool,
    state: watch::Sender<ProcessState>,
    listeners: Mutex<Vec<Listener>>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("pgid", &self.pgid)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Process {
    fn new(pid: Pid, name: String, pgid: Option<Pid>, detached: bool) -> Self {
        let (state, _) = watch::channel(ProcessState::Running);
        Self {
            pid,
            name,
            pgid,
            detached,
            state,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// A process that is never signalled. Its events come only from [`Process::deliver`].
    pub fn detached(pid: i32, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(Pid::from_raw(pid), name.into(), None, true))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process group the process was placed in, if job control put it in one.
    pub fn pgid(&self) -> Option<Pid> {
        self.pgid
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Call `listener` for every event delivered from now on.
    pub fn on_event(&self, listener: impl Fn(&ProcessEvent) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Record a transition and notify listeners.
    ///
    /// Nothing is reported after the process is done.
    pub fn deliver(&self, event: ProcessEvent) {
        let next = match &event {
            ProcessEvent::Stopped => ProcessState::Stopped,
            ProcessEvent::Continued => ProcessState::Running,
            ProcessEvent::Exited(code) => ProcessState::Exited(*code),
            ProcessEvent::Error(message) => ProcessState::Failed(message.clone()),
        };
        let changed = self.state.send_if_modified(|state| {
            if state.is_done() || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if !changed {
            return;
        }
        debug!(pid = self.pid.as_raw(), name = %self.name, ?event, "process event");
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Wait for the exit status. Stops do not end the wait.
    pub async fn wait(&self) -> ExecResult<ExitCode> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(ProcessState::is_done)
            .await
            .map(|state| state.clone())
            .unwrap_or_else(|_| self.state());
        match state {
            ProcessState::Exited(code) => Ok(code),
            ProcessState::Failed(message) => Err(ExecError::launch(&self.name, message)),
            ProcessState::Running | ProcessState::Stopped => Err(ExecError::Invariant(format!(
                "{} stopped being tracked before it exited",
                self.name
            ))),
        }
    }

    /// Send `SIGCONT` to the process group, or to the process when it has none.
    pub fn resume(&self) -> ExecResult<()> {
        if self.detached {
            return Ok(());
        }
        let target = match self.pgid {
            Some(pgid) => Pid::from_raw(-pgid.as_raw()),
            None => self.pid,
        };
        match kill(target, Signal::SIGCONT) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ExecError::Io(e.into())),
        }
    }

    /// Hand the terminal to this process's group, then continue it.
    pub fn set_foreground(&self, terminal: &dyn Terminal) -> ExecResult<()> {
        if terminal.is_interactive() {
            if let Some(pgid) = self.pgid {
                terminal.give_to(pgid)?;
            }
        }
        self.resume()
    }

    /// Continue the process's group, leaving the terminal where it is.
    pub fn set_background(&self) -> ExecResult<()> {
        self.resume()
    }
}

/// Process-group placement for a job-controlled launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interactive {
    /// The group is meant to own the terminal.
    pub foreground: bool,
    /// Join this group; `None` makes the process a new group leader.
    pub pgid: Option<Pid>,
    /// Terminal device a foreground group leader takes before `exec`.
    pub terminal: Option<RawFd>,
}

/// Where the child's stdin comes from.
#[derive(Debug, Default)]
pub enum ChildInput {
    /// The shell's own stdin.
    #[default]
    Inherit,
    /// `/dev/null`.
    Null,
    /// A pipe whose writing end is returned in [`ChildStreams::stdin`].
    Piped,
    /// Read straight from another child's stdout.
    Pipe(ChildStdout),
}

impl From<ChildInput> for Stdio {
    fn from(input: ChildInput) -> Self {
        match input {
            ChildInput::Inherit => Stdio::inherit(),
            ChildInput::Null => Stdio::null(),
            ChildInput::Piped => Stdio::piped(),
            ChildInput::Pipe(stdout) => Stdio::from(stdout),
        }
    }
}

#[derive(Debug, Default)]
pub struct LaunchOptions {
    pub stdin: ChildInput,
    pub redirect_stdout: bool,
    pub redirect_stderr: bool,
    pub interactive: Option<Interactive>,
}

/// The shell's ends of the child's standard streams that were redirected.
#[derive(Debug, Default)]
pub struct ChildStreams {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

fn stdio(redirect: bool) -> Stdio {
    if redirect { Stdio::piped() } else { Stdio::inherit() }
}

/// Start `path` as a child named `name` and hand it to `reaper`.
///
/// Redirections are applied in order in the child right before `exec`, after
/// the process group is set up and the job-control signals are reset.
pub fn launch(
    path: &Path,
    name: &str,
    args: &[String],
    env: &Frame,
    options: LaunchOptions,
    redirections: &[Redirection],
    reaper: &Arc<Reaper>,
) -> ExecResult<(Arc<Process>, ChildStreams)> {
    let prepared = redirect::for_child(redirections)?;

    let mut cmd = Command::new(path);
    cmd.arg0(name)
        .args(args)
        .env_clear()
        .envs(env.iter())
        .stdin(Stdio::from(options.stdin))
        .stdout(stdio(options.redirect_stdout))
        .stderr(stdio(options.redirect_stderr));

    let interactive = options.interactive;
    if let Some(group) = interactive {
        cmd.process_group(group.pgid.map_or(0, Pid::as_raw));
    }
    // Only a new leader takes the terminal; later members join its group.
    let take_terminal = interactive
        .filter(|group| group.foreground && group.pgid.is_none())
        .and_then(|group| group.terminal);

    // SAFETY: the hook only makes async-signal-safe calls and does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(device) = take_terminal {
                // The parent hands the terminal over as well, so a failure here is not fatal.
                let _ = tcsetpgrp(BorrowedFd::borrow_raw(device), getpid());
            }
            for sig in JOB_CONTROL_SIGNALS.into_iter().chain([Signal::SIGPIPE]) {
                signal(sig, SigHandler::SigDfl)?;
            }
            for redirection in &prepared {
                redirection.apply()?;
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ExecError::Resolution(name.to_string()),
        _ => ExecError::launch(name, e),
    })?;
    let pid = Pid::from_raw(child.id() as i32);

    let pgid = interactive.map(|group| {
        let pgid = group.pgid.unwrap_or(pid);
        // Also done from the parent so the group exists before anyone joins it.
        if let Err(e) = setpgid(pid, pgid) {
            debug!(pid = pid.as_raw(), error = %e, "parent setpgid");
        }
        pgid
    });

    let streams = ChildStreams {
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
    };
    let process = Arc::new(Process::new(pid, name.to_string(), pgid, false));
    debug!(pid = pid.as_raw(), pgid = ?pgid.map(Pid::as_raw), name, "launched");
    reaper.track(&process);
    Ok((process, streams))
}

/// Collects status changes of tracked children on `SIGCHLD`.
///
/// Each tracked pid is polled individually, so children started elsewhere in
/// the process are left alone.
#[derive(Debug, Default)]
pub struct Reaper {
    tracked: Mutex<HashMap<Pid, Weak<Process>>>,
    kick: Arc<Notify>,
    started: AtomicBool,
}

impl Reaper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start reporting events for `process`, spawning the reaper task on first use.
    pub fn track(self: &Arc<Self>, process: &Arc<Process>) {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(process.pid(), Arc::downgrade(process));
        if !self.started.swap(true, Ordering::AcqRel) {
            tokio::spawn(run(Arc::downgrade(self), Arc::clone(&self.kick)));
        }
        // The child may already be gone; its SIGCHLD could predate the listener.
        self.kick.notify_one();
    }

    pub fn tracked(&self) -> usize {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Poll every tracked pid once and deliver what happened.
    pub fn reap(&self) {
        let snapshot: Vec<(Pid, Weak<Process>)> = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(pid, process)| (*pid, process.clone()))
            .collect();

        for (pid, process) in snapshot {
            let events = poll(pid);
            let done = events
                .iter()
                .any(|e| matches!(e, ProcessEvent::Exited(_) | ProcessEvent::Error(_)));
            if let Some(process) = process.upgrade() {
                for event in events {
                    process.deliver(event);
                }
            }
            if done {
                self.tracked
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&pid);
            }
        }
    }
}

async fn run(reaper: Weak<Reaper>, kick: Arc<Notify>) {
    let mut sigchld = match listen(SignalKind::child()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGCHLD, polling instead");
            None
        }
    };
    loop {
        let Some(strong) = reaper.upgrade() else {
            return;
        };
        let kicked = kick.notified();
        strong.reap();
        drop(strong);
        match sigchld.as_mut() {
            Some(stream) => {
                tokio::select! {
                    _ = stream.recv() => {}
                    _ = kicked => {}
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = kicked => {}
                }
            }
        }
    }
}

/// Drain every pending status change of `pid`.
fn poll(pid: Pid) -> Vec<ProcessEvent> {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    let mut events = Vec::new();
    loop {
        match waitpid(pid, Some(flags)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(_, code)) => {
                events.push(ProcessEvent::Exited(code));
                break;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                events.push(ProcessEvent::Exited(128 + sig as i32));
                break;
            }
            Ok(WaitStatus::Stopped(..)) => events.push(ProcessEvent::Stopped),
            Ok(WaitStatus::Continued(_)) => events.push(ProcessEvent::Continued),
            Ok(other) => debug!(pid = pid.as_raw(), ?other, "ignored wait status"),
            Err(Errno::EINTR) => {}
            Err(e) => {
                events.push(ProcessEvent::Error(e.desc().to_string()));
                break;
            }
        }
    }
    events
}
