//! Jobs: the processes of one pipeline tracked together for job control.

use crate::command::ExitCode;
use crate::error::{ExecError, ExecResult};
use crate::process::{Process, ProcessEvent, ProcessState};
use crate::terminal::{LineControl, RestoreMode, Terminal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Aggregate state of a job's processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    /// Every member that has not exited is stopped.
    Stopped,
    /// Every member has exited; carries the status of the last one.
    Finished(ExitCode),
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Running => f.write_str("Running"),
            JobState::Stopped => f.write_str("Stopped"),
            JobState::Finished(0) => f.write_str("Done"),
            JobState::Finished(code) => write!(f, "Exit {code}"),
        }
    }
}

/// A background job that finished since the last time notices were taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotice {
    pub id: usize,
    pub name: String,
    pub state: JobState,
}

impl fmt::Display for JobNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.id, self.state, self.name)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The process-wide table of jobs that own at least one process.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<BTreeMap<usize, Arc<Job>>>>,
    notices: Arc<Mutex<Vec<JobNotice>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `job` under the smallest free id.
    fn register(&self, job: &Arc<Job>) -> usize {
        let mut jobs = lock(&self.jobs);
        let id = (1..).find(|id| !jobs.contains_key(id)).unwrap_or(1);
        jobs.insert(id, Arc::clone(job));
        id
    }

    fn remove(&self, id: usize) -> Option<Arc<Job>> {
        lock(&self.jobs).remove(&id)
    }

    pub fn list(&self) -> Vec<(usize, Arc<Job>)> {
        lock(&self.jobs)
            .iter()
            .map(|(id, job)| (*id, Arc::clone(job)))
            .collect()
    }

    /// Look a job up by id; `None` picks the most recently registered one.
    pub fn find(&self, id: Option<usize>) -> Option<Arc<Job>> {
        let jobs = lock(&self.jobs);
        match id {
            Some(id) => jobs.get(&id).cloned(),
            None => jobs.values().next_back().cloned(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background jobs that finished since the previous call.
    pub fn take_notices(&self) -> Vec<JobNotice> {
        std::mem::take(&mut *lock(&self.notices))
    }
}

/// One pipeline's processes.
///
/// A job with no processes is invalid: it stands for a pipeline made only of
/// in-process stages and is never registered.
pub struct Job {
    id: OnceLock<usize>,
    processes: Mutex<Vec<Arc<Process>>>,
    foreground: AtomicBool,
    sealed: AtomicBool,
    state: watch::Sender<JobState>,
    registry: JobRegistry,
    terminal: Arc<dyn Terminal>,
    line: Arc<dyn LineControl>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("processes", &*lock(&self.processes))
            .field("foreground", &self.is_foreground())
            .field("state", &self.state())
            .finish()
    }
}

impl Job {
    pub fn new(
        foreground: bool,
        registry: &JobRegistry,
        terminal: Arc<dyn Terminal>,
        line: Arc<dyn LineControl>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(JobState::Running);
        Arc::new(Self {
            id: OnceLock::new(),
            processes: Mutex::new(Vec::new()),
            foreground: AtomicBool::new(foreground),
            sealed: AtomicBool::new(false),
            state,
            registry: registry.clone(),
            terminal,
            line,
        })
    }

    /// Registry id, or 0 while the job has no processes.
    pub fn id(&self) -> usize {
        self.id.get().copied().unwrap_or(0)
    }

    /// Display name: the first process's name.
    pub fn name(&self) -> String {
        lock(&self.processes)
            .first()
            .map(|p| p.name().to_string())
            .unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        !lock(&self.processes).is_empty()
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Process group shared by the members, taken from the first process.
    pub fn pgid(&self) -> Option<Pid> {
        lock(&self.processes).first().and_then(|p| p.pgid())
    }

    pub fn processes(&self) -> Vec<Arc<Process>> {
        lock(&self.processes).clone()
    }

    /// Track `process` as a member. The first member registers the job.
    pub fn add_process(self: &Arc<Self>, process: Arc<Process>) {
        let first = {
            let mut processes = lock(&self.processes);
            processes.push(Arc::clone(&process));
            processes.len() == 1
        };
        if first {
            let id = self.registry.register(self);
            let _ = self.id.set(id);
            debug!(id, name = %process.name(), "job registered");
        }
        let job = Arc::downgrade(self);
        process.on_event(move |event| {
            if let Some(job) = job.upgrade() {
                job.on_process_event(event);
            }
        });
        self.refresh();
    }

    /// No more processes will be added; aggregate transitions may fire from now on.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        self.refresh();
    }

    fn on_process_event(&self, event: &ProcessEvent) {
        if let ProcessEvent::Error(message) = event {
            warn!(id = self.id(), %message, "lost track of a job member");
        }
        self.refresh();
    }

    /// Recompute the aggregate state from the members.
    fn refresh(&self) {
        if !self.sealed.load(Ordering::Acquire) {
            return;
        }
        let states: Vec<ProcessState> = self.processes().iter().map(|p| p.state()).collect();
        if states.is_empty() {
            return;
        }
        let current = self.state();
        if matches!(current, JobState::Finished(_)) {
            return;
        }

        if states.iter().all(ProcessState::is_done) {
            let status = match states.last() {
                Some(ProcessState::Exited(code)) => *code,
                _ => 1,
            };
            self.finish(status);
            return;
        }

        let any_stopped = states.iter().any(|s| *s == ProcessState::Stopped);
        let all_stopped = states
            .iter()
            .all(|s| s.is_done() || *s == ProcessState::Stopped);
        let next = if any_stopped && all_stopped {
            JobState::Stopped
        } else {
            JobState::Running
        };
        if next == current {
            return;
        }

        if next == JobState::Stopped && self.is_foreground() {
            // The shell gets the terminal back before anyone hears of the stop.
            if let Err(e) = self.terminal.restore(RestoreMode::Drain) {
                warn!(error = %e, "restoring the terminal after a stop");
            }
            self.line.resume();
        }
        debug!(id = self.id(), state = %next, "job state");
        self.state.send_replace(next);
    }

    fn finish(&self, status: ExitCode) {
        let state = JobState::Finished(status);
        self.state.send_replace(state);
        if let Some(&id) = self.id.get() {
            self.registry.remove(id);
            if !self.is_foreground() {
                lock(&self.registry.notices).push(JobNotice {
                    id,
                    name: self.name(),
                    state,
                });
            }
        }
        debug!(id = self.id(), status, "job finished");
    }

    fn require_stopped(&self, action: &str) -> ExecResult<Vec<Arc<Process>>> {
        let processes = self.processes();
        if processes.is_empty() {
            return Err(ExecError::Invariant(format!(
                "cannot {action} a job without processes"
            )));
        }
        if self.state() != JobState::Stopped {
            return Err(ExecError::Invariant(format!(
                "cannot {action} job {} while it is {}",
                self.id(),
                self.state()
            )));
        }
        Ok(processes)
    }

    /// Continue a stopped job with the terminal handed to its group.
    pub fn set_foreground(&self) -> ExecResult<()> {
        let processes = self.require_stopped("foreground")?;
        self.line.pause();
        self.foreground.store(true, Ordering::Release);
        continue_all(&processes, Some(self.terminal.as_ref()))
    }

    /// Continue a stopped job without the terminal.
    pub fn set_background(&self) -> ExecResult<()> {
        let processes = self.require_stopped("background")?;
        self.foreground.store(false, Ordering::Release);
        continue_all(&processes, None)
    }

    /// Wait until the job stops or finishes.
    pub async fn settled(&self) -> JobState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| *s != JobState::Running).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Wait until the job stops.
    ///
    /// Never resolves for a job that finishes without stopping.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        if rx.wait_for(|s| *s == JobState::Stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// `SIGCONT` the members and mark them running. With a terminal, the
/// group is handed the terminal first.
fn continue_all(processes: &[Arc<Process>], terminal: Option<&dyn Terminal>) -> ExecResult<()> {
    match processes.first() {
        Some(leader) if leader.pgid().is_some() => match terminal {
            Some(terminal) => leader.set_foreground(terminal)?,
            None => leader.set_background()?,
        },
        _ => {
            for process in processes {
                process.resume()?;
            }
        }
    }
    for process in processes {
        if !process.state().is_done() {
            process.deliver(ProcessEvent::Continued);
        }
    }
    Ok(())
}
