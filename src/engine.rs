//! Execution of parsed command lines.
//!
//! The engine walks a [`Sequence`] and runs each pipeline with its stages
//! connected by bridges (or by plain OS pipes when two external programs sit
//! next to each other). External stages are grouped into a [`Job`] which
//! owns the terminal while it runs in the foreground.

use crate::bridge::{Captured, bridge, capture};
use crate::builtin;
use crate::command::{CommandFactory, CommandIo, DeclaredCommand, ExecutableCommand, ExitCode};
use crate::config::ShellConfig;
use crate::env::EnvStack;
use crate::error::{ExecError, ExecResult};
use crate::expand;
use crate::external;
use crate::io_adapters::{SharedSink, SharedSource, Sink, Source, feed_child, pump};
use crate::job::{Job, JobRegistry, JobState};
use crate::parser::{
    IfClause, Logical, LogicalOp, Operand, Pipeline, ScriptBlock, Sequence, SimpleCommand, Stage,
    Subshell, parse,
};
use crate::process::{self, ChildInput, Interactive, LaunchOptions, Process, Reaper};
use crate::redirect::{self, Redirection, RedirectionKind, Target};
use crate::script::{self, ScriptGlobals, ScriptJob};
use crate::terminal::{Headless, LineControl, RestoreMode, Terminal};
use futures::StreamExt;
use futures::future::{LocalBoxFuture, join_all};
use futures::stream::FuturesUnordered;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rhai::Dynamic;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::future::poll_fn;
use std::path::PathBuf;
use std::pin::pin;
use std::process::ChildStdout;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Status of a pipeline that was stopped by a signal from the terminal.
pub const STOPPED_STATUS: ExitCode = 128 + Signal::SIGTSTP as ExitCode;

/// Result of running a line in capture mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    pub status: ExitCode,
    pub stdout: Vec<u8>,
    /// Set when output beyond the configured capture limit was dropped.
    pub truncated: bool,
}

impl CaptureResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Where a stage reads from when it is not fed by its neighbour.
#[derive(Clone)]
enum Input {
    /// The shell's own stdin.
    Inherit,
    /// Nothing: reads see end of file at once.
    Null,
    Stream(SharedSource),
}

impl Input {
    fn source(&self) -> SharedSource {
        match self {
            Input::Inherit => SharedSource::new(Source::Terminal(tokio::io::stdin())),
            Input::Null => SharedSource::new(Source::Empty),
            Input::Stream(source) => source.clone(),
        }
    }
}

#[derive(Clone)]
enum Output {
    /// The shell's own descriptor.
    Inherit,
    Stream(SharedSink),
}

impl Output {
    fn stdout(&self) -> SharedSink {
        match self {
            Output::Inherit => SharedSink::terminal(),
            Output::Stream(sink) => sink.clone(),
        }
    }

    fn stderr(&self) -> SharedSink {
        match self {
            Output::Inherit => SharedSink::stderr(),
            Output::Stream(sink) => sink.clone(),
        }
    }
}

/// How the streams and process group of a piece of the tree are set up.
#[derive(Clone)]
struct Wiring {
    stdin: Input,
    stdout: Output,
    stderr: Output,
    /// Put external stages into their own process group.
    job_control: bool,
    background: bool,
    /// Group that external stages join instead of starting their own.
    pgid: Option<Pid>,
    /// Set for the outermost level, which hands the terminal back after each pipeline.
    top: bool,
}

impl Wiring {
    fn terminal(job_control: bool) -> Self {
        Self {
            stdin: Input::Inherit,
            stdout: Output::Inherit,
            stderr: Output::Inherit,
            job_control,
            background: false,
            pgid: None,
            top: true,
        }
    }

    /// Wiring of a `$(...)` body: inherits the terminal, never uses job control.
    fn nested() -> Self {
        Self {
            top: false,
            ..Self::terminal(false)
        }
    }
}

/// Environment of one pipeline stage.
///
/// A lone stage works on the caller's stack; stages of a longer pipeline
/// each get a copy so their changes stay local.
enum StageEnv<'a> {
    Borrowed(&'a mut EnvStack),
    Owned(EnvStack),
}

impl StageEnv<'_> {
    fn get(&mut self) -> &mut EnvStack {
        match self {
            StageEnv::Borrowed(env) => env,
            StageEnv::Owned(env) => env,
        }
    }
}

enum StageIn {
    Wire(Input),
    /// Straight from the previous stage's stdout.
    Native,
}

enum StageOut {
    Wire(Output),
    /// Straight into the next stage's stdin.
    Native,
}

/// What a stage will do once its words are expanded and its command resolved.
enum Work {
    External {
        path: PathBuf,
        name: String,
        args: Vec<String>,
        frame: crate::env::Frame,
        redirections: Vec<Redirection>,
    },
    Launched {
        process: Arc<Process>,
        pumps: Vec<JoinHandle<io::Result<u64>>>,
    },
    InProcess {
        command: Box<dyn ExecutableCommand>,
        assignments: Vec<(String, String)>,
        redirections: Vec<Redirection>,
    },
    Subshell(Subshell),
    Script {
        job: ScriptJob,
        redirections: Vec<Redirection>,
    },
    /// Only assignments and redirections, no command word.
    Assign {
        assignments: Vec<(String, String)>,
        redirections: Vec<Redirection>,
    },
    Failed(ExecError),
}

impl Work {
    fn is_external(&self) -> bool {
        matches!(self, Work::External { .. })
    }
}

struct StagePlan<'a> {
    work: Work,
    env: StageEnv<'a>,
    stdin: StageIn,
    stdout: StageOut,
}

impl StagePlan<'_> {
    /// The same plan, if it does not borrow the caller's stack.
    fn into_owned(self) -> Result<StagePlan<'static>, Self> {
        match self.env {
            StageEnv::Owned(env) => Ok(StagePlan {
                work: self.work,
                env: StageEnv::Owned(env),
                stdin: self.stdin,
                stdout: self.stdout,
            }),
            StageEnv::Borrowed(_) => Err(self),
        }
    }
}

/// Stage futures of a stopped job, kept alive until the job is continued.
type Parked = LocalBoxFuture<'static, ()>;

/// How a pipeline ended.
enum Ended {
    Finished {
        status: ExitCode,
        /// The pipeline had a job that may have changed terminal modes.
        had_job: bool,
    },
    /// Stopped from the terminal; the job already handed the terminal back.
    Stopped,
    /// Left running in the background.
    Detached,
}

/// Runs parsed lines against an environment stack.
///
/// Engines are handed out behind an [`Rc`] so that the in-process stages of
/// a stopped pipeline can keep running after the line that started it returned.
pub struct Engine {
    this: Weak<Engine>,
    config: ShellConfig,
    builtins: Vec<Box<dyn CommandFactory>>,
    declared: RefCell<HashMap<String, DeclaredCommand>>,
    globals: RefCell<ScriptGlobals>,
    jobs: JobRegistry,
    reaper: Arc<Reaper>,
    terminal: Arc<dyn Terminal>,
    line: Arc<dyn LineControl>,
    last_status: Cell<ExitCode>,
    exit_request: Cell<Option<ExitCode>>,
    parked: RefCell<FuturesUnordered<Parked>>,
    /// Per stopped job id: set once its parked stages are done.
    parked_jobs: RefCell<HashMap<usize, watch::Receiver<bool>>>,
    /// A job got the terminal during the current top-level pipeline.
    terminal_lent: Cell<bool>,
    /// Input was resumed for the current top-level pipeline.
    handed_back: Cell<bool>,
}

impl Engine {
    pub fn new(config: ShellConfig, terminal: Arc<dyn Terminal>, line: Arc<dyn LineControl>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            builtins: builtin::all(),
            declared: RefCell::new(HashMap::new()),
            globals: RefCell::new(ScriptGlobals::default()),
            jobs: JobRegistry::new(),
            reaper: Reaper::new(),
            terminal,
            line,
            last_status: Cell::new(0),
            exit_request: Cell::new(None),
            parked: RefCell::default(),
            parked_jobs: RefCell::default(),
            terminal_lent: Cell::new(false),
            handed_back: Cell::new(true),
        })
    }

    /// An engine without a controlling terminal or line editor.
    pub fn detached(config: ShellConfig) -> Rc<Self> {
        Self::new(config, Arc::new(Headless), Arc::new(Headless))
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn terminal(&self) -> &Arc<dyn Terminal> {
        &self.terminal
    }

    pub fn line(&self) -> &Arc<dyn LineControl> {
        &self.line
    }

    /// Status of the last completed sequence item, `$?`.
    pub fn last_status(&self) -> ExitCode {
        self.last_status.get()
    }

    /// Ask the current line to stop after the running item.
    pub fn request_exit(&self, status: ExitCode) {
        self.exit_request.set(Some(status));
    }

    pub fn exit_requested(&self) -> Option<ExitCode> {
        self.exit_request.get()
    }

    /// Register `command` under `name`, or remove the declaration when `None`.
    ///
    /// Declared commands take precedence over builtins and programs on `PATH`.
    pub fn declare(&self, name: impl Into<String>, command: Option<DeclaredCommand>) {
        let name = name.into();
        let mut declared = self.declared.borrow_mut();
        match command {
            Some(command) => {
                declared.insert(name, command);
            }
            None => {
                declared.remove(&name);
            }
        }
    }

    /// Make `value` visible to every later script block as `name`.
    pub fn set_script_global(&self, name: impl Into<String>, value: Option<Dynamic>) {
        let name = name.into();
        let mut globals = self.globals.borrow_mut();
        match value {
            Some(value) => globals.set(name, value),
            None => {
                globals.remove(&name);
            }
        }
    }

    /// Run `seq` with the shell's own streams.
    pub async fn execute(&self, seq: &Sequence, env: &mut EnvStack) -> ExecResult<ExitCode> {
        let wiring = Wiring::terminal(self.terminal.is_interactive());
        self.driving(self.sequence(seq, env, &wiring)).await
    }

    /// Run `seq` with its stdout collected instead of printed.
    pub async fn capture(&self, seq: &Sequence, env: &mut EnvStack) -> ExecResult<CaptureResult> {
        let (status, captured) = self
            .driving(self.capture_sequence(seq, env, &Wiring::nested()))
            .await?;
        Ok(CaptureResult {
            status,
            stdout: captured.bytes,
            truncated: captured.truncated,
        })
    }

    /// Output of a `$(...)` body, run in a nested frame.
    pub(crate) async fn substitute(&self, body: &str, env: &mut EnvStack) -> ExecResult<String> {
        let seq = parse(body)?;
        let mut scope = env.scoped();
        let (_, captured) = self.capture_sequence(&seq, &mut scope, &Wiring::nested()).await?;
        Ok(String::from_utf8_lossy(&captured.bytes).into_owned())
    }

    /// Continue a stopped job in the foreground and wait for it, including
    /// the in-process stages it was stopped with.
    pub async fn continue_in_foreground(&self, job: Arc<Job>) -> ExecResult<ExitCode> {
        job.set_foreground()?;
        match self.driving(job.settled()).await {
            JobState::Stopped => {
                // The job resumed input itself when it stopped.
                self.handed_back.set(true);
                self.announce_stopped(&job).await;
                Ok(STOPPED_STATUS)
            }
            JobState::Finished(code) => {
                let waiter = self.parked_jobs.borrow_mut().remove(&job.id());
                if let Some(mut waiter) = waiter {
                    let _ = self.driving(waiter.wait_for(|done| *done)).await;
                }
                self.reclaim_terminal();
                self.line.resume();
                self.handed_back.set(true);
                Ok(code)
            }
            JobState::Running => Err(ExecError::Invariant(format!(
                "job {} settled while still running",
                job.id()
            ))),
        }
    }

    /// Run `fut` while also polling the parked stages of stopped jobs.
    pub(crate) async fn driving<F: Future>(&self, fut: F) -> F::Output {
        let mut fut = pin!(fut);
        poll_fn(|cx| {
            self.poll_parked(cx);
            fut.as_mut().poll(cx)
        })
        .await
    }

    fn poll_parked(&self, cx: &mut Context<'_>) {
        // Taken out while polling: a parked stage may stop and park work itself.
        let mut parked = std::mem::take(&mut *self.parked.borrow_mut());
        while let Poll::Ready(Some(())) = parked.poll_next_unpin(cx) {}
        let mut slot = self.parked.borrow_mut();
        let added = std::mem::replace(&mut *slot, parked);
        if !added.is_empty() {
            slot.extend(added);
            cx.waker().wake_by_ref();
        }
    }

    /// Keep `stages` of the stopped `job` running in the background of the engine.
    fn park(&self, job: &Job, stages: impl Future<Output = Vec<ExecResult<ExitCode>>> + 'static) {
        let id = job.id();
        let (done, waiter) = watch::channel(false);
        self.parked.borrow_mut().push(Box::pin(async move {
            for result in stages.await {
                if let Err(e) = result {
                    warn!(job = id, error = %e, "stage of a stopped job failed");
                }
            }
            done.send_replace(true);
        }));
        self.parked_jobs.borrow_mut().insert(id, waiter);
        debug!(job = id, "stages parked");
    }

    fn sequence<'a>(
        &'a self,
        seq: &'a Sequence,
        env: &'a mut EnvStack,
        wiring: &'a Wiring,
    ) -> LocalBoxFuture<'a, ExecResult<ExitCode>> {
        Box::pin(async move {
            let mut status = self.last_status();
            for item in &seq.items {
                status = if item.background {
                    self.background(&item.logical, env, wiring).await?
                } else {
                    self.logical(&item.logical, env, wiring).await?
                };
                self.last_status.set(status);
                if self.exit_requested().is_some() {
                    break;
                }
            }
            Ok(status)
        })
    }

    /// `&&`/`||` chain, evaluated left to right.
    async fn logical(&self, logical: &Logical, env: &mut EnvStack, wiring: &Wiring) -> ExecResult<ExitCode> {
        let mut status = self.operand(&logical.first, env, wiring).await?;
        for (op, operand) in &logical.rest {
            self.last_status.set(status);
            let run = match op {
                LogicalOp::And => status == 0,
                LogicalOp::Or => status != 0,
            };
            if run {
                status = self.operand(operand, env, wiring).await?;
            }
        }
        Ok(status)
    }

    async fn operand(&self, operand: &Operand, env: &mut EnvStack, wiring: &Wiring) -> ExecResult<ExitCode> {
        match operand {
            Operand::Pipe(pipe) => self.pipeline(pipe, env, wiring).await,
            Operand::Subshell(sub) => self.subshell_into(sub, env, wiring).await,
            Operand::If(clause) => self.if_clause(clause, env, wiring).await,
        }
    }

    async fn if_clause(&self, clause: &IfClause, env: &mut EnvStack, wiring: &Wiring) -> ExecResult<ExitCode> {
        for (condition, body) in &clause.branches {
            let status = self.sequence(condition, env, wiring).await?;
            self.last_status.set(status);
            if status == 0 {
                return self.sequence(body, env, wiring).await;
            }
        }
        match &clause.otherwise {
            Some(body) => self.sequence(body, env, wiring).await,
            None => Ok(0),
        }
    }

    /// Run a parenthesized sequence in a nested frame; captured output goes to `wiring.stdout`.
    async fn subshell_into(&self, sub: &Subshell, env: &mut EnvStack, wiring: &Wiring) -> ExecResult<ExitCode> {
        let mut scope = env.scoped();
        if !sub.capture {
            return self.sequence(&sub.body, &mut scope, wiring).await;
        }
        let (status, captured) = self.capture_sequence(&sub.body, &mut scope, wiring).await?;
        let out = wiring.stdout.stdout();
        out.write_all(&captured.bytes).await?;
        out.flush().await?;
        Ok(status)
    }

    async fn capture_sequence(
        &self,
        seq: &Sequence,
        env: &mut EnvStack,
        wiring: &Wiring,
    ) -> ExecResult<(ExitCode, Captured)> {
        let (writer, collector) = capture(self.config.bridge_capacity, self.config.capture_bound());
        let inner = Wiring {
            stdout: Output::Stream(SharedSink::bridge(writer)),
            ..wiring.clone()
        };
        let run = async move {
            let status = self.sequence(seq, env, &inner).await;
            // The collector only finishes once every writer is gone.
            drop(inner);
            status
        };
        let (status, captured) = tokio::join!(run, collector.collect());
        Ok((status?, captured))
    }

    /// `item &`: only pipelines made purely of programs are detached.
    async fn background(&self, logical: &Logical, env: &mut EnvStack, wiring: &Wiring) -> ExecResult<ExitCode> {
        match self.detachable(logical) {
            Some(pipe) => {
                let detached = Wiring {
                    background: true,
                    top: false,
                    ..wiring.clone()
                };
                self.pipeline(pipe, env, &detached).await
            }
            None => {
                debug!("background item runs in-process code, running it in the foreground");
                self.logical(logical, env, wiring).await
            }
        }
    }

    fn detachable<'a>(&self, logical: &'a Logical) -> Option<&'a Pipeline> {
        let Operand::Pipe(pipe) = &logical.first else {
            return None;
        };
        if !logical.rest.is_empty() {
            return None;
        }
        let external = |stage: &Stage| match stage {
            Stage::Cmd(cmd) => cmd
                .words
                .first()
                .and_then(|word| word.as_literal())
                .is_some_and(|name| self.in_process(name, &[]).is_none()),
            _ => false,
        };
        pipe.stages.iter().all(external).then_some(pipe)
    }

    async fn pipeline(&self, pipe: &Pipeline, env: &mut EnvStack, wiring: &Wiring) -> ExecResult<ExitCode> {
        let owns_line = wiring.top && !wiring.background;
        if owns_line {
            self.terminal_lent.set(false);
            self.handed_back.set(false);
            self.line.pause();
        }
        let ended = self.run_pipeline(pipe, env, wiring).await;
        if owns_line {
            let lent = self.terminal_lent.replace(false);
            match &ended {
                // The job handed the terminal back and resumed input when it stopped.
                Ok(Ended::Stopped) => self.handed_back.set(true),
                Ok(Ended::Finished { had_job, .. }) => self.hand_back(*had_job || lent),
                _ => self.hand_back(lent),
            }
        }
        Ok(match ended? {
            Ended::Finished { status, .. } => status,
            Ended::Stopped => STOPPED_STATUS,
            Ended::Detached => 0,
        })
    }

    async fn run_pipeline(&self, pipe: &Pipeline, env: &mut EnvStack, wiring: &Wiring) -> ExecResult<Ended> {
        let count = pipe.stages.len();
        if count == 0 {
            return Ok(Ended::Finished {
                status: 0,
                had_job: false,
            });
        }
        let mut envs: Vec<StageEnv<'_>> = if count == 1 {
            vec![StageEnv::Borrowed(env)]
        } else {
            (0..count).map(|_| StageEnv::Owned(env.fork())).collect()
        };

        let mut works = Vec::with_capacity(count);
        for (stage, stage_env) in pipe.stages.iter().zip(envs.iter_mut()) {
            works.push(match self.prepare(stage, stage_env.get()).await {
                Ok(work) => work,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => Work::Failed(e),
            });
        }

        let mut plans = self.connect(works, envs, wiring);
        let job = Job::new(
            !wiring.background,
            &self.jobs,
            Arc::clone(&self.terminal),
            Arc::clone(&self.line),
        );
        let pgid = self.launch_all(&mut plans, &job, wiring);
        job.seal();

        if wiring.background {
            for plan in plans {
                if let Work::Failed(e) = plan.work {
                    self.report(&e, &wiring.stderr.stderr()).await;
                }
            }
            if job.is_valid() {
                let leader = job.pgid().or_else(|| job.processes().first().map(|p| p.pid()));
                let leader = leader.map_or(0, Pid::as_raw);
                self.say(&wiring.stderr, format!("[{}] {leader}", job.id())).await;
            }
            return Ok(Ended::Detached);
        }

        let statuses = if !job.is_valid() {
            join_all(plans.into_iter().map(|plan| self.run_stage(plan, wiring, pgid))).await
        } else {
            match self.owned_stages(plans, wiring, pgid) {
                Ok(stages) => {
                    let mut all = Box::pin(join_all(stages));
                    match unless_stopped(&job, &mut all).await {
                        Some(statuses) => statuses,
                        None => {
                            self.park(&job, all);
                            self.announce_stopped(&job).await;
                            return Ok(Ended::Stopped);
                        }
                    }
                }
                Err(plans) => {
                    let stages = plans.into_iter().map(|plan| self.run_stage(plan, wiring, pgid));
                    let mut all = Box::pin(join_all(stages));
                    match unless_stopped(&job, &mut all).await {
                        Some(statuses) => statuses,
                        None => {
                            self.announce_stopped(&job).await;
                            return Ok(Ended::Stopped);
                        }
                    }
                }
            }
        };

        let mut status = 0;
        for result in statuses {
            status = result?;
        }
        Ok(Ended::Finished {
            status,
            had_job: job.is_valid(),
        })
    }

    /// Stage futures that own what they use, so a stopped job can outlive the
    /// line that started it. Plans working on the caller's stack are given back.
    #[allow(clippy::type_complexity)]
    fn owned_stages<'p>(
        &self,
        plans: Vec<StagePlan<'p>>,
        wiring: &Wiring,
        pgid: Option<Pid>,
    ) -> Result<Vec<LocalBoxFuture<'static, ExecResult<ExitCode>>>, Vec<StagePlan<'p>>> {
        let Some(engine) = self.this.upgrade() else {
            return Err(plans);
        };
        if plans.iter().any(|plan| matches!(plan.env, StageEnv::Borrowed(_))) {
            return Err(plans);
        }
        let stages = plans
            .into_iter()
            .filter_map(|plan| plan.into_owned().ok())
            .map(|plan| {
                let engine = Rc::clone(&engine);
                let wiring = wiring.clone();
                let stage: LocalBoxFuture<'static, _> =
                    Box::pin(async move { engine.run_stage(plan, &wiring, pgid).await });
                stage
            })
            .collect();
        Ok(stages)
    }

    /// Expand a stage's words and decide what runs it.
    async fn prepare(&self, stage: &Stage, env: &mut EnvStack) -> ExecResult<Work> {
        match stage {
            Stage::Subshell(sub) => Ok(Work::Subshell(sub.clone())),
            Stage::Script(block) => self.prepare_script(block, env).await,
            Stage::Cmd(cmd) => self.prepare_command(cmd, env).await,
        }
    }

    async fn prepare_command(&self, cmd: &SimpleCommand, env: &mut EnvStack) -> ExecResult<Work> {
        let assignments = expand::assignments(&cmd.assignments, env, self).await?;
        let words = expand::words(&cmd.words, env, self).await?;
        let tokens = expand::redirections(&cmd.redirections, env, self).await?;
        let redirections = redirect::resolve(&tokens)?;

        let Some((name, args)) = words.split_first() else {
            return Ok(Work::Assign {
                assignments,
                redirections,
            });
        };
        if let Some(command) = self.in_process(name, args) {
            return Ok(Work::InProcess {
                command,
                assignments,
                redirections,
            });
        }
        let search = env.get_var("PATH").unwrap_or_default().to_string();
        let path = external::resolve_command(OsStr::new(&search), name)?;
        let mut frame = env.current().clone();
        for (key, value) in assignments {
            frame.set(key, value);
        }
        Ok(Work::External {
            path,
            name: name.clone(),
            args: args.to_vec(),
            frame,
            redirections,
        })
    }

    async fn prepare_script(&self, block: &ScriptBlock, env: &mut EnvStack) -> ExecResult<Work> {
        let args = expand::words(&block.args, env, self).await?;
        let tokens = expand::redirections(&block.redirections, env, self).await?;
        let redirections = redirect::resolve(&tokens)?;
        let job = ScriptJob {
            source: block.source.clone(),
            mode: block.mode,
            args,
            env: env.current().clone(),
            globals: self.globals.borrow().admitted(),
            max_operations: self.config.script_max_operations,
            bridge_capacity: self.config.bridge_capacity,
        };
        Ok(Work::Script { job, redirections })
    }

    /// Declared commands first, then builtins.
    fn in_process(&self, name: &str, args: &[String]) -> Option<Box<dyn ExecutableCommand>> {
        if let Some(declared) = self.declared.borrow().get(name) {
            return Some(declared.invocation(args.to_vec()));
        }
        self.builtins.iter().find_map(|factory| factory.try_create(name, args))
    }

    /// Decide the stream between every pair of neighbours.
    fn connect<'a>(&self, works: Vec<Work>, envs: Vec<StageEnv<'a>>, wiring: &Wiring) -> Vec<StagePlan<'a>> {
        let count = works.len();
        let first = match (&wiring.stdin, wiring.background) {
            (Input::Inherit, true) => Input::Null,
            (input, _) => input.clone(),
        };
        let mut ins = vec![StageIn::Wire(first)];
        let mut outs = Vec::with_capacity(count);
        for pair in works.windows(2) {
            if pair[0].is_external() && pair[1].is_external() {
                outs.push(StageOut::Native);
                ins.push(StageIn::Native);
            } else {
                let (writer, reader) = bridge(self.config.bridge_capacity);
                outs.push(StageOut::Wire(Output::Stream(SharedSink::bridge(writer))));
                ins.push(StageIn::Wire(Input::Stream(SharedSource::new(Source::Bridge(reader)))));
            }
        }
        outs.push(StageOut::Wire(wiring.stdout.clone()));

        works
            .into_iter()
            .zip(envs)
            .zip(ins.into_iter().zip(outs))
            .map(|((work, env), (stdin, stdout))| StagePlan {
                work,
                env,
                stdin,
                stdout,
            })
            .collect()
    }

    /// Start every external stage in order and return the pipeline's process group.
    fn launch_all(&self, plans: &mut [StagePlan<'_>], job: &Arc<Job>, wiring: &Wiring) -> Option<Pid> {
        let mut pgid = wiring.pgid.filter(|pgid| group_exists(*pgid));
        let mut carried: Option<ChildStdout> = None;
        for plan in plans.iter_mut() {
            let work = std::mem::replace(&mut plan.work, Work::Failed(ExecError::Invariant(String::new())));
            plan.work = match work {
                Work::External {
                    path,
                    name,
                    args,
                    frame,
                    redirections,
                } => {
                    let stdin = match &plan.stdin {
                        StageIn::Native => carried.take().map_or(ChildInput::Null, ChildInput::Pipe),
                        StageIn::Wire(Input::Inherit) => ChildInput::Inherit,
                        StageIn::Wire(Input::Null) => ChildInput::Null,
                        StageIn::Wire(Input::Stream(_)) => ChildInput::Piped,
                    };
                    let options = LaunchOptions {
                        stdin,
                        redirect_stdout: !matches!(plan.stdout, StageOut::Wire(Output::Inherit)),
                        redirect_stderr: matches!(wiring.stderr, Output::Stream(_)),
                        interactive: wiring.job_control.then_some(Interactive {
                            foreground: !wiring.background,
                            pgid,
                            terminal: self.terminal.device(),
                        }),
                    };
                    match process::launch(&path, &name, &args, &frame, options, &redirections, &self.reaper) {
                        Ok((process, streams)) => {
                            if pgid.is_none() {
                                pgid = process.pgid();
                            }
                            job.add_process(Arc::clone(&process));
                            let mut pumps = Vec::new();
                            if let (StageIn::Wire(Input::Stream(source)), Some(child_in)) = (&plan.stdin, streams.stdin) {
                                match tokio::process::ChildStdin::from_std(child_in) {
                                    Ok(child_in) => {
                                        tokio::spawn(feed_child(source.clone(), child_in));
                                    }
                                    Err(e) => warn!(%name, error = %e, "cannot feed child stdin"),
                                }
                            }
                            match (&plan.stdout, streams.stdout) {
                                (StageOut::Native, Some(out)) => carried = Some(out),
                                (StageOut::Wire(Output::Stream(sink)), Some(out)) => {
                                    match Source::from_child(out) {
                                        Ok(out) => pumps.push(tokio::spawn(pump(out, sink.clone()))),
                                        Err(e) => warn!(%name, error = %e, "cannot read child stdout"),
                                    }
                                }
                                _ => {}
                            }
                            if let (Output::Stream(sink), Some(err)) = (&wiring.stderr, streams.stderr) {
                                match Source::from_child_stderr(err) {
                                    Ok(err) => pumps.push(tokio::spawn(pump(err, sink.clone()))),
                                    Err(e) => warn!(%name, error = %e, "cannot read child stderr"),
                                }
                            }
                            Work::Launched { process, pumps }
                        }
                        Err(e) => Work::Failed(e),
                    }
                }
                other => other,
            };
        }
        if !wiring.background && wiring.job_control {
            if let Some(pgid) = pgid.filter(|_| job.is_valid()) {
                match self.terminal.give_to(pgid) {
                    Ok(()) => self.terminal_lent.set(true),
                    Err(e) => debug!(pgid = pgid.as_raw(), error = %e, "handing the terminal to the job"),
                }
            }
        }
        pgid
    }

    fn run_stage<'a>(
        &'a self,
        plan: StagePlan<'a>,
        wiring: &'a Wiring,
        pgid: Option<Pid>,
    ) -> LocalBoxFuture<'a, ExecResult<ExitCode>> {
        let StagePlan {
            work,
            mut env,
            stdin,
            stdout,
        } = plan;
        let stdin = match stdin {
            StageIn::Wire(input) => input,
            StageIn::Native => Input::Null,
        };
        let stdout = match stdout {
            StageOut::Wire(output) => output,
            // Only launched programs are wired natively and they never write here.
            StageOut::Native => Output::Inherit,
        };
        let stderr = wiring.stderr.stderr();
        Box::pin(async move {
            let result = match work {
                Work::Launched { process, pumps } => {
                    drop((stdin, stdout));
                    let status = process.wait().await;
                    for handle in pumps {
                        match handle.await {
                            Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
                                debug!(name = process.name(), error = %e, "output pump failed")
                            }
                            _ => {}
                        }
                    }
                    status
                }
                Work::InProcess {
                    command,
                    assignments,
                    redirections,
                } => {
                    self.run_in_process(command, assignments, &redirections, env.get(), stdin, stdout, stderr.clone())
                        .await
                }
                Work::Subshell(sub) => {
                    let inner = Wiring {
                        stdin,
                        stdout,
                        pgid,
                        top: false,
                        ..wiring.clone()
                    };
                    self.subshell_into(&sub, env.get(), &inner).await
                }
                Work::Script { job, redirections } => {
                    match self.open_redirections(&redirections, stdin, stdout).await {
                        Ok((source, sink)) => script::run(job, source, sink, stderr.clone()).await,
                        Err(e) => Err(e),
                    }
                }
                Work::Assign {
                    assignments,
                    redirections,
                } => {
                    drop((stdin, stdout));
                    self.assign(assignments, &redirections, env.get()).await
                }
                Work::Failed(e) => {
                    drop((stdin, stdout));
                    Err(e)
                }
                Work::External { name, .. } => Err(ExecError::Invariant(format!("{name} was never launched"))),
            };
            match result {
                Ok(status) => Ok(status),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    self.report(&e, &stderr).await;
                    Ok(e.status())
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_in_process(
        &self,
        command: Box<dyn ExecutableCommand>,
        assignments: Vec<(String, String)>,
        redirections: &[Redirection],
        env: &mut EnvStack,
        stdin: Input,
        stdout: Output,
        stderr: SharedSink,
    ) -> ExecResult<ExitCode> {
        let (source, sink) = self.open_redirections(redirections, stdin, stdout).await?;
        let mut io = CommandIo::new(source, sink, stderr);
        let result = if assignments.is_empty() {
            command.execute(&mut io, env, self).await
        } else {
            let mut scope = env.scoped();
            for (key, value) in assignments {
                scope.set_var(key, value);
            }
            command.execute(&mut io, &mut scope, self).await
        };
        let status = match result {
            Ok(status) => status,
            Err(e) => match e.downcast::<ExecError>() {
                Ok(e) if e.is_fatal() => return Err(e),
                Ok(e) => {
                    io.diagnostic(&e).await?;
                    e.status()
                }
                Err(e) => {
                    io.diagnostic(format!("{e:#}")).await?;
                    1
                }
            },
        };
        io.stdout.sink().flush().await?;
        Ok(status)
    }

    /// Streams of an in-process stage after its own file redirections.
    ///
    /// Only stdin and stdout files are honoured here; other descriptors and
    /// `&n` duplications only make sense for programs.
    async fn open_redirections(
        &self,
        redirections: &[Redirection],
        stdin: Input,
        stdout: Output,
    ) -> ExecResult<(SharedSource, SharedSink)> {
        let mut source = None;
        let mut sink = None;
        for redirection in redirections {
            let Target::File(path) = &redirection.target else {
                debug!(?redirection, "descriptor duplication ignored for an in-process stage");
                continue;
            };
            match (redirection.source_fd, redirection.kind) {
                (0, RedirectionKind::Input | RedirectionKind::InputOutput) => {
                    source = Some(SharedSource::new(Source::File(open_target(redirection.kind, path).await?)));
                }
                (1, RedirectionKind::Output | RedirectionKind::OutputAppend | RedirectionKind::InputOutput) => {
                    sink = Some(SharedSink::new(Sink::File(open_target(redirection.kind, path).await?)));
                }
                _ => debug!(?redirection, "redirection ignored for an in-process stage"),
            }
        }
        Ok((
            source.unwrap_or_else(|| stdin.source()),
            sink.unwrap_or_else(|| stdout.stdout()),
        ))
    }

    async fn assign(
        &self,
        assignments: Vec<(String, String)>,
        redirections: &[Redirection],
        env: &mut EnvStack,
    ) -> ExecResult<ExitCode> {
        for redirection in redirections {
            if let Target::File(path) = &redirection.target {
                open_target(redirection.kind, path).await?;
            }
        }
        for (key, value) in assignments {
            env.set_var(key, value);
        }
        Ok(0)
    }

    /// Give the terminal back and resume input, once per top-level pipeline.
    fn hand_back(&self, reclaim: bool) {
        if self.handed_back.replace(true) {
            return;
        }
        if reclaim {
            self.reclaim_terminal();
        }
        self.line.resume();
    }

    fn reclaim_terminal(&self) {
        if !self.terminal.is_interactive() {
            return;
        }
        if let Err(e) = self.terminal.restore(RestoreMode::Drain) {
            warn!(error = %e, "cannot restore the terminal");
        }
    }

    async fn announce_stopped(&self, job: &Job) {
        let text = format!("\n[{}] {} {}", job.id(), JobState::Stopped, job.name());
        self.say(&Output::Inherit, text).await;
    }

    async fn report(&self, error: &ExecError, stderr: &SharedSink) {
        if let Err(e) = stderr.write_all(format!("{error}\n").as_bytes()).await {
            debug!(error = %e, "cannot report a stage failure");
        }
    }

    async fn say(&self, stderr: &Output, text: String) {
        let sink = stderr.stderr();
        let written = sink.write_all(format!("{text}\n").as_bytes()).await;
        if let Err(e) = written.and(sink.flush().await) {
            debug!(error = %e, "cannot write a job message");
        }
    }
}

/// `None` if `job` stops before `all` completes; `all` is left intact then.
async fn unless_stopped<F: Future + Unpin>(job: &Job, all: &mut F) -> Option<F::Output> {
    tokio::select! {
        out = all => Some(out),
        () = job.stopped() => None,
    }
}

/// Whether some process still belongs to group `pgid`.
fn group_exists(pgid: Pid) -> bool {
    !matches!(kill(Pid::from_raw(-pgid.as_raw()), None), Err(Errno::ESRCH))
}

async fn open_target(kind: RedirectionKind, path: &str) -> ExecResult<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    match kind {
        RedirectionKind::Input => options.read(true),
        RedirectionKind::Output => options.write(true).create(true).truncate(true),
        RedirectionKind::OutputAppend => options.append(true).create(true),
        RedirectionKind::InputOutput => options.read(true).write(true).create(true),
    };
    options
        .open(path)
        .await
        .map_err(|e| ExecError::Redirection(format!("{path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Yield;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn run(engine: &Engine, env: &mut EnvStack, line: &str) -> CaptureResult {
        let seq = parse(line).unwrap();
        engine.capture(&seq, env).await.unwrap()
    }

    fn engine() -> Rc<Engine> {
        Engine::detached(ShellConfig::default())
    }

    #[tokio::test]
    async fn builtin_into_program() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "echo hi | cat").await;
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout_lossy(), "hi\n");
    }

    #[tokio::test]
    async fn programs_connected_directly() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "/bin/sh -c 'echo one; echo two' | /bin/sh -c 'cat' | cat").await;
        assert_eq!(out.stdout_lossy(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn status_of_last_stage() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        assert_eq!(run(&engine, &mut env, "true | false").await.status, 1);
        assert_eq!(run(&engine, &mut env, "false | true").await.status, 0);
    }

    #[tokio::test]
    async fn logical_chains_short_circuit() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "false && echo no || echo yes").await;
        assert_eq!(out.stdout_lossy(), "yes\n");
        let out = run(&engine, &mut env, "true || echo no; echo $?").await;
        assert_eq!(out.stdout_lossy(), "0\n");
    }

    #[tokio::test]
    async fn missing_command_fails_with_127() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "surely-not-a-command && echo no").await;
        assert_eq!(out.status, 127);
        assert_eq!(out.stdout_lossy(), "");
        assert_eq!(engine.last_status(), 127);
    }

    #[tokio::test]
    async fn failed_stage_does_not_stop_neighbours() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "surely-not-a-command | echo after").await;
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout_lossy(), "after\n");
    }

    #[tokio::test]
    async fn subshell_changes_stay_inside() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "(export INNER 1; echo $INNER); echo [$INNER]").await;
        assert_eq!(out.stdout_lossy(), "1\n[]\n");
        assert_eq!(env.depth(), 1);
    }

    #[tokio::test]
    async fn assignments_alone_set_the_current_frame() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "GREETING=hello; echo $GREETING").await;
        assert_eq!(out.stdout_lossy(), "hello\n");
        assert_eq!(env.get_var("GREETING"), Some("hello"));
    }

    #[tokio::test]
    async fn prefix_assignments_are_scoped_to_the_command() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "MODE=fast /bin/sh -c 'echo $MODE'; echo [$MODE]").await;
        assert_eq!(out.stdout_lossy(), "fast\n[]\n");
    }

    #[tokio::test]
    async fn if_picks_first_true_branch() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "if false; then echo a; elif true; then echo b; else echo c; fi").await;
        assert_eq!(out.stdout_lossy(), "b\n");
        let out = run(&engine, &mut env, "if false; then echo a; fi").await;
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout_lossy(), "");
    }

    #[tokio::test]
    async fn declared_commands_take_precedence() {
        let engine = engine();
        engine.declare(
            "echo",
            Some(DeclaredCommand::new(|args, _env, _stdin| {
                stream::iter(vec![Yield::Line(format!("custom {}", args.join(" "))), Yield::Status(4)]).boxed()
            })),
        );
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "echo x y").await;
        assert_eq!(out.stdout_lossy(), "custom x y\n");
        assert_eq!(out.status, 4);

        engine.declare("echo", None);
        assert_eq!(run(&engine, &mut env, "echo x").await.stdout_lossy(), "x\n");
    }

    #[tokio::test]
    async fn declared_command_reads_the_pipe() {
        let engine = engine();
        engine.declare(
            "shout",
            Some(DeclaredCommand::new(|_args, _env, stdin| {
                stream::once(async move {
                    let text = stdin.read_to_end().await.unwrap_or_default();
                    Yield::Bytes(String::from_utf8_lossy(&text).to_uppercase().into_bytes())
                })
                .boxed()
            })),
        );
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "echo quiet | shout").await;
        assert_eq!(out.stdout_lossy(), "QUIET\n");
    }

    #[tokio::test]
    async fn in_process_output_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let engine = engine();
        let mut env = EnvStack::from_process();
        let line = format!("echo saved > {}; echo more >> {}", path.display(), path.display());
        let out = run(&engine, &mut env, &line).await;
        assert_eq!(out.stdout_lossy(), "");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "saved\nmore\n");

        let out = run(&engine, &mut env, &format!("cat < {}", path.display())).await;
        assert_eq!(out.stdout_lossy(), "saved\nmore\n");
    }

    #[tokio::test]
    async fn program_output_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("err.txt");
        let engine = engine();
        let mut env = EnvStack::from_process();
        let line = format!("/bin/sh -c 'echo oops >&2' 2> {}", path.display());
        assert_eq!(run(&engine, &mut env, &line).await.status, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "oops\n");
    }

    #[tokio::test]
    async fn command_substitution_in_arguments() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "echo [$(echo inner | cat)]").await;
        assert_eq!(out.stdout_lossy(), "[inner]\n");
    }

    #[tokio::test]
    async fn capture_subshell_passes_output_on() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let seq = Sequence {
            items: vec![crate::parser::SeqItem {
                logical: Logical {
                    first: Operand::Subshell(Subshell {
                        body: parse("echo a; echo b").unwrap(),
                        capture: true,
                    }),
                    rest: Vec::new(),
                },
                background: false,
            }],
        };
        let out = engine.capture(&seq, &mut env).await.unwrap();
        assert_eq!(out.stdout_lossy(), "a\nb\n");
    }

    #[tokio::test]
    async fn capture_limit_truncates() {
        let config = ShellConfig {
            capture_limit: 4,
            ..ShellConfig::default()
        };
        let engine = Engine::detached(config);
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "echo 0123456789").await;
        assert!(out.truncated);
        assert_eq!(out.stdout, b"0123");
    }

    #[tokio::test]
    async fn script_stage_in_a_pipeline() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "echo abc | { stdin.len() }").await;
        assert_eq!(out.status, 4);
        let out = run(&engine, &mut env, "{ print(`n=${args.len()}`); 0 } a b | cat").await;
        assert_eq!(out.stdout_lossy(), "n=2\n");
    }

    #[tokio::test]
    async fn script_globals_are_visible() {
        let engine = engine();
        engine.set_script_global("answer", Some(Dynamic::from(42_i64)));
        let mut env = EnvStack::from_process();
        assert_eq!(run(&engine, &mut env, "{ answer }").await.status, 42);
        engine.set_script_global("answer", None);
        assert_eq!(run(&engine, &mut env, "{ 1 }").await.status, 1);
    }

    #[tokio::test]
    async fn exit_stops_the_sequence() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "echo a; exit 3; echo b").await;
        assert_eq!(out.stdout_lossy(), "a\n");
        assert_eq!(engine.exit_requested(), Some(3));
    }

    #[tokio::test]
    async fn background_job_is_registered() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let out = run(&engine, &mut env, "/bin/sh -c 'exit 5' &").await;
        assert_eq!(out.status, 0);
        let job = engine.jobs().find(None).unwrap();
        assert!(!job.is_foreground());
        assert_eq!(job.settled().await, JobState::Finished(5));
        let notices = engine.jobs().take_notices();
        assert_eq!(notices.len(), 1);
        assert!(engine.jobs().is_empty());
    }

    #[tokio::test]
    async fn odd_redirection_tokens_are_fatal() {
        let engine = engine();
        let mut env = EnvStack::from_process();
        let seq = Sequence {
            items: vec![crate::parser::SeqItem {
                logical: Logical {
                    first: Operand::Pipe(Pipeline {
                        stages: vec![Stage::Cmd(SimpleCommand {
                            assignments: Vec::new(),
                            words: vec![crate::parser::Word::literal("echo")],
                            redirections: vec![crate::parser::RedirWord::Operator(">".into())],
                        })],
                    }),
                    rest: Vec::new(),
                },
                background: false,
            }],
        };
        let err = engine.capture(&seq, &mut env).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Handoff {
        Give(Pid),
        Restore,
    }

    /// Records terminal handoffs. Its device is a pty that is nobody's
    /// controlling terminal, so taking it from a child fails.
    struct RecordingTerminal {
        events: std::sync::Mutex<Vec<Handoff>>,
        pty: nix::pty::OpenptyResult,
    }

    impl RecordingTerminal {
        fn events(&self) -> Vec<Handoff> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Terminal for RecordingTerminal {
        fn is_interactive(&self) -> bool {
            true
        }

        fn shell_pgid(&self) -> Option<Pid> {
            Some(nix::unistd::getpgrp())
        }

        fn restore(&self, _mode: RestoreMode) -> io::Result<()> {
            self.events.lock().unwrap().push(Handoff::Restore);
            Ok(())
        }

        fn give_to(&self, pgid: Pid) -> io::Result<()> {
            self.events.lock().unwrap().push(Handoff::Give(pgid));
            Ok(())
        }

        fn device(&self) -> Option<std::os::fd::RawFd> {
            use std::os::fd::AsRawFd;
            Some(self.pty.slave.as_raw_fd())
        }
    }

    #[derive(Default)]
    struct CountingLine {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl LineControl for CountingLine {
        fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }

        fn set_prompt(&self, _prompt: &str) {}

        fn add_history(&self, _line: &str) {}
    }

    fn job_controlled() -> (Rc<Engine>, Arc<RecordingTerminal>, Arc<CountingLine>) {
        let terminal = Arc::new(RecordingTerminal {
            events: Default::default(),
            pty: nix::pty::openpty(None, None).unwrap(),
        });
        let line = Arc::new(CountingLine::default());
        let engine = Engine::new(ShellConfig::default(), terminal.clone(), line.clone());
        (engine, terminal, line)
    }

    async fn execute(engine: &Engine, env: &mut EnvStack, line: &str) -> ExitCode {
        engine.execute(&parse(line).unwrap(), env).await.unwrap()
    }

    #[tokio::test]
    async fn job_controlled_pipelines_feed_programs() {
        let (engine, terminal, line) = job_controlled();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut env = EnvStack::from_process();

        let status = execute(&engine, &mut env, &format!("echo hi | /bin/cat > {}", out.display())).await;
        assert_eq!(status, 0);
        let status = execute(
            &engine,
            &mut env,
            &format!("/bin/sh -c 'echo there' | /bin/cat >> {}", out.display()),
        )
        .await;
        assert_eq!(status, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hi\nthere\n");

        let events = terminal.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], Handoff::Give(_)));
        assert_eq!(events[1], Handoff::Restore);
        assert_eq!(line.pauses.load(Ordering::SeqCst), 2);
        assert_eq!(line.resumes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminal_comes_back_after_a_subshell_stage() {
        let (engine, terminal, line) = job_controlled();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut env = EnvStack::from_process();

        let status = execute(&engine, &mut env, &format!("(/bin/true) | echo x > {}", out.display())).await;
        assert_eq!(status, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "x\n");
        let events = terminal.events();
        assert!(matches!(events.first(), Some(Handoff::Give(_))));
        assert_eq!(events.last(), Some(&Handoff::Restore));
        assert_eq!(line.resumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stopped_pipeline_keeps_its_in_process_stages() {
        let (engine, terminal, _line) = job_controlled();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("big");
        let count = dir.path().join("count");
        std::fs::write(&input, vec![b'x'; 4 * 1024 * 1024]).unwrap();
        let mut env = EnvStack::from_process();

        let line = format!(
            "cat {} | /bin/sh -c 'kill -STOP $$; wc -c > {}'",
            input.display(),
            count.display()
        );
        assert_eq!(execute(&engine, &mut env, &line).await, STOPPED_STATUS);
        assert_eq!(terminal.events().last(), Some(&Handoff::Restore));

        let job = engine.jobs().find(None).unwrap();
        assert_eq!(job.state(), JobState::Stopped);
        assert_eq!(engine.continue_in_foreground(job).await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&count).unwrap().trim(), "4194304");
        assert!(engine.jobs().is_empty());
    }

    #[tokio::test]
    async fn fg_resumes_input_once() {
        let (engine, terminal, line) = job_controlled();
        let mut env = EnvStack::from_process();

        assert_eq!(execute(&engine, &mut env, "/bin/sh -c 'kill -STOP $$'").await, STOPPED_STATUS);
        assert_eq!(line.resumes.load(Ordering::SeqCst), 1);

        assert_eq!(execute(&engine, &mut env, "fg").await, 0);
        assert_eq!(line.resumes.load(Ordering::SeqCst), 2);
        assert_eq!(terminal.events().last(), Some(&Handoff::Restore));
        assert!(engine.jobs().is_empty());
    }
}
