use crate::command::{DeclaredCommand, ExitCode};
use crate::config::ShellConfig;
use crate::engine::{CaptureResult, Engine};
use crate::env::EnvStack;
use crate::error::{ExecError, ExecResult};
use crate::parser::parse;
use crate::terminal::{Headless, LineControl, RestoreMode, Terminal};
use anyhow::{Context, anyhow};
use rhai::Dynamic;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, warn};

/// Status reported for a line that does not parse.
const PARSE_FAILURE: ExitCode = 2;

/// A shell: an [`Engine`] plus the root environment it runs lines in.
///
/// Example
/// ```
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// use shell_engine::Shell;
/// let mut sh = Shell::new();
/// let out = sh.run("echo hello | cat").await.unwrap();
/// assert_eq!(out.status, 0);
/// assert_eq!(out.stdout, b"hello\n");
/// # });
/// ```
pub struct Shell {
    engine: Rc<Engine>,
    env: EnvStack,
    editor: Option<Arc<LineEditor>>,
}

impl Shell {
    /// A shell without terminal or line editor, using default settings.
    pub fn new() -> Self {
        Self::with_config(ShellConfig::default())
    }

    pub fn with_config(config: ShellConfig) -> Self {
        let env = root_env(&config);
        Self {
            engine: Engine::detached(config),
            env,
            editor: None,
        }
    }

    /// A shell reading lines through `rustyline` and, when given a terminal, doing job control.
    pub fn interactive(config: ShellConfig, terminal: Option<Arc<dyn Terminal>>) -> anyhow::Result<Self> {
        let editor = LineEditor::spawn(&config.prompt)?;
        let terminal = terminal.unwrap_or_else(|| Arc::new(Headless));
        let env = root_env(&config);
        let line: Arc<dyn LineControl> = editor.clone();
        Ok(Self {
            engine: Engine::new(config, terminal, line),
            env,
            editor: Some(editor),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn env(&self) -> &EnvStack {
        &self.env
    }

    /// Register an in-process command, or remove it with `None`.
    pub fn declare(&self, name: impl Into<String>, command: Option<DeclaredCommand>) {
        self.engine.declare(name, command);
    }

    /// Set or unset a variable in the root frame.
    pub fn export(&mut self, name: &str, value: Option<&str>) {
        let root = self.env.root_mut();
        match value {
            Some(value) => root.set(name, value),
            None => {
                root.unset(name);
            }
        }
    }

    pub fn set_prompt(&self, prompt: &str) {
        self.engine.line().set_prompt(prompt);
    }

    pub fn set_script_global(&self, name: impl Into<String>, value: Option<Dynamic>) {
        self.engine.set_script_global(name, value);
    }

    /// Status passed to `exit`, once a line asked the shell to stop.
    pub fn exit_requested(&self) -> Option<ExitCode> {
        self.engine.exit_requested()
    }

    /// Parse and run `line` with stdout captured.
    pub async fn run(&mut self, line: &str) -> ExecResult<CaptureResult> {
        let seq = parse(line)?;
        self.engine.capture(&seq, &mut self.env).await
    }

    /// Parse and run `line` on the shell's own streams.
    pub async fn execute(&mut self, line: &str) -> ExecResult<ExitCode> {
        let seq = parse(line)?;
        self.engine.execute(&seq, &mut self.env).await
    }

    /// Like [`Shell::execute`], but failures are reported on stderr and turned into a status.
    pub async fn run_line(&mut self, line: &str) -> ExitCode {
        match self.execute(line).await {
            Ok(status) => status,
            Err(ExecError::Parse(e)) => {
                eprintln!("syntax error: {e}");
                PARSE_FAILURE
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "line aborted");
                }
                eprintln!("{e}");
                e.status()
            }
        }
    }

    /// Read-eval-print loop. Returns the status the shell should exit with.
    pub async fn repl(&mut self) -> anyhow::Result<ExitCode> {
        let editor = self
            .editor
            .clone()
            .ok_or_else(|| anyhow!("this shell has no line editor"))?;
        let mut recovering = false;
        loop {
            for notice in self.engine.jobs().take_notices() {
                eprintln!("{notice}");
            }
            match self.engine.driving(editor.read_line()).await? {
                Ok(line) => {
                    recovering = false;
                    if line.trim().is_empty() {
                        continue;
                    }
                    editor.add_history(&line);
                    self.run_line(&line).await;
                    if let Some(status) = self.exit_requested() {
                        return Ok(status);
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return Ok(self.engine.last_status()),
                // Reading fails with EIO while another group owns the terminal.
                Err(ReadlineError::Io(e)) if !recovering && self.engine.terminal().is_interactive() => {
                    warn!(error = %e, "line input failed, taking the terminal back");
                    recovering = true;
                    if let Err(e) = self.engine.terminal().restore(RestoreMode::Flush) {
                        debug!(error = %e, "restoring the terminal");
                    }
                }
                Err(e) => return Err(anyhow!("cannot read a line: {e}")),
            }
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

fn root_env(config: &ShellConfig) -> EnvStack {
    let mut env = EnvStack::from_process();
    for (name, value) in &config.env {
        env.root_mut().set(name, value);
    }
    env
}

enum Request {
    ReadLine {
        prompt: String,
        reply: oneshot::Sender<rustyline::Result<String>>,
    },
    History(String),
}

struct EditorState {
    paused: bool,
    prompt: String,
}

/// `rustyline` running on its own thread, driven by the shell loop.
///
/// Reading blocks, so the editor lives outside the runtime and answers
/// requests one at a time. A line is only requested while input is resumed.
pub struct LineEditor {
    requests: mpsc::Sender<Request>,
    state: Mutex<EditorState>,
    resumed: Notify,
}

impl LineEditor {
    pub fn spawn(prompt: &str) -> anyhow::Result<Arc<Self>> {
        let (requests, inbox) = mpsc::channel::<Request>();
        let (ready_tx, ready) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name("line-editor".to_string())
            .spawn(move || {
                let mut editor = match DefaultEditor::new() {
                    Ok(editor) => {
                        let _ = ready_tx.send(Ok(()));
                        editor
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                for request in inbox {
                    match request {
                        Request::ReadLine { prompt, reply } => {
                            let _ = reply.send(editor.readline(&prompt));
                        }
                        Request::History(line) => {
                            if let Err(e) = editor.add_history_entry(line.as_str()) {
                                debug!(error = %e, "history entry dropped");
                            }
                        }
                    }
                }
            })
            .context("cannot start the line editor thread")?;
        ready
            .recv()
            .context("line editor thread died")?
            .map_err(|e| anyhow!("cannot start the line editor: {e}"))?;
        Ok(Arc::new(Self {
            requests,
            state: Mutex::new(EditorState {
                paused: false,
                prompt: prompt.to_string(),
            }),
            resumed: Notify::new(),
        }))
    }

    /// Wait until input is resumed, then read one line.
    pub async fn read_line(&self) -> anyhow::Result<rustyline::Result<String>> {
        loop {
            let resumed = self.resumed.notified();
            if !self.lock().paused {
                break;
            }
            resumed.await;
        }
        let prompt = self.lock().prompt.clone();
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(Request::ReadLine { prompt, reply })
            .map_err(|_| anyhow!("line editor is gone"))?;
        answer.await.context("line editor is gone")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EditorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LineControl for LineEditor {
    fn pause(&self) {
        self.lock().paused = true;
    }

    fn resume(&self) {
        self.lock().paused = false;
        self.resumed.notify_one();
    }

    fn set_prompt(&self, prompt: &str) {
        self.lock().prompt = prompt.to_string();
    }

    fn add_history(&self, line: &str) {
        if self.requests.send(Request::History(line.to_string())).is_err() {
            debug!("line editor is gone, history entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let mut sh = Shell::new();
        let out = sh.run("echo hi | cat").await.unwrap();
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout, b"hi\n");
    }

    #[tokio::test]
    async fn export_sets_the_root_frame() {
        let mut sh = Shell::new();
        sh.export("GREETING", Some("hey"));
        assert_eq!(sh.run("echo $GREETING").await.unwrap().stdout, b"hey\n");
        sh.export("GREETING", None);
        assert_eq!(sh.run("echo [$GREETING]").await.unwrap().stdout, b"[]\n");
    }

    #[tokio::test]
    async fn config_env_reaches_the_root_frame() {
        let config = ShellConfig::from_toml("[env]\nEDITOR = \"vi\"").unwrap();
        let sh = Shell::with_config(config);
        assert_eq!(sh.env().get_var("EDITOR"), Some("vi"));
    }

    #[tokio::test]
    async fn parse_errors_are_reported_not_raised() {
        let mut sh = Shell::new();
        assert!(matches!(sh.run("echo |").await, Err(ExecError::Parse(_))));
        assert_eq!(sh.run_line("echo |").await, PARSE_FAILURE);
    }

    #[tokio::test]
    async fn run_line_returns_the_status() {
        let mut sh = Shell::new();
        assert_eq!(sh.run_line("false").await, 1);
        assert_eq!(sh.run_line("surely-not-a-command").await, 127);
        assert_eq!(sh.run_line("exit 4").await, 4);
        assert_eq!(sh.exit_requested(), Some(4));
    }

    #[tokio::test]
    async fn headless_shell_has_no_loop() {
        let mut sh = Shell::new();
        assert!(sh.repl().await.is_err());
    }
}
