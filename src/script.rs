//! Embedded script blocks evaluated with rhai.
//!
//! Every invocation gets a fresh engine and scope seeded with `args`, `env`
//! and, in return mode, `stdin`. Evaluation runs on the blocking pool and
//! talks to the pipeline through bounded bridges.

use crate::bridge::{BridgeReader, BridgeWriter, bridge};
use crate::command::{ExitCode, Yield, Yielder};
use crate::env::Frame;
use crate::error::{ExecError, ExecResult};
use crate::expand::is_name;
use crate::io_adapters::{SharedSink, SharedSource, Source, pump};
use crate::parser::ScriptMode;
use rhai::{Array, Dynamic, EvalAltResult, Map, Scope};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Names every script scope is seeded with; globals may not shadow them.
const SEEDED: [&str; 3] = ["args", "env", "stdin"];

/// Values copied into every script scope at invocation time.
#[derive(Debug, Clone, Default)]
pub struct ScriptGlobals {
    values: BTreeMap<String, Dynamic>,
}

impl ScriptGlobals {
    pub fn set(&mut self, name: impl Into<String>, value: Dynamic) {
        self.values.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Dynamic> {
        self.values.remove(name)
    }

    /// The bindings that may enter a script scope.
    ///
    /// Only valid identifiers that do not collide with the seeded names are kept.
    pub fn admitted(&self) -> Vec<(String, Dynamic)> {
        self.values
            .iter()
            .filter(|(name, _)| is_name(name) && !SEEDED.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Everything one script invocation needs, detached from the engine.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub source: String,
    pub mode: ScriptMode,
    pub args: Vec<String>,
    pub env: Frame,
    pub globals: Vec<(String, Dynamic)>,
    /// `0` means unlimited.
    pub max_operations: u64,
    pub bridge_capacity: usize,
}

impl ScriptJob {
    fn engine(&self) -> rhai::Engine {
        let mut engine = rhai::Engine::new();
        if self.max_operations > 0 {
            engine.set_max_operations(self.max_operations);
        }
        engine
    }

    fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, value) in &self.globals {
            scope.push_dynamic(name.as_str(), value.clone());
        }
        let args: Array = self.args.iter().cloned().map(Dynamic::from).collect();
        let env: Map = self
            .env
            .iter()
            .map(|(k, v)| (k.into(), Dynamic::from(v.to_string())))
            .collect();
        scope.push_constant("args", args);
        scope.push_constant("env", env);
        scope
    }
}

fn script_error(e: impl ToString) -> ExecError {
    ExecError::Script(e.to_string())
}

/// Run `job` with the given streams and return its status.
pub async fn run(
    job: ScriptJob,
    stdin: SharedSource,
    stdout: SharedSink,
    stderr: SharedSink,
) -> ExecResult<ExitCode> {
    debug!(mode = ?job.mode, "running script block");
    match job.mode {
        ScriptMode::Return => run_return(job, stdin, stdout).await,
        ScriptMode::Iterable => run_iterable(job, stdout).await,
        ScriptMode::Stream => run_stream(job, stdin, stdout, stderr).await,
    }
}

/// Turn a value into output bytes the way `print` shows it.
fn display(value: &Dynamic) -> String {
    value.to_string()
}

async fn run_return(job: ScriptJob, stdin: SharedSource, stdout: SharedSink) -> ExecResult<ExitCode> {
    let input = if stdin.is_piped().await {
        String::from_utf8_lossy(&stdin.read_to_end().await?).into_owned()
    } else {
        String::new()
    };
    let (out, out_reader) = bridge(job.bridge_capacity);

    let task = tokio::task::spawn_blocking(move || {
        let mut engine = job.engine();
        let printer = out.clone();
        engine.on_print(move |text| {
            let _ = printer.blocking_write(format!("{text}\n").as_bytes());
        });
        let mut scope = job.scope();
        scope.push_constant("stdin", input);
        let value = engine
            .eval_with_scope::<Dynamic>(&mut scope, &job.source)
            .map_err(script_error)?;
        if let Ok(code) = value.as_int() {
            return Ok(code as ExitCode);
        }
        if !value.is_unit() {
            let _ = out.blocking_write(format!("{}\n", display(&value)).as_bytes());
        }
        Ok(0)
    });

    let (status, pumped) = tokio::join!(task, pump(Source::Bridge(out_reader), stdout));
    pumped?;
    status.map_err(script_error)?
}

fn to_yield(value: Dynamic) -> Yield {
    if let Ok(code) = value.as_int() {
        return Yield::Status(code as ExitCode);
    }
    if value.is_blob() {
        if let Ok(bytes) = value.clone().into_blob() {
            return Yield::Bytes(bytes);
        }
    }
    match value.into_string() {
        Ok(s) => Yield::Line(s),
        Err(_) => Yield::Line(String::new()),
    }
}

async fn run_iterable(job: ScriptJob, stdout: SharedSink) -> ExecResult<ExitCode> {
    let (tx, mut rx) = mpsc::channel::<Yield>(job.bridge_capacity.max(1));

    let task = tokio::task::spawn_blocking(move || {
        let mut engine = job.engine();
        let printer = tx.clone();
        engine.on_print(move |text| {
            let _ = printer.blocking_send(Yield::Line(text.to_string()));
        });
        let emitter = tx;
        engine.register_fn("emit", move |value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let item = if value.is_int() || value.is_blob() || value.is_string() {
                to_yield(value)
            } else {
                Yield::Line(display(&value))
            };
            emitter
                .blocking_send(item)
                .map_err(|_| "output closed".into())
        });
        let mut scope = job.scope();
        engine
            .run_with_scope(&mut scope, &job.source)
            .map_err(script_error)
    });

    let drain = async {
        let mut yielder = Yielder::new(stdout);
        while let Some(item) = rx.recv().await {
            yielder.send(item).await?;
        }
        yielder.sink().flush().await?;
        Ok::<_, std::io::Error>(yielder.status())
    };

    let (outcome, status) = tokio::join!(task, drain);
    outcome.map_err(script_error)??;
    Ok(status?)
}

/// Line-oriented access to the script's stdin bridge.
struct LineReader {
    reader: BridgeReader,
    pending: Vec<u8>,
    eof: bool,
}

impl LineReader {
    fn fill(&mut self) -> bool {
        match self.reader.blocking_read_chunk() {
            Some(chunk) => {
                self.pending.extend_from_slice(&chunk);
                true
            }
            None => {
                self.eof = true;
                false
            }
        }
    }

    fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
            }
            if self.eof || !self.fill() {
                if self.pending.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.pending);
                return Some(String::from_utf8_lossy(&rest).into_owned());
            }
        }
    }

    fn read_all(&mut self) -> String {
        while !self.eof && self.fill() {}
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}

type Settlement = Arc<Mutex<Option<Result<ExitCode, String>>>>;

fn settle(slot: &Settlement, outcome: Result<ExitCode, String>) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(outcome);
    }
}

fn register_writer(engine: &mut rhai::Engine, name: &str, writer: BridgeWriter) {
    engine.register_fn(name, move |text: &str| -> Result<(), Box<EvalAltResult>> {
        writer
            .blocking_write(text.as_bytes())
            .map_err(|e| e.to_string().into())
    });
}

async fn run_stream(
    job: ScriptJob,
    stdin: SharedSource,
    stdout: SharedSink,
    stderr: SharedSink,
) -> ExecResult<ExitCode> {
    let (in_writer, in_reader) = bridge(job.bridge_capacity);
    let (out, out_reader) = bridge(job.bridge_capacity);
    let (err, err_reader) = bridge(job.bridge_capacity);

    // The terminal is left alone; a script only sees piped input.
    let feeder = stdin.is_piped().await.then(|| {
        tokio::spawn(async move {
            while let Ok(Some(chunk)) = stdin.read_chunk().await {
                if in_writer.write(&chunk).await.is_err() {
                    break;
                }
            }
        })
    });

    let settlement: Settlement = Arc::default();
    let slot = Arc::clone(&settlement);
    let task = tokio::task::spawn_blocking(move || {
        let mut engine = job.engine();
        let input = Arc::new(Mutex::new(LineReader {
            reader: in_reader,
            pending: Vec::new(),
            eof: false,
        }));

        let lines = Arc::clone(&input);
        engine.register_fn("read_line", move || -> Dynamic {
            let mut input = lines.lock().unwrap_or_else(PoisonError::into_inner);
            input.read_line().map_or(Dynamic::UNIT, Dynamic::from)
        });
        engine.register_fn("read_all", move || -> String {
            input.lock().unwrap_or_else(PoisonError::into_inner).read_all()
        });

        let printer = out.clone();
        engine.on_print(move |text| {
            let _ = printer.blocking_write(format!("{text}\n").as_bytes());
        });
        register_writer(&mut engine, "write", out);
        register_writer(&mut engine, "write_err", err);

        let resolved = Arc::clone(&slot);
        engine.register_fn("resolve", move |code: i64| settle(&resolved, Ok(code as ExitCode)));
        let rejected = Arc::clone(&slot);
        engine.register_fn("reject", move |message: &str| {
            settle(&rejected, Err(message.to_string()))
        });

        let mut scope = job.scope();
        engine
            .run_with_scope(&mut scope, &job.source)
            .map_err(script_error)
    });

    let (outcome, out_pumped, err_pumped) = tokio::join!(
        task,
        pump(Source::Bridge(out_reader), stdout),
        pump(Source::Bridge(err_reader), stderr),
    );
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    outcome.map_err(script_error)??;
    out_pumped?;
    err_pumped?;

    let settled = settlement
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match settled {
        Some(Ok(code)) => Ok(code),
        Some(Err(message)) => Err(ExecError::Script(message)),
        None => Err(ExecError::Script(
            "stream block finished without calling resolve or reject".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::capture;

    fn job(source: &str, mode: ScriptMode) -> ScriptJob {
        ScriptJob {
            source: source.to_string(),
            mode,
            args: vec!["a".into(), "b".into()],
            env: [("HOME", "/home/test")].into_iter().collect(),
            globals: Vec::new(),
            max_operations: 10_000,
            bridge_capacity: 4,
        }
    }

    fn piped(data: &str) -> SharedSource {
        let (writer, reader) = bridge(4);
        let data = data.as_bytes().to_vec();
        tokio::spawn(async move {
            let _ = writer.write(&data).await;
        });
        SharedSource::new(Source::Bridge(reader))
    }

    async fn run_captured(job: ScriptJob, stdin: SharedSource) -> (ExecResult<ExitCode>, String) {
        let (out, cap) = capture(4, None);
        let (status, captured) = tokio::join!(
            run(job, stdin, SharedSink::bridge(out), SharedSink::stderr()),
            cap.collect()
        );
        (status, String::from_utf8(captured.bytes).unwrap())
    }

    #[tokio::test]
    async fn return_mode_integer_is_the_status() {
        let (status, out) = run_captured(
            job(r#"print(args[1]); 3"#, ScriptMode::Return),
            SharedSource::new(Source::Empty),
        )
        .await;
        assert_eq!(status.unwrap(), 3);
        assert_eq!(out, "b\n");
    }

    #[tokio::test]
    async fn return_mode_prints_other_values() {
        let (status, out) = run_captured(
            job(r#"env["HOME"] + ":" + stdin"#, ScriptMode::Return),
            piped("in"),
        )
        .await;
        assert_eq!(status.unwrap(), 0);
        assert_eq!(out, "/home/test:in\n");
    }

    #[tokio::test]
    async fn iterable_mode_follows_the_yield_protocol() {
        let (status, out) = run_captured(
            job(r#"emit("x"); emit(5); emit("y"); emit(2);"#, ScriptMode::Iterable),
            SharedSource::new(Source::Empty),
        )
        .await;
        assert_eq!(status.unwrap(), 2);
        assert_eq!(out, "x\n5\ny\n");
    }

    #[tokio::test]
    async fn stream_mode_reads_lines_and_resolves() {
        let source = r#"
            let n = 0;
            loop {
                let line = read_line();
                if line == () { break; }
                write(line.to_upper() + "\n");
                n += 1;
            }
            resolve(n);
        "#;
        let (status, out) = run_captured(job(source, ScriptMode::Stream), piped("ab\ncd\n")).await;
        assert_eq!(status.unwrap(), 2);
        assert_eq!(out, "AB\nCD\n");
    }

    #[tokio::test]
    async fn stream_mode_must_settle() {
        let (status, _) =
            run_captured(job("let x = 1;", ScriptMode::Stream), SharedSource::new(Source::Empty)).await;
        assert!(matches!(status, Err(ExecError::Script(_))));

        let (status, _) = run_captured(
            job(r#"reject("nope"); resolve(0);"#, ScriptMode::Stream),
            SharedSource::new(Source::Empty),
        )
        .await;
        assert!(matches!(status, Err(ExecError::Script(m)) if m == "nope"));
    }

    #[tokio::test]
    async fn operation_budget_stops_runaway_scripts() {
        let (status, _) = run_captured(
            job("loop { }", ScriptMode::Return),
            SharedSource::new(Source::Empty),
        )
        .await;
        assert!(matches!(status, Err(ExecError::Script(_))));
    }

    #[tokio::test]
    async fn globals_are_copied_through_the_filter() {
        let mut globals = ScriptGlobals::default();
        globals.set("greeting", Dynamic::from("hello".to_string()));
        globals.set("args", Dynamic::from(1_i64));
        globals.set("not a name", Dynamic::from(2_i64));
        let admitted = globals.admitted();
        assert_eq!(admitted.len(), 1);

        let mut script = job("greeting + \" \" + args.len()", ScriptMode::Return);
        script.globals = admitted;
        let (status, out) = run_captured(script, SharedSource::new(Source::Empty)).await;
        assert_eq!(status.unwrap(), 0);
        assert_eq!(out, "hello 2\n");
    }
}
