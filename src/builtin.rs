use crate::command::{CommandFactory, CommandIo, ExecutableCommand, ExitCode, Factory};
use crate::engine::Engine;
use crate::env::EnvStack;
use crate::job::JobState;
use anyhow::{Context, Result, anyhow, bail};
use argh::{EarlyExit, FromArgs};
use futures::future::LocalBoxFuture;
use regex::RegexBuilder;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without spawning a child process.
pub(crate) trait BuiltinCommand: Sized + FromArgs + 'static {
    /// Canonical name of the command, e.g. "echo" or "cd".
    fn name() -> &'static str;

    /// Executes the command using provided IO streams and environment.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    async fn execute(
        self,
        io: &mut CommandIo,
        env: &mut EnvStack,
        engine: &Engine,
    ) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute<'a>(
        self: Box<Self>,
        io: &'a mut CommandIo,
        env: &'a mut EnvStack,
        engine: &'a Engine,
    ) -> LocalBoxFuture<'a, Result<ExitCode>> {
        Box::pin(async move {
            match <T as BuiltinCommand>::execute(*self, io, env, engine).await {
                Ok(x) => Ok(x),
                Err(e) => {
                    io.diagnostic(format!("{e:#}")).await?;
                    Ok(1)
                }
            }
        })
    }
}

struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute<'a>(
        self: Box<Self>,
        io: &'a mut CommandIo,
        _env: &'a mut EnvStack,
        _engine: &'a Engine,
    ) -> LocalBoxFuture<'a, Result<ExitCode>> {
        Box::pin(async move {
            if self.is_error {
                io.diagnostic(self.output.trim_end()).await?;
                Ok(1)
            } else {
                io.stdout.bytes(self.output).await?;
                Ok(0)
            }
        })
    }
}

impl<T: BuiltinCommand> CommandFactory for Factory<T> {
    fn try_create(&self, name: &str, args: &[String]) -> Option<Box<dyn ExecutableCommand>> {
        if name != T::name() {
            return None;
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Some(match T::from_args(&[name], &args) {
            Ok(cmd) => Box::new(cmd),
            Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                output,
                is_error: status.is_err(),
            }),
        })
    }
}

/// Factories for every built-in, in lookup order.
pub(crate) fn all() -> Vec<Box<dyn CommandFactory>> {
    vec![
        Box::new(Factory::<Echo>::default()),
        Box::new(Factory::<Pwd>::default()),
        Box::new(Factory::<Cd>::default()),
        Box::new(Factory::<Exit>::default()),
        Box::new(Factory::<Cat>::default()),
        Box::new(Factory::<WC>::default()),
        Box::new(Factory::<Grep>::default()),
        Box::new(Factory::<Export>::default()),
        Box::new(Factory::<Unset>::default()),
        Box::new(Factory::<Env>::default()),
        Box::new(Factory::<True>::default()),
        Box::new(Factory::<False>::default()),
        Box::new(Factory::<Jobs>::default()),
        Box::new(Factory::<Fg>::default()),
        Box::new(Factory::<Bg>::default()),
    ]
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        let cwd = env::current_dir().context("pwd: can't read current directory")?;
        io.stdout.line(cwd.to_string_lossy()).await?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    async fn execute(self, _io: &mut CommandIo, env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        let target = match &self.target {
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => match env.get_var("HOME") {
                Some(home) => PathBuf::from(home),
                None => bail!("cd: no target and HOME not set"),
            },
        };

        let new_dir = if target.is_absolute() {
            target
        } else {
            env::current_dir()?.join(target)
        };

        let canonical = fs::canonicalize(&new_dir)
            .with_context(|| format!("cd: can't canonicalize {}", new_dir.display()))?;

        env::set_current_dir(&canonical)
            .with_context(|| format!("cd: can't chdir to {}", canonical.display()))?;
        env.set_var("PWD", canonical.to_string_lossy());
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Exit the shell.
pub struct Exit {
    #[argh(positional)]
    /// status to exit with, defaults to the status of the last command.
    pub status: Option<ExitCode>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    async fn execute(self, _io: &mut CommandIo, _env: &mut EnvStack, engine: &Engine) -> Result<ExitCode> {
        let status = self.status.unwrap_or_else(|| engine.last_status());
        engine.request_exit(status);
        Ok(status)
    }
}

#[derive(FromArgs)]
/// write the arguments to standard output, separated by spaces.
/// by default, a trailing newline is printed.
pub struct Echo {
    #[argh(switch, short = 'n')]
    /// do not output the trailing newline.
    pub no_newline: bool,

    #[argh(positional, greedy)]
    /// values to print as-is, separated by spaces.
    pub args: Vec<String>,
}

impl BuiltinCommand for Echo {
    fn name() -> &'static str {
        "echo"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        let s = self.args.join(" ");
        if self.no_newline {
            io.stdout.bytes(s).await?;
        } else {
            io.stdout.line(s).await?;
        }
        Ok(0)
    }
}

fn counts(s: &str) -> (usize, usize, usize) {
    (s.lines().count(), s.split_whitespace().count(), s.len())
}

#[derive(FromArgs)]
/// count lines, words and bytes
pub struct WC {
    #[argh(positional, greedy)]
    /// files to count. If none provided, reads from stdin.
    pub files: Vec<String>,
}

impl BuiltinCommand for WC {
    fn name() -> &'static str {
        "wc"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        if self.files.is_empty() {
            let buf = io.stdin.read_to_end().await?;
            let (lines, words, bytes) = counts(&String::from_utf8_lossy(&buf));
            io.stdout.line(format!("{lines} {words} {bytes}")).await?;
            return Ok(0);
        }
        for fname in self.files {
            let s = tokio::fs::read_to_string(&fname)
                .await
                .map_err(|e| anyhow!("wc: {}: {}", fname, e))?;
            let (lines, words, bytes) = counts(&s);
            io.stdout
                .line(format!("{lines} {words} {bytes} {fname}"))
                .await?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print file(s) to stdout
pub struct Cat {
    #[argh(positional, greedy)]
    /// files to print. If none provided, copies stdin.
    pub files: Vec<String>,
}

impl BuiltinCommand for Cat {
    fn name() -> &'static str {
        "cat"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        if self.files.is_empty() {
            while let Some(chunk) = io.stdin.read_chunk().await? {
                io.stdout.bytes(chunk).await?;
            }
            return Ok(0);
        }
        for fname in self.files {
            let content = tokio::fs::read(&fname)
                .await
                .map_err(|e| anyhow!("cat: {}: {}", fname, e))?;
            io.stdout.bytes(content).await?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print lines matching a pattern
pub struct Grep {
    #[argh(positional)]
    /// the pattern to search for (a regular expression)
    pub pattern: String,

    #[argh(positional, greedy)]
    /// files to search. If none provided, reads from stdin.
    pub files: Vec<String>,

    #[argh(switch, short = 'w')]
    /// match only whole words (using non-word characters as boundaries)
    pub word_regexp: bool,

    #[argh(switch, short = 'i')]
    /// ignore case distinctions
    pub ignore_case: bool,

    #[argh(option, short = 'A', default = "0")]
    /// print NUM lines of trailing context after matching lines
    pub after_context: usize,
}

impl Grep {
    /// Selected lines of `content`, with `--` between non-adjacent context groups.
    fn select(&self, content: &str, file_name: Option<&str>, re: &regex::Regex) -> (String, bool) {
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let mut to_print = vec![false; lines.len()];
        let mut matched = false;

        for (i, line) in lines.iter().enumerate() {
            if re.is_match(line) {
                matched = true;
                let end = (i + self.after_context + 1).min(lines.len());
                to_print[i..end].iter_mut().for_each(|p| *p = true);
            }
        }

        let prefix = file_name.map(|name| format!("{name}:")).unwrap_or_default();
        let mut out = String::new();
        let mut last_printed: Option<usize> = None;
        for (i, line) in lines.iter().enumerate() {
            if !to_print[i] {
                continue;
            }
            if self.after_context > 0 && last_printed.is_some_and(|last| i > last + 1) {
                out.push_str("--\n");
            }
            out.push_str(&prefix);
            out.push_str(line);
            if !line.ends_with('\n') {
                out.push('\n');
            }
            last_printed = Some(i);
        }
        (out, matched)
    }
}

impl BuiltinCommand for Grep {
    fn name() -> &'static str {
        "grep"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        let pattern = if self.word_regexp {
            format!(r"\b({})\b", self.pattern)
        } else {
            self.pattern.clone()
        };

        let re = RegexBuilder::new(&pattern)
            .case_insensitive(self.ignore_case)
            .build()
            .with_context(|| format!("grep: invalid regex pattern: {pattern}"))?;

        if self.files.is_empty() {
            let input = io.stdin.read_to_end().await?;
            let (out, matched) = self.select(&String::from_utf8_lossy(&input), None, &re);
            io.stdout.bytes(out).await?;
            return Ok(if matched { 0 } else { 1 });
        }

        let mut any_match = false;
        let mut failed = false;
        for file_name in &self.files {
            match tokio::fs::read(file_name).await {
                Ok(content) => {
                    let (out, matched) =
                        self.select(&String::from_utf8_lossy(&content), Some(file_name), &re);
                    io.stdout.bytes(out).await?;
                    any_match |= matched;
                }
                Err(e) => {
                    io.diagnostic(format!("grep: {file_name}: {e}")).await?;
                    failed = true;
                }
            }
        }
        Ok(if failed { 2 } else if any_match { 0 } else { 1 })
    }
}

#[derive(FromArgs)]
/// Set a variable in the current scope: `export NAME VALUE` or `export NAME=VALUE`.
pub struct Export {
    #[argh(positional)]
    /// variable name, optionally followed by `=VALUE`
    pub name: String,

    #[argh(positional)]
    /// value to assign; empty when omitted
    pub value: Option<String>,
}

impl BuiltinCommand for Export {
    fn name() -> &'static str {
        "export"
    }

    async fn execute(self, _io: &mut CommandIo, env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        let (name, value) = match (self.name.split_once('='), self.value) {
            (Some((name, inline)), None) => (name.to_string(), inline.to_string()),
            (None, value) => (self.name, value.unwrap_or_default()),
            (Some(_), Some(_)) => bail!("export: too many arguments"),
        };
        if !crate::expand::is_name(&name) {
            bail!("export: `{name}': not a valid identifier");
        }
        env.set_var(name, value);
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Remove variables from the current scope.
pub struct Unset {
    #[argh(positional, greedy)]
    /// names to remove
    pub names: Vec<String>,
}

impl BuiltinCommand for Unset {
    fn name() -> &'static str {
        "unset"
    }

    async fn execute(self, _io: &mut CommandIo, env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        for name in &self.names {
            env.current_mut().unset(name);
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Print the variables of the current scope.
pub struct Env {}

impl BuiltinCommand for Env {
    fn name() -> &'static str {
        "env"
    }

    async fn execute(self, io: &mut CommandIo, env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        let mut out = String::new();
        for (k, v) in env.current().sorted() {
            out.push_str(&format!("{k}={v}\n"));
        }
        io.stdout.bytes(out).await?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Do nothing, successfully.
pub struct True {
    #[argh(positional, greedy)]
    /// ignored
    pub _args: Vec<String>,
}

impl BuiltinCommand for True {
    fn name() -> &'static str {
        "true"
    }

    async fn execute(self, _io: &mut CommandIo, _env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Do nothing, unsuccessfully.
pub struct False {
    #[argh(positional, greedy)]
    /// ignored
    pub _args: Vec<String>,
}

impl BuiltinCommand for False {
    fn name() -> &'static str {
        "false"
    }

    async fn execute(self, _io: &mut CommandIo, _env: &mut EnvStack, _engine: &Engine) -> Result<ExitCode> {
        Ok(1)
    }
}

#[derive(FromArgs)]
/// List jobs.
pub struct Jobs {}

impl BuiltinCommand for Jobs {
    fn name() -> &'static str {
        "jobs"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, engine: &Engine) -> Result<ExitCode> {
        for (id, job) in engine.jobs().list() {
            io.stdout
                .line(format!("[{id}] {} {}", job.state(), job.name()))
                .await?;
        }
        Ok(0)
    }
}

/// Parse `%N` or `N`; `None` selects the most recent job.
fn job_spec(spec: Option<&str>) -> Result<Option<usize>> {
    spec.map(|s| {
        s.trim_start_matches('%')
            .parse::<usize>()
            .map_err(|_| anyhow!("{s}: no such job"))
    })
    .transpose()
}

#[derive(FromArgs)]
/// Continue a stopped job in the foreground.
pub struct Fg {
    #[argh(positional)]
    /// job to continue, as `%N`; defaults to the most recent one
    pub job: Option<String>,
}

impl BuiltinCommand for Fg {
    fn name() -> &'static str {
        "fg"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, engine: &Engine) -> Result<ExitCode> {
        let id = job_spec(self.job.as_deref()).context("fg")?;
        let job = engine
            .jobs()
            .find(id)
            .ok_or_else(|| anyhow!("fg: no such job"))?;
        if job.state() != JobState::Stopped {
            bail!("fg: job {} is not stopped", job.id());
        }
        io.diagnostic(job.name()).await?;
        Ok(engine.continue_in_foreground(job).await?)
    }
}

#[derive(FromArgs)]
/// Continue a stopped job in the background.
pub struct Bg {
    #[argh(positional)]
    /// job to continue, as `%N`; defaults to the most recent one
    pub job: Option<String>,
}

impl BuiltinCommand for Bg {
    fn name() -> &'static str {
        "bg"
    }

    async fn execute(self, io: &mut CommandIo, _env: &mut EnvStack, engine: &Engine) -> Result<ExitCode> {
        let id = job_spec(self.job.as_deref()).context("bg")?;
        let job = engine
            .jobs()
            .find(id)
            .ok_or_else(|| anyhow!("bg: no such job"))?;
        if job.state() != JobState::Stopped {
            bail!("bg: job {} is already running", job.id());
        }
        job.set_background()?;
        io.diagnostic(format!("[{}] {} &", job.id(), job.name())).await?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{bridge, capture};
    use crate::config::ShellConfig;
    use crate::io_adapters::{SharedSink, SharedSource, Source};
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    struct Ran {
        status: ExitCode,
        stdout: String,
        stderr: String,
    }

    async fn run<T: BuiltinCommand>(cmd: T, input: &[u8], env: &mut EnvStack) -> Ran {
        let engine = Engine::detached(ShellConfig::default());
        let (tx, rx) = bridge(4);
        tx.write(input).await.unwrap();
        drop(tx);
        let (out, out_cap) = capture(4, None);
        let (err, err_cap) = capture(4, None);
        let mut io = CommandIo::new(
            SharedSource::new(Source::Bridge(rx)),
            SharedSink::bridge(out),
            SharedSink::bridge(err),
        );
        let exec = async move {
            let status = ExecutableCommand::execute(Box::new(cmd), &mut io, env, &engine)
                .await
                .unwrap();
            drop(io);
            status
        };
        let (status, stdout, stderr) = tokio::join!(exec, out_cap.collect(), err_cap.collect());
        Ran {
            status,
            stdout: String::from_utf8(stdout.bytes).unwrap(),
            stderr: String::from_utf8(stderr.bytes).unwrap(),
        }
    }

    fn scratch_file(content: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_data.txt");
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "{content}").unwrap();
        (dir, path.to_string_lossy().to_string())
    }

    #[tokio::test]
    async fn test_pwd_prints_current_dir() {
        let _lock = lock_current_dir();
        let cur = env::current_dir().unwrap();
        let ran = run(Pwd {}, b"", &mut EnvStack::default()).await;
        assert_eq!(ran.status, 0);
        assert_eq!(ran.stdout, format!("{}\n", cur.to_string_lossy()));
    }

    #[tokio::test]
    async fn test_echo_with_and_without_newline() {
        let mut env = EnvStack::default();
        let args = vec!["hello".to_string(), "world".to_string()];
        let ran = run(Echo { no_newline: false, args }, b"", &mut env).await;
        assert_eq!(ran.stdout, "hello world\n");

        let args = vec!["foo".to_string(), "bar".to_string()];
        let ran = run(Echo { no_newline: true, args }, b"", &mut env).await;
        assert_eq!(ran.stdout, "foo bar");
    }

    #[tokio::test]
    async fn test_cd_to_home_when_none() {
        let _lock = lock_current_dir();
        let orig = env::current_dir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();

        let mut env = EnvStack::default();
        env.set_var("HOME", canonical_temp.to_string_lossy());
        let ran = run(Cd { target: None }, b"", &mut env).await;

        let new_cwd = fs::canonicalize(env::current_dir().unwrap()).unwrap();
        env::set_current_dir(&orig).expect("failed to restore cwd");

        assert_eq!(ran.status, 0);
        assert_eq!(new_cwd, canonical_temp);
        assert_eq!(env.get_var("PWD"), Some(&*canonical_temp.to_string_lossy()));
    }

    #[tokio::test]
    async fn test_cd_nonexistent_path_errors() {
        let _lock = lock_current_dir();
        let orig = env::current_dir().unwrap();
        let target = Some(format!("nonexistent_dir_for_cd_test_{}", std::process::id()));
        let ran = run(Cd { target }, b"", &mut EnvStack::default()).await;

        assert_eq!(ran.status, 1);
        assert!(ran.stderr.starts_with("cd: can't canonicalize"));
        assert_eq!(env::current_dir().unwrap(), orig);
    }

    #[tokio::test]
    async fn test_cat_reads_file_and_stdin() {
        let (_dir, path) = scratch_file("hello\nworld\n");
        let ran = run(Cat { files: vec![path] }, b"", &mut EnvStack::default()).await;
        assert_eq!(ran.stdout, "hello\nworld\n");

        let ran = run(Cat { files: Vec::new() }, b"from stdin\nline2\n", &mut EnvStack::default()).await;
        assert_eq!(ran.stdout, "from stdin\nline2\n");
    }

    #[tokio::test]
    async fn test_cat_missing_file_reports_on_stderr() {
        let ran = run(
            Cat { files: vec!["/definitely/not/here".into()] },
            b"",
            &mut EnvStack::default(),
        )
        .await;
        assert_eq!(ran.status, 1);
        assert!(ran.stdout.is_empty());
        assert!(ran.stderr.starts_with("cat: /definitely/not/here:"));
    }

    #[tokio::test]
    async fn test_wc_counts_file_and_stdin() {
        let (_dir, path) = scratch_file("one two\nthree\n");
        let ran = run(WC { files: vec![path.clone()] }, b"", &mut EnvStack::default()).await;
        assert_eq!(ran.stdout, format!("2 3 14 {path}\n"));

        let ran = run(WC { files: Vec::new() }, b"a b c\n", &mut EnvStack::default()).await;
        assert_eq!(ran.stdout, "1 3 6\n");
    }

    fn grep(pattern: &str, files: Vec<String>, ignore_case: bool, after_context: usize) -> Grep {
        Grep {
            pattern: pattern.to_string(),
            files,
            word_regexp: false,
            ignore_case,
            after_context,
        }
    }

    #[tokio::test]
    async fn test_grep_ignore_case() {
        let (_dir, path) = scratch_file("Target 1\nTaRgEt 2\nNo match\n");
        let ran = run(grep("target", vec![path.clone()], true, 0), b"", &mut EnvStack::default()).await;
        assert_eq!(ran.status, 0);
        assert_eq!(ran.stdout, format!("{path}:Target 1\n{path}:TaRgEt 2\n"));
    }

    #[tokio::test]
    async fn test_grep_trailing_context_separates_groups() {
        let content = "Line 1\nMATCH 1\nLine 3\nLine 4\nMATCH 2\nLine 6\nLine 7\nLine 8\n";
        let (_dir, path) = scratch_file(content);
        let ran = run(grep("MATCH", vec![path.clone()], false, 1), b"", &mut EnvStack::default()).await;
        let expected = format!(
            "{path}:MATCH 1\n{path}:Line 3\n--\n{path}:MATCH 2\n{path}:Line 6\n"
        );
        assert_eq!(ran.stdout, expected);
    }

    #[tokio::test]
    async fn test_grep_context_overlap() {
        let content = "MATCH 1\nLine 2\nMATCH 2\nLine 4\nLine 5\nLine 6\n";
        let (_dir, path) = scratch_file(content);
        let ran = run(grep("MATCH", vec![path.clone()], false, 2), b"", &mut EnvStack::default()).await;
        let expected = format!(
            "{path}:MATCH 1\n{path}:Line 2\n{path}:MATCH 2\n{path}:Line 4\n{path}:Line 5\n"
        );
        assert_eq!(ran.stdout, expected);
    }

    #[tokio::test]
    async fn test_grep_stdin_without_match_fails() {
        let input = b"Line 1\nLine with pipe target\nLine 3\n";
        let ran = run(grep("pipe", Vec::new(), false, 0), input, &mut EnvStack::default()).await;
        assert_eq!(ran.stdout, "Line with pipe target\n");
        assert_eq!(ran.status, 0);

        let ran = run(grep("absent", Vec::new(), false, 0), input, &mut EnvStack::default()).await;
        assert_eq!(ran.stdout, "");
        assert_eq!(ran.status, 1);
    }

    #[tokio::test]
    async fn test_export_unset_and_env() {
        let mut env = EnvStack::default();
        run(Export { name: "FOO".into(), value: Some("bar".into()) }, b"", &mut env).await;
        run(Export { name: "BAZ=qux".into(), value: None }, b"", &mut env).await;
        let ran = run(Env {}, b"", &mut env).await;
        assert_eq!(ran.stdout, "BAZ=qux\nFOO=bar\n");

        run(Unset { names: vec!["FOO".into()] }, b"", &mut env).await;
        let ran = run(Env {}, b"", &mut env).await;
        assert_eq!(ran.stdout, "BAZ=qux\n");
    }

    #[tokio::test]
    async fn test_export_rejects_bad_names() {
        let mut env = EnvStack::default();
        let ran = run(Export { name: "1X".into(), value: None }, b"", &mut env).await;
        assert_eq!(ran.status, 1);
        assert!(env.current().is_empty());
    }

    #[test]
    fn test_factory_matches_by_name_and_reports_bad_args() {
        let factory = Factory::<Echo>::default();
        assert!(factory.try_create("cat", &[]).is_none());
        assert!(factory.try_create("echo", &["-n".into(), "x".into()]).is_some());
        assert!(Factory::<Export>::default().try_create("export", &[]).is_some());
    }

    #[test]
    fn test_job_spec_parsing() {
        assert_eq!(job_spec(None).unwrap(), None);
        assert_eq!(job_spec(Some("%2")).unwrap(), Some(2));
        assert_eq!(job_spec(Some("3")).unwrap(), Some(3));
        assert!(job_spec(Some("%x")).is_err());
    }
}
