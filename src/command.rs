use crate::engine::Engine;
use crate::env::{EnvStack, Frame};
use crate::io_adapters::{SharedSink, SharedSource};
use futures::StreamExt;
use futures::future::LocalBoxFuture;
use futures::stream::BoxStream;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// One item produced by an in-process command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Yield {
    /// Written to stdout followed by a newline.
    Line(String),
    /// Written to stdout as is.
    Bytes(Vec<u8>),
    /// Pending exit status. Printed as a line only if something else is yielded after it.
    Status(ExitCode),
}

impl From<&str> for Yield {
    fn from(s: &str) -> Self {
        Yield::Line(s.to_string())
    }
}

impl From<String> for Yield {
    fn from(s: String) -> Self {
        Yield::Line(s)
    }
}

impl From<Vec<u8>> for Yield {
    fn from(b: Vec<u8>) -> Self {
        Yield::Bytes(b)
    }
}

impl From<ExitCode> for Yield {
    fn from(code: ExitCode) -> Self {
        Yield::Status(code)
    }
}

/// Stdout of an in-process command, speaking the generator protocol.
///
/// The last integer yielded is the command's status. An integer that is
/// followed by any other yield is flushed to stdout as text first.
pub struct Yielder {
    out: SharedSink,
    pending: Option<ExitCode>,
    status: ExitCode,
}

impl Yielder {
    pub fn new(out: SharedSink) -> Self {
        Self {
            out,
            pending: None,
            status: 0,
        }
    }

    pub async fn send(&mut self, item: Yield) -> io::Result<()> {
        if let Some(code) = self.pending.take() {
            self.out.write_all(format!("{code}\n").as_bytes()).await?;
        }
        match item {
            Yield::Line(mut line) => {
                line.push('\n');
                self.out.write_all(line.as_bytes()).await
            }
            Yield::Bytes(bytes) => self.out.write_all(&bytes).await,
            Yield::Status(code) => {
                self.pending = Some(code);
                self.status = code;
                Ok(())
            }
        }
    }

    pub async fn line(&mut self, line: impl Into<String>) -> io::Result<()> {
        self.send(Yield::Line(line.into())).await
    }

    pub async fn bytes(&mut self, bytes: impl Into<Vec<u8>>) -> io::Result<()> {
        self.send(Yield::Bytes(bytes.into())).await
    }

    /// Status of the last integer yielded so far, 0 if none.
    pub fn status(&self) -> ExitCode {
        self.status
    }

    pub fn sink(&self) -> &SharedSink {
        &self.out
    }
}

/// Streams handed to an in-process command.
pub struct CommandIo {
    pub stdin: SharedSource,
    pub stdout: Yielder,
    pub stderr: SharedSink,
}

impl CommandIo {
    pub fn new(stdin: SharedSource, stdout: SharedSink, stderr: SharedSink) -> Self {
        Self {
            stdin,
            stdout: Yielder::new(stdout),
            stderr,
        }
    }

    /// Write one diagnostic line to stderr.
    pub async fn diagnostic(&self, message: impl fmt::Display) -> io::Result<()> {
        self.stderr
            .write_all(format!("{message}\n").as_bytes())
            .await
    }
}

/// Object-safe trait for any command the shell runs in-process.
///
/// This is implemented by built-ins via a blanket impl and by declared commands.
pub trait ExecutableCommand {
    fn execute<'a>(
        self: Box<Self>,
        io: &'a mut CommandIo,
        env: &'a mut EnvStack,
        engine: &'a Engine,
    ) -> LocalBoxFuture<'a, anyhow::Result<ExitCode>>;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    fn try_create(&self, name: &str, args: &[String]) -> Option<Box<dyn ExecutableCommand>>;
}

/// Factory for one statically known command type.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

/// Body of a declared command: receives its arguments, a snapshot of the
/// caller's variables and its stdin, and produces a stream of [`Yield`]s.
pub type DeclaredFn =
    dyn Fn(Vec<String>, Frame, SharedSource) -> BoxStream<'static, Yield> + Send + Sync;

/// A user-registered in-process command.
#[derive(Clone)]
pub struct DeclaredCommand(Arc<DeclaredFn>);

impl DeclaredCommand {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<String>, Frame, SharedSource) -> BoxStream<'static, Yield> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn invocation(&self, args: Vec<String>) -> Box<dyn ExecutableCommand> {
        Box::new(DeclaredInvocation {
            body: Arc::clone(&self.0),
            args,
        })
    }
}

impl fmt::Debug for DeclaredCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeclaredCommand")
    }
}

struct DeclaredInvocation {
    body: Arc<DeclaredFn>,
    args: Vec<String>,
}

impl ExecutableCommand for DeclaredInvocation {
    fn execute<'a>(
        self: Box<Self>,
        io: &'a mut CommandIo,
        env: &'a mut EnvStack,
        _engine: &'a Engine,
    ) -> LocalBoxFuture<'a, anyhow::Result<ExitCode>> {
        let DeclaredInvocation { body, args } = *self;
        Box::pin(async move {
            let mut items = body(args, env.current().clone(), io.stdin.clone());
            while let Some(item) = items.next().await {
                io.stdout.send(item).await?;
            }
            Ok(io.stdout.status())
        })
    }
}
