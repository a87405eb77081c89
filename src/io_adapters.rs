use crate::bridge::{BridgeReader, BridgeWriter};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

const CHUNK: usize = 16 * 1024;

/// Readable end handed to a pipeline stage.
#[derive(Debug)]
pub enum Source {
    /// Always at end-of-stream.
    Empty,
    /// The shell's own standard input.
    Terminal(tokio::io::Stdin),
    Bridge(BridgeReader),
    /// Standard output of a child process.
    Pipe(tokio::process::ChildStdout),
    /// Standard error of a child process.
    ErrPipe(tokio::process::ChildStderr),
    File(tokio::fs::File),
}

impl Source {
    /// Adopt the stdout of a child spawned with `Stdio::piped()`.
    pub fn from_child(stdout: std::process::ChildStdout) -> io::Result<Self> {
        Ok(Source::Pipe(tokio::process::ChildStdout::from_std(stdout)?))
    }

    pub fn from_child_stderr(stderr: std::process::ChildStderr) -> io::Result<Self> {
        Ok(Source::ErrPipe(tokio::process::ChildStderr::from_std(stderr)?))
    }

    /// Whether reading this source consumes upstream output rather than the terminal.
    pub fn is_piped(&self) -> bool {
        !matches!(self, Source::Empty | Source::Terminal(_))
    }

    /// Next chunk of bytes, `None` at end-of-stream.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; CHUNK];
        let n = match self {
            Source::Empty => return Ok(None),
            Source::Bridge(reader) => return Ok(reader.read_chunk().await),
            Source::Terminal(stdin) => stdin.read(&mut buf).await?,
            Source::Pipe(stdout) => stdout.read(&mut buf).await?,
            Source::ErrPipe(stderr) => stderr.read(&mut buf).await?,
            Source::File(file) => file.read(&mut buf).await?,
        };
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Writable end handed to a pipeline stage.
#[derive(Debug)]
pub enum Sink {
    Terminal(tokio::io::Stdout),
    Stderr(tokio::io::Stderr),
    Bridge(BridgeWriter),
    /// Standard input of a child process.
    Pipe(tokio::process::ChildStdin),
    File(tokio::fs::File),
}

impl Sink {
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Sink::Bridge(writer) => writer.write(buf).await,
            Sink::Terminal(out) => {
                out.write_all(buf).await?;
                out.flush().await
            }
            Sink::Stderr(err) => {
                err.write_all(buf).await?;
                err.flush().await
            }
            Sink::Pipe(stdin) => stdin.write_all(buf).await,
            Sink::File(file) => file.write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Bridge(_) => Ok(()),
            Sink::Terminal(out) => out.flush().await,
            Sink::Stderr(err) => err.flush().await,
            Sink::Pipe(stdin) => stdin.flush().await,
            Sink::File(file) => file.flush().await,
        }
    }
}

/// A [`Source`] that several sequential consumers can take turns reading,
/// e.g. every pipeline inside a subshell whose input is piped.
#[derive(Debug, Clone)]
pub struct SharedSource(Arc<Mutex<Source>>);

impl SharedSource {
    pub fn new(source: Source) -> Self {
        Self(Arc::new(Mutex::new(source)))
    }

    pub async fn read_chunk(&self) -> io::Result<Option<Vec<u8>>> {
        self.0.lock().await.read_chunk().await
    }

    pub async fn read_to_end(&self) -> io::Result<Vec<u8>> {
        self.0.lock().await.read_to_end().await
    }

    pub async fn is_piped(&self) -> bool {
        self.0.lock().await.is_piped()
    }
}

/// A [`Sink`] shared by everything that writes to the same destination.
///
/// The destination is closed when the last clone is dropped, which is how
/// end-of-stream travels across a stage boundary.
#[derive(Debug, Clone)]
pub struct SharedSink(Arc<Mutex<Sink>>);

impl SharedSink {
    pub fn new(sink: Sink) -> Self {
        Self(Arc::new(Mutex::new(sink)))
    }

    pub fn terminal() -> Self {
        Self::new(Sink::Terminal(tokio::io::stdout()))
    }

    pub fn stderr() -> Self {
        Self::new(Sink::Stderr(tokio::io::stderr()))
    }

    pub fn bridge(writer: BridgeWriter) -> Self {
        Self::new(Sink::Bridge(writer))
    }

    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.0.lock().await.write_all(buf).await
    }

    pub async fn flush(&self) -> io::Result<()> {
        self.0.lock().await.flush().await
    }
}

/// Copy `from` into `to` until end-of-stream. Returns the number of bytes moved.
pub async fn pump(mut from: Source, to: SharedSink) -> io::Result<u64> {
    let mut moved = 0u64;
    while let Some(chunk) = from.read_chunk().await? {
        to.write_all(&chunk).await?;
        moved += chunk.len() as u64;
    }
    to.flush().await?;
    Ok(moved)
}

/// Feed a child's stdin from a shared source, then close it.
///
/// A child that exits before reading everything is not an error.
pub async fn feed_child(from: SharedSource, mut stdin: tokio::process::ChildStdin) -> io::Result<()> {
    while let Some(chunk) = from.read_chunk().await? {
        match stdin.write_all(&chunk).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    match stdin.shutdown().await {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
        _ => Ok(()),
    }
}
