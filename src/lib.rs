//! An embeddable shell execution engine with POSIX job control.
//!
//! Lines are parsed into a [`parser::Sequence`] and run by an [`Engine`]:
//! pipelines mix built-in commands, commands declared by the embedding
//! program, embedded script blocks and external programs, all connected by
//! byte streams. External programs of a foreground pipeline share a process
//! group that owns the terminal until the pipeline finishes or is stopped.
//!
//! The main entry point is [`Shell`], which pairs an engine with its root
//! environment. The public modules expose the pieces for embedding: the
//! [`command`] traits for declaring commands, [`env`] for variable frames,
//! [`job`] for the job registry and [`terminal`] for the terminal seams.

pub mod bridge;
mod builtin;
pub mod command;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
mod expand;
pub mod external;
mod interpreter;
pub mod io_adapters;
pub mod job;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod process;
pub mod redirect;
pub mod script;
pub mod terminal;

pub use config::ShellConfig;
pub use engine::{CaptureResult, Engine};
pub use error::{ExecError, ExecResult};
pub use interpreter::{LineEditor, Shell};
