//! Normalizing redirection operators into file-descriptor operations.

use crate::error::{ExecError, ExecResult};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2};
use std::ffi::CString;
use std::os::fd::RawFd;

/// What happens to the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RedirectionKind {
    Input = 0,
    Output = 1,
    OutputAppend = 2,
    InputOutput = 3,
}

impl RedirectionKind {
    fn open_flags(self) -> OFlag {
        match self {
            RedirectionKind::Input => OFlag::O_RDONLY,
            RedirectionKind::Output => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            RedirectionKind::OutputAppend => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
            RedirectionKind::InputOutput => OFlag::O_RDWR | OFlag::O_CREAT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    File(String),
    /// Duplicate this descriptor, written `&n`.
    Descriptor(RawFd),
}

/// One descriptor operation, applied in order before the program starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub kind: RedirectionKind,
    pub target: Target,
    pub source_fd: RawFd,
}

impl Redirection {
    /// 0 for a file target, 1 for a descriptor.
    pub fn io_type(&self) -> u8 {
        match self.target {
            Target::File(_) => 0,
            Target::Descriptor(_) => 1,
        }
    }

    /// The descriptor `source_fd` ends up referring to; same as `source_fd` for files.
    pub fn dest_fd(&self) -> RawFd {
        match self.target {
            Target::File(_) => self.source_fd,
            Target::Descriptor(fd) => fd,
        }
    }

    /// Everything the child needs, allocated up front.
    pub(crate) fn for_child(&self) -> ExecResult<ChildRedirection> {
        let path = match &self.target {
            Target::File(path) => Some(CString::new(path.as_str()).map_err(|_| {
                ExecError::Redirection(format!("{path}: file name contains a NUL byte"))
            })?),
            Target::Descriptor(_) => None,
        };
        Ok(ChildRedirection {
            flags: self.kind.open_flags(),
            path,
            source_fd: self.source_fd,
            dest_fd: self.dest_fd(),
        })
    }
}

/// Element of the flat operator/operand array produced from a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirToken {
    Operator(String),
    Path(String),
    Descriptor(RawFd),
}

/// Map an operator to its kind, source descriptor and whether it also covers stderr.
fn operator(op: &str) -> ExecResult<(RedirectionKind, RawFd, bool)> {
    match op {
        "&>" => return Ok((RedirectionKind::Output, 1, true)),
        "&>>" => return Ok((RedirectionKind::OutputAppend, 1, true)),
        _ => {}
    }
    let split = op.find(|c: char| !c.is_ascii_digit()).unwrap_or(op.len());
    let (digits, symbol) = op.split_at(split);
    let (kind, default_fd) = match symbol {
        "<" => (RedirectionKind::Input, 0),
        ">" => (RedirectionKind::Output, 1),
        ">>" => (RedirectionKind::OutputAppend, 1),
        "<>" => (RedirectionKind::InputOutput, 0),
        _ => return Err(ExecError::Redirection(format!("unknown operator `{op}'"))),
    };
    let fd = if digits.is_empty() {
        default_fd
    } else {
        digits
            .parse()
            .map_err(|_| ExecError::Redirection(format!("bad descriptor in `{op}'")))?
    };
    Ok((kind, fd, false))
}

/// Translate alternating operator/operand tokens into redirections.
///
/// `&>` and `&>>` produce two records, for fd 1 and fd 2, sharing one target.
/// A descriptor operand is refused after `&>`, `&>>`, `<>` and `n<>`. An odd
/// number of tokens means the caller built the array wrong and nothing is returned.
pub fn resolve(tokens: &[RedirToken]) -> ExecResult<Vec<Redirection>> {
    if tokens.len() % 2 != 0 {
        return Err(ExecError::Invariant(format!(
            "redirection tokens must come in operator/operand pairs, got {}",
            tokens.len()
        )));
    }

    let mut out = Vec::with_capacity(tokens.len() / 2);
    for pair in tokens.chunks_exact(2) {
        let RedirToken::Operator(op) = &pair[0] else {
            return Err(ExecError::Invariant(format!(
                "expected a redirection operator, got {:?}",
                pair[0]
            )));
        };
        let (kind, source_fd, with_stderr) = operator(op)?;
        let target = match &pair[1] {
            RedirToken::Path(path) => Target::File(path.clone()),
            RedirToken::Descriptor(fd) => {
                if with_stderr || kind == RedirectionKind::InputOutput {
                    return Err(ExecError::Redirection(format!("can't have &{fd} after {op}")));
                }
                Target::Descriptor(*fd)
            }
            RedirToken::Operator(other) => {
                return Err(ExecError::Invariant(format!(
                    "operator `{other}' where an operand was expected"
                )));
            }
        };

        if with_stderr {
            out.push(Redirection {
                kind,
                target: target.clone(),
                source_fd: 1,
            });
            out.push(Redirection {
                kind,
                target,
                source_fd: 2,
            });
        } else {
            out.push(Redirection {
                kind,
                target,
                source_fd,
            });
        }
    }
    Ok(out)
}

/// Prepare `redirections` for the child, in order.
///
/// The stderr record of a `&>`/`&>>` pair becomes a copy of fd 1, so both
/// streams share one open file and one offset.
pub(crate) fn for_child(redirections: &[Redirection]) -> ExecResult<Vec<ChildRedirection>> {
    let mut out = Vec::with_capacity(redirections.len());
    for (i, redirection) in redirections.iter().enumerate() {
        let shares_stdout = i > 0 && {
            let previous = &redirections[i - 1];
            redirection.source_fd == 2
                && previous.source_fd == 1
                && previous.kind == redirection.kind
                && matches!(previous.target, Target::File(_))
                && previous.target == redirection.target
        };
        out.push(if shares_stdout {
            ChildRedirection {
                flags: redirection.kind.open_flags(),
                path: None,
                source_fd: 2,
                dest_fd: 1,
            }
        } else {
            redirection.for_child()?
        });
    }
    Ok(out)
}

/// A [`Redirection`] ready to be applied between fork and exec.
#[derive(Debug)]
pub(crate) struct ChildRedirection {
    flags: OFlag,
    path: Option<CString>,
    source_fd: RawFd,
    dest_fd: RawFd,
}

impl ChildRedirection {
    /// Only async-signal-safe calls; nothing here allocates.
    pub(crate) fn apply(&self) -> nix::Result<()> {
        match &self.path {
            Some(path) => {
                let fd = open(path.as_c_str(), self.flags, Mode::from_bits_truncate(0o644))?;
                if fd != self.source_fd {
                    dup2(fd, self.source_fd)?;
                    close(fd)?;
                }
            }
            None => {
                dup2(self.dest_fd, self.source_fd)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(s: &str) -> RedirToken {
        RedirToken::Operator(s.to_string())
    }

    fn path(s: &str) -> RedirToken {
        RedirToken::Path(s.to_string())
    }

    fn single(operator: &str) -> Redirection {
        let mut resolved = resolve(&[op(operator), path("f")]).unwrap();
        assert_eq!(resolved.len(), 1);
        resolved.remove(0)
    }

    #[test]
    fn operator_table() {
        let cases = [
            ("<", RedirectionKind::Input, 0),
            ("3<", RedirectionKind::Input, 3),
            (">", RedirectionKind::Output, 1),
            ("2>", RedirectionKind::Output, 2),
            (">>", RedirectionKind::OutputAppend, 1),
            ("2>>", RedirectionKind::OutputAppend, 2),
            ("<>", RedirectionKind::InputOutput, 0),
            ("5<>", RedirectionKind::InputOutput, 5),
        ];
        for (operator, kind, fd) in cases {
            let r = single(operator);
            assert_eq!((r.kind, r.source_fd), (kind, fd), "operator {operator}");
            assert_eq!(r.target, Target::File("f".into()));
        }
    }

    #[test]
    fn ampersand_forms_expand_to_stdout_and_stderr() {
        for (operator, kind) in [("&>", RedirectionKind::Output), ("&>>", RedirectionKind::OutputAppend)] {
            let resolved = resolve(&[op(operator), path("log")]).unwrap();
            assert_eq!(resolved.len(), 2);
            assert_eq!(resolved[0].source_fd, 1);
            assert_eq!(resolved[1].source_fd, 2);
            assert!(resolved.iter().all(|r| r.kind == kind));
            assert!(resolved.iter().all(|r| r.target == Target::File("log".into())));
        }
    }

    #[test]
    fn descriptor_operand_duplicates() {
        let resolved = resolve(&[op("2>"), RedirToken::Descriptor(1)]).unwrap();
        assert_eq!(resolved[0].target, Target::Descriptor(1));
        assert_eq!(resolved[0].dest_fd(), 1);
        assert_eq!(resolved[0].io_type(), 1);
        assert_eq!(resolved[0].kind as u8, 1);
    }

    #[test]
    fn descriptor_operand_is_refused_after_combined_forms() {
        for operator in ["&>", "&>>", "<>", "4<>"] {
            let err = resolve(&[op(operator), RedirToken::Descriptor(1)]).unwrap_err();
            assert!(matches!(err, ExecError::Redirection(_)), "operator {operator}");
        }
    }

    #[test]
    fn odd_token_count_is_a_contract_error() {
        let err = resolve(&[op(">"), path("a"), op("<")]).unwrap_err();
        assert!(err.is_fatal());
        assert!(resolve(&[]).unwrap().is_empty());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        assert!(resolve(&[op("<<"), path("x")]).is_err());
    }

    #[test]
    fn combined_output_shares_one_open_file() {
        let resolved = resolve(&[op("&>"), path("log")]).unwrap();
        let prepared = for_child(&resolved).unwrap();
        assert_eq!(prepared.len(), 2);
        assert!(prepared[0].path.is_some());
        assert_eq!((prepared[0].source_fd, prepared[0].dest_fd), (1, 1));
        assert!(prepared[1].path.is_none());
        assert_eq!((prepared[1].source_fd, prepared[1].dest_fd), (2, 1));

        let separate = resolve(&[op(">"), path("out"), op("2>"), path("err")]).unwrap();
        assert!(for_child(&separate).unwrap().iter().all(|r| r.path.is_some()));
    }

    #[test]
    fn records_keep_input_order() {
        let resolved = resolve(&[op(">"), path("out"), op("2>"), RedirToken::Descriptor(1)]).unwrap();
        let fds: Vec<RawFd> = resolved.iter().map(|r| r.source_fd).collect();
        assert_eq!(fds, vec![1, 2]);
    }
}
