//! Controlling-terminal ownership and the line-input control surface.

use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::termios::{SetArg, Termios, tcgetattr, tcsetattr};
use nix::unistd::{Pid, getpgrp, getpid, setpgid, tcgetpgrp, tcsetpgrp};
use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Signals the interactive shell ignores while it owns the terminal.
///
/// Children get the default disposition back before `exec`.
pub const JOB_CONTROL_SIGNALS: [Signal; 5] = [
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGINT,
    Signal::SIGQUIT,
];

/// When pending terminal I/O is dealt with on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    /// Wait for queued output to be written.
    #[default]
    Drain,
    /// Wait for output and discard unread input.
    Flush,
    /// Apply immediately.
    Now,
}

impl From<RestoreMode> for SetArg {
    fn from(mode: RestoreMode) -> Self {
        match mode {
            RestoreMode::Drain => SetArg::TCSADRAIN,
            RestoreMode::Flush => SetArg::TCSAFLUSH,
            RestoreMode::Now => SetArg::TCSANOW,
        }
    }
}

/// The controlling terminal as seen by job control.
pub trait Terminal: Send + Sync {
    /// Whether job control is active at all.
    fn is_interactive(&self) -> bool;

    fn shell_pgid(&self) -> Option<Pid>;

    /// Take the terminal back for the shell's group and reset the saved modes.
    fn restore(&self, mode: RestoreMode) -> io::Result<()>;

    /// Make `pgid` the terminal's foreground process group.
    fn give_to(&self, pgid: Pid) -> io::Result<()>;

    /// Descriptor of the terminal device that a child may use to take the
    /// terminal before `exec`. It stays open across `fork`.
    fn device(&self) -> Option<RawFd> {
        None
    }
}

/// Control surface of the line-editing front end.
pub trait LineControl: Send + Sync {
    /// Stop reading input; a foreground job is about to use the terminal.
    fn pause(&self);

    /// Reading may continue.
    fn resume(&self);

    fn set_prompt(&self, prompt: &str);

    fn add_history(&self, line: &str);
}

/// Stand-in for both traits when there is no terminal, e.g. `-c` or tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl Terminal for Headless {
    fn is_interactive(&self) -> bool {
        false
    }

    fn shell_pgid(&self) -> Option<Pid> {
        None
    }

    fn restore(&self, _mode: RestoreMode) -> io::Result<()> {
        Ok(())
    }

    fn give_to(&self, _pgid: Pid) -> io::Result<()> {
        Ok(())
    }
}

impl LineControl for Headless {
    fn pause(&self) {}

    fn resume(&self) {}

    fn set_prompt(&self, _prompt: &str) {}

    fn add_history(&self, _line: &str) {}
}

/// The real controlling terminal on stdin.
#[derive(Debug)]
pub struct Tty {
    /// Private copy of stdin, so children still reach the terminal after
    /// their own stdin was replaced by a pipe.
    device: OwnedFd,
    shell_pgid: Pid,
    modes: Mutex<Option<Termios>>,
}

impl Tty {
    /// Set the shell up for job control if stdin is a terminal.
    ///
    /// Waits until the shell is in the foreground, ignores the job-control
    /// signals, puts the shell in its own process group, takes the terminal
    /// and saves its modes. Returns `None` when stdin is not a terminal.
    pub fn acquire() -> io::Result<Option<Self>> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }

        loop {
            let own = getpgrp();
            if tcgetpgrp(stdin.as_fd())? == own {
                break;
            }
            kill(Pid::from_raw(-own.as_raw()), Signal::SIGTTIN)?;
        }

        for sig in JOB_CONTROL_SIGNALS {
            // SAFETY: installing SIG_IGN runs no handler code.
            unsafe { signal(sig, SigHandler::SigIgn) }?;
        }

        let pid = getpid();
        if let Err(e) = setpgid(pid, pid) {
            // Session leaders cannot change group and already lead one.
            debug!(error = %e, "setpgid for the shell failed");
        }
        let shell_pgid = getpgrp();
        let device = stdin.as_fd().try_clone_to_owned()?;
        tcsetpgrp(&device, shell_pgid)?;
        let modes = tcgetattr(&device).ok();
        debug!(pgid = shell_pgid.as_raw(), "acquired terminal");

        Ok(Some(Self {
            device,
            shell_pgid,
            modes: Mutex::new(modes),
        }))
    }
}

impl Terminal for Tty {
    fn is_interactive(&self) -> bool {
        true
    }

    fn shell_pgid(&self) -> Option<Pid> {
        Some(self.shell_pgid)
    }

    fn restore(&self, mode: RestoreMode) -> io::Result<()> {
        tcsetpgrp(&self.device, self.shell_pgid)?;
        let modes = self.modes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(modes) = modes.as_ref() {
            tcsetattr(&self.device, mode.into(), modes)?;
        }
        Ok(())
    }

    fn give_to(&self, pgid: Pid) -> io::Result<()> {
        tcsetpgrp(&self.device, pgid)?;
        Ok(())
    }

    fn device(&self) -> Option<RawFd> {
        Some(self.device.as_raw_fd())
    }
}
