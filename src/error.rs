use crate::context::Phase;

use nix::{errno::Errno, sys::signal::Signal, unistd::Pid};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Exit status used by every process that gives up on daemonization.
pub const FAILURE_EXIT_CODE: i32 = 1;

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons the daemon could not be started or stopped.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration names something that does not exist or cannot be
    /// used. Always detected before the process is forked.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A system call that creates kernel objects (processes, pipes, sessions)
    /// failed.
    #[error("{call} failed: {source}")]
    ResourceExhaustion {
        call: &'static str,
        #[source]
        source: Errno,
    },

    /// Another live process holds the lock on the pidfile.
    #[error("{} is locked by {}", .path.display(), holder(.pid))]
    AlreadyRunning { path: PathBuf, pid: Option<Pid> },

    /// The pidfile names a process that no longer holds the lock and the
    /// configured policy forbids reclaiming it.
    #[error(
        "{} is stale (last written by {}); remove it to start",
        .path.display(),
        holder(.pid)
    )]
    StalePidFile { path: PathBuf, pid: Option<Pid> },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to install handler for {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("failed to change process owner: {0}")]
    Privileges(String),

    #[error("cannot {operation} a daemon context in the {phase} phase")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
}

impl Error {
    pub(crate) fn io<C: Into<String>>(context: C, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn errno<C: Into<String>>(context: C, errno: Errno) -> Self {
        Self::io(context, io::Error::from(errno))
    }

    /// The process exit status that corresponds to this error.
    pub fn exit_code(&self) -> i32 {
        FAILURE_EXIT_CODE
    }
}

fn holder(pid: &Option<Pid>) -> String {
    match pid {
        Some(pid) => format!("process {pid}"),
        None => "an unknown process".into(),
    }
}
