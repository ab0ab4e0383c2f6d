//! The double fork that detaches a daemon from its terminal and session.

use crate::{Error, Result, error::FAILURE_EXIT_CODE};

use nix::unistd::{self, ForkResult, Pid};
use std::{
    env,
    fs::File,
    io::{self, Read, Write},
    os::{
        fd::{AsFd, AsRawFd, OwnedFd, RawFd},
        unix::fs::FileTypeExt,
    },
    process::exit,
};
use tracing::debug;

const SUCCESS: &str = "OK";

/// Whether to fork into the background.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Detach {
    /// Detach unless a supervisor already owns the session.
    ///
    /// A supervisor is assumed when the parent is init, when standard input
    /// is a socket handed over by a super-server, or when systemd expects a
    /// readiness notification.
    #[default]
    Auto,
    Always,
    Never,
}

impl Detach {
    pub fn is_required(self) -> bool {
        match self {
            Self::Auto => !Supervision::current().is_supervised(),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// The signs that a supervisor started this process.
#[derive(Clone, Copy, Debug)]
struct Supervision {
    parent: Pid,
    stdin_is_socket: bool,
    notify_socket: bool,
}

impl Supervision {
    fn current() -> Self {
        Self {
            parent: unistd::getppid(),
            stdin_is_socket: is_socket(io::stdin()),
            notify_socket: env::var_os("NOTIFY_SOCKET").is_some(),
        }
    }

    fn is_supervised(&self) -> bool {
        self.parent == Pid::from_raw(1) || self.stdin_is_socket || self.notify_socket
    }
}

fn is_socket<F: AsFd>(fd: F) -> bool {
    fd.as_fd()
        .try_clone_to_owned()
        .map(File::from)
        .and_then(|file| file.metadata())
        .map(|metadata| metadata.file_type().is_socket())
        .unwrap_or(false)
}

/// The daemon's link back to the process that started it.
///
/// After a detaching fork the original process blocks until the daemon
/// sends one message over a pipe. [`Origin::success`] makes it exit with
/// status zero; [`Origin::notify`] makes it print the message to its
/// standard error and exit with a failure status. Dropping the value without
/// sending anything reads as a failure with no explanation.
///
/// A process that did not fork holds an inert `Origin` whose methods do
/// nothing.
#[derive(Debug, Default)]
#[must_use = "dropping `Origin` without calling `success` indicates failure"]
pub struct Origin {
    pipe: Option<File>,
    detached: bool,
}

impl Origin {
    fn detached(fd: OwnedFd) -> Self {
        Self {
            pipe: Some(fd.into()),
            detached: true,
        }
    }

    /// Returns true once the process has forked away from its caller.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Returns true if the original process is still waiting for a message.
    pub fn is_waiting(&self) -> bool {
        self.pipe.is_some()
    }

    /// The pipe descriptor, which must stay open until a message is sent.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.pipe.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Sends an error message to the original process and closes the pipe.
    ///
    /// Calls after the pipe is closed are no-ops.
    pub fn notify(&mut self, message: &str) -> io::Result<()> {
        let Some(mut pipe) = self.pipe.take() else {
            return Ok(());
        };

        pipe.write_all(message.as_bytes())
    }

    /// Tells the original process that the daemon is up and closes the pipe.
    pub fn success(&mut self) -> io::Result<()> {
        self.notify(SUCCESS)
    }
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> Result<Self> {
        let (read, write) = unistd::pipe().map_err(|err| Error::ResourceExhaustion {
            call: "pipe",
            source: err,
        })?;

        Ok(Self { read, write })
    }
}

/// Blocks the original process until the daemon reports back, then exits.
fn wait(read: OwnedFd) -> ! {
    let mut message = String::new();

    if let Err(err) = File::from(read).read_to_string(&mut message) {
        eprintln!("failed to read message from daemon process: {err}");
        exit(FAILURE_EXIT_CODE);
    }

    match message.as_str() {
        SUCCESS => exit(0),
        "" => eprintln!("daemon failed to start"),
        message => eprintln!("daemon failed to start: {message}"),
    }

    exit(FAILURE_EXIT_CODE);
}

/// Reports a failure that happened after the first fork and exits.
fn abort(mut origin: Origin, message: String) -> ! {
    if origin.notify(&message).is_err() {
        eprintln!("{message}");
    }

    exit(FAILURE_EXIT_CODE);
}

/// Forks twice, starting a new session in between.
///
/// Returns in the grandchild, which belongs to a session it does not lead
/// and therefore can never acquire a controlling terminal. The original
/// process does not return: it waits for the grandchild's report and exits.
/// The intermediate child exits as soon as the second fork succeeds.
///
/// A failure to create the pipe or to fork the first time is returned to
/// the caller, which is still attached to its terminal. Later failures are
/// sent to the original process and end the child.
pub fn double_fork() -> Result<Origin> {
    let Pipe { read, write } = Pipe::new()?;

    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => {
            drop(write);
            wait(read)
        }
        Ok(ForkResult::Child) => {
            drop(read);
            child(Origin::detached(write))
        }
        Err(err) => Err(Error::ResourceExhaustion {
            call: "fork",
            source: err,
        }),
    }
}

fn child(origin: Origin) -> Result<Origin> {
    if let Err(err) = unistd::setsid() {
        abort(origin, format!("failed to create a new session: {err}"));
    }

    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => exit(0),
        Ok(ForkResult::Child) => {
            debug!(pid = %unistd::getpid(), "detached from controlling terminal");
            Ok(origin)
        }
        Err(err) => abort(origin, format!("failed to fork off for the second time: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::net::UnixStream;

    #[test]
    fn forced_choices() {
        assert!(Detach::Always.is_required());
        assert!(!Detach::Never.is_required());
    }

    const UNSUPERVISED: Supervision = Supervision {
        parent: Pid::from_raw(4242),
        stdin_is_socket: false,
        notify_socket: false,
    };

    #[test]
    fn launched_from_shell_is_unsupervised() {
        assert!(!UNSUPERVISED.is_supervised());
    }

    #[test]
    fn init_parent_is_supervised() {
        let supervision = Supervision {
            parent: Pid::from_raw(1),
            ..UNSUPERVISED
        };

        assert!(supervision.is_supervised());
    }

    #[test]
    fn socket_stdin_is_supervised() {
        let supervision = Supervision {
            stdin_is_socket: true,
            ..UNSUPERVISED
        };

        assert!(supervision.is_supervised());
    }

    #[test]
    fn notify_socket_is_supervised() {
        let supervision = Supervision {
            notify_socket: true,
            ..UNSUPERVISED
        };

        assert!(supervision.is_supervised());
    }

    #[test]
    fn detects_socket_descriptors() {
        let (socket, _peer) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        let Pipe { read, .. } = Pipe::new().unwrap();

        assert!(is_socket(&socket));
        assert!(!is_socket(&file));
        assert!(!is_socket(&read));
    }

    #[test]
    fn inert_origin_ignores_messages() {
        let mut origin = Origin::default();

        assert!(!origin.is_detached());
        assert!(!origin.is_waiting());
        assert!(origin.raw_fd().is_none());
        origin.notify("ignored").unwrap();
        origin.success().unwrap();
    }

    #[test]
    fn origin_sends_one_message() {
        let Pipe { read, write } = Pipe::new().unwrap();
        let mut origin = Origin::detached(write);

        assert!(origin.is_waiting());
        origin.success().unwrap();
        origin.notify("too late").unwrap();
        assert!(!origin.is_waiting());

        let mut message = String::new();
        File::from(read).read_to_string(&mut message).unwrap();
        assert_eq!(message, SUCCESS);
    }
}
