//! Single-instance pidfiles backed by an advisory `flock(2)` lock.
//!
//! The lock, not the file's existence, decides whether a daemon is running.
//! A file left behind by a crashed daemon is unlocked because the kernel
//! drops the lock together with the holder's last descriptor, so it can be
//! reclaimed without ever deleting and recreating the path.
//!
//! The file holds the decimal process ID followed by a newline. Readers
//! ignore surrounding whitespace and report anything else as an unknown
//! holder.

use crate::{Error, Result};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
    unistd::{self, Pid},
};
use std::{
    fmt::{self, Debug, Formatter},
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Read, Seek, Write},
    os::{
        fd::{AsRawFd, RawFd},
        unix::fs::{MetadataExt, OpenOptionsExt},
    },
    path::{self, Path, PathBuf},
};
use tracing::{debug, warn};

/// What to do when a pidfile names a process that no longer holds its lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum StalePolicy {
    /// Take the lock and overwrite the old contents.
    #[default]
    Reclaim,
    /// Fail with [`Error::StalePidFile`] and leave the file untouched.
    Refuse,
}

/// The state of a pidfile as seen by an outside observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidFileStatus {
    Missing,
    /// The file exists but nobody holds the lock.
    Unlocked { pid: Option<Pid> },
    /// A live process holds the lock.
    Locked { pid: Option<Pid> },
}

/// An exclusive lock on a pidfile.
///
/// Dropping the value releases the lock but leaves the file in place; call
/// [`PidFileLock::release`] to also remove it.
pub struct PidFileLock {
    path: PathBuf,
    file: Flock<File>,
    pid: Pid,
}

impl PidFileLock {
    /// Opens or creates the file at `path`, takes the lock without blocking,
    /// and records the calling process's ID.
    ///
    /// A relative `path` is resolved against the current directory once, here,
    /// so the lock can still find its file after the daemon changes directory.
    ///
    /// Fails with [`Error::AlreadyRunning`] if another open file description
    /// holds the lock. The holder's file contents are not modified.
    pub fn acquire<P: AsRef<Path>>(path: P, policy: StalePolicy) -> Result<Self> {
        let path = path::absolute(path.as_ref()).map_err(|err| {
            Error::io(
                format!("failed to resolve pidfile '{}'", path.as_ref().display()),
                err,
            )
        })?;

        // A holder may unlink the file between our open and our lock, leaving
        // us locking an inode no one else can reach.
        let mut file = loop {
            if let Some(file) = lock_current(open(&path)?, &path)? {
                break file;
            }

            debug!(path = %path.display(), "pidfile was replaced while locking");
        };

        let previous = read_contents(&mut file).map_err(|err| {
            Error::io(format!("failed to read pidfile '{}'", path.display()), err)
        })?;

        if !previous.trim().is_empty() {
            let stale = parse_pid(&previous);

            match policy {
                StalePolicy::Refuse => {
                    return Err(Error::StalePidFile { path, pid: stale });
                }
                StalePolicy::Reclaim => warn!(
                    path = %path.display(),
                    pid = ?stale,
                    "reclaiming stale pidfile"
                ),
            }
        }

        let mut lock = Self {
            path,
            file,
            pid: unistd::getpid(),
        };

        lock.rewrite(lock.pid)?;
        debug!(path = %lock.path.display(), pid = %lock.pid, "acquired pidfile lock");

        Ok(lock)
    }

    /// Re-expresses the path as seen from inside `root` after a `chroot`.
    pub(crate) fn enter_root(&mut self, root: &Path) -> Result<()> {
        let root = path::absolute(root).map_err(|err| {
            Error::io(format!("failed to resolve '{}'", root.display()), err)
        })?;

        let inner = self.path.strip_prefix(&root).map_err(|_| {
            Error::Configuration(format!(
                "pidfile '{}' is outside the chroot directory '{}'",
                self.path.display(),
                root.display()
            ))
        })?;

        self.path = Path::new("/").join(inner);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The process ID most recently written to the file.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Replaces the recorded process ID.
    ///
    /// The lock belongs to the open file description, which survives `fork`,
    /// so a forked child calls this to record its own ID.
    pub fn rewrite(&mut self, pid: Pid) -> Result<()> {
        write_pid(&mut self.file, pid).map_err(|err| {
            Error::io(
                format!("failed to write pidfile '{}'", self.path.display()),
                err,
            )
        })?;

        self.pid = pid;
        Ok(())
    }

    /// Releases the lock, first removing the file if `remove` is set.
    ///
    /// The file is removed while the lock is still held so that a daemon
    /// starting concurrently never has its freshly written file deleted. A
    /// process that opened the old file before the removal finds it unlinked
    /// once it gets the lock, and [`PidFileLock::acquire`] then starts over.
    pub fn release(self, remove: bool) -> Result<()> {
        let Self { path, file, .. } = self;

        let removed = if remove {
            match fs::remove_file(&path) {
                Err(err) if err.kind() != ErrorKind::NotFound => Err(Error::io(
                    format!("failed to remove pidfile '{}'", path.display()),
                    err,
                )),
                _ => Ok(()),
            }
        } else {
            Ok(())
        };

        file.unlock().map_err(|(_, errno)| {
            Error::errno(
                format!("failed to unlock pidfile '{}'", path.display()),
                errno,
            )
        })?;

        debug!(path = %path.display(), remove, "released pidfile lock");

        removed
    }
}

impl AsRawFd for PidFileLock {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Debug for PidFileLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidFileLock")
            .field("path", &self.path)
            .field("fd", &self.as_raw_fd())
            .field("pid", &self.pid)
            .finish()
    }
}

/// Parses pidfile contents, returning `None` for anything that is not a
/// positive decimal process ID.
///
/// ```
/// use daemon_context::pidfile::parse_pid;
///
/// assert_eq!(parse_pid("1234\n").map(|pid| pid.as_raw()), Some(1234));
/// assert_eq!(parse_pid("not a pid"), None);
/// ```
pub fn parse_pid(contents: &str) -> Option<Pid> {
    contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
}

/// Reads the process ID recorded in the file at `path`.
///
/// Returns `None` if the file does not exist or does not contain a process ID.
pub fn read_pid<P: AsRef<Path>>(path: P) -> Result<Option<Pid>> {
    let path = path.as_ref();

    match fs::read_to_string(path) {
        Ok(contents) => Ok(parse_pid(&contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::io(
            format!("failed to read pidfile '{}'", path.display()),
            err,
        )),
    }
}

/// Truncates the file and writes `pid` followed by a newline.
pub fn write_pid(file: &mut File, pid: Pid) -> io::Result<()> {
    file.set_len(0)?;
    file.rewind()?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

/// Reports whether the pidfile at `path` is currently locked.
///
/// The check briefly takes a shared lock, so a daemon starting at that exact
/// moment sees the file as locked.
pub fn status<P: AsRef<Path>>(path: P) -> Result<PidFileStatus> {
    let path = path.as_ref();

    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(PidFileStatus::Missing);
        }
        Err(err) => {
            return Err(Error::io(
                format!("failed to open pidfile '{}'", path.display()),
                err,
            ));
        }
    };

    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        Ok(mut file) => {
            let pid = read_contents(&mut file)
                .ok()
                .and_then(|contents| parse_pid(&contents));
            Ok(PidFileStatus::Unlocked { pid })
        }
        Err((mut file, errno)) if errno == Errno::EWOULDBLOCK => {
            let pid = read_contents(&mut file)
                .ok()
                .and_then(|contents| parse_pid(&contents));
            Ok(PidFileStatus::Locked { pid })
        }
        Err((_, errno)) => Err(Error::errno(
            format!("failed to check pidfile '{}'", path.display()),
            errno,
        )),
    }
}

fn open(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .map_err(|err| Error::io(format!("failed to open pidfile '{}'", path.display()), err))
}

/// Locks `file` and checks that it is still the file linked at `path`.
///
/// Returns `None` if the path was removed or replaced after `file` was opened;
/// the lock on the orphaned inode is dropped.
fn lock_current(file: File, path: &Path) -> Result<Option<Flock<File>>> {
    let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(file) => file,
        Err((mut file, errno)) if errno == Errno::EWOULDBLOCK => {
            let pid = read_contents(&mut file)
                .ok()
                .and_then(|contents| parse_pid(&contents));

            return Err(Error::AlreadyRunning {
                path: path.into(),
                pid,
            });
        }
        Err((_, errno)) => {
            return Err(Error::errno(
                format!("failed to lock pidfile '{}'", path.display()),
                errno,
            ));
        }
    };

    let linked = is_linked(&file, path)
        .map_err(|err| Error::io(format!("failed to stat pidfile '{}'", path.display()), err))?;

    Ok(linked.then_some(file))
}

/// Whether `path` still names the inode open in `file`.
fn is_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;

    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn read_contents(file: &mut File) -> io::Result<String> {
    let mut contents = String::new();

    file.rewind()?;
    file.read_to_string(&mut contents)?;

    Ok(contents)
}
