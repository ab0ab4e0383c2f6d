//! Standard stream redirection and descriptor cleanup.

use crate::{Error, Result};

use nix::{
    errno::Errno,
    fcntl::{self, OFlag},
    sys::{
        resource::{self, RLIM_INFINITY, Resource},
        stat::Mode,
    },
    unistd::{self, dup2_stderr, dup2_stdin, dup2_stdout},
};
use std::{
    collections::BTreeSet,
    fs::{self, File},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
};
use tracing::debug;

const DEV_NULL: &str = "/dev/null";

/// Upper bound on descriptor numbers when the limit is unbounded.
const FALLBACK_MAX_FD: RawFd = 2048;

/// Where a standard stream points once the daemon is running.
#[derive(Debug, Default)]
pub enum Stdio {
    /// The null device.
    #[default]
    Null,
    /// The stream inherited from the invoking process.
    Keep,
    /// A file opened for appending, created if missing.
    Path(PathBuf),
    /// An already open file.
    File(File),
}

impl Stdio {
    pub fn path<P: Into<PathBuf>>(path: P) -> Self {
        Self::Path(path.into())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Self::File(file) => Some(file.as_raw_fd()),
            _ => None,
        }
    }
}

impl From<File> for Stdio {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

#[derive(Clone, Copy, Debug)]
enum Stream {
    Input,
    Output,
    Error,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Self::Input => "stdin",
            Self::Output => "stdout",
            Self::Error => "stderr",
        }
    }

    fn flags(self) -> OFlag {
        match self {
            Self::Input => OFlag::O_RDONLY,
            Self::Output | Self::Error => {
                OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_CREAT
            }
        }
    }

    fn dup2(self, fd: &OwnedFd) -> nix::Result<()> {
        match self {
            Self::Input => dup2_stdin(fd),
            Self::Output => dup2_stdout(fd),
            Self::Error => dup2_stderr(fd),
        }
    }
}

/// Replacement descriptors for the standard streams.
///
/// Targets are opened while the process still has its terminal, so a missing
/// log file is reported to the user instead of killing a detached daemon.
#[derive(Debug, Default)]
pub struct Redirects {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl Redirects {
    pub fn open(stdin: &Stdio, stdout: &Stdio, stderr: &Stdio) -> Result<Self> {
        Ok(Self {
            stdin: open(stdin, Stream::Input)?,
            stdout: open(stdout, Stream::Output)?,
            stderr: open(stderr, Stream::Error)?,
        })
    }

    /// Descriptors that must survive [`close_all_except`].
    pub fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .flatten()
            .map(AsRawFd::as_raw_fd)
    }

    /// Points the standard streams at the opened targets.
    pub fn apply(self) -> Result<()> {
        let streams = [
            (Stream::Input, self.stdin),
            (Stream::Output, self.stdout),
            (Stream::Error, self.stderr),
        ];

        for (stream, fd) in streams {
            if let Some(fd) = fd {
                stream.dup2(&fd).map_err(|err| {
                    Error::errno(format!("failed to redirect {}", stream.name()), err)
                })?;
            }
        }

        Ok(())
    }
}

fn open(stdio: &Stdio, stream: Stream) -> Result<Option<OwnedFd>> {
    let fd = match stdio {
        Stdio::Keep => return Ok(None),
        Stdio::Null => open_path(Path::new(DEV_NULL), stream)?,
        Stdio::Path(path) => open_path(path, stream)?,
        Stdio::File(file) => file.try_clone().map(OwnedFd::from).map_err(|err| {
            Error::io(format!("failed to duplicate {} file", stream.name()), err)
        })?,
    };

    Ok(Some(fd))
}

fn open_path(path: &Path, stream: Stream) -> Result<OwnedFd> {
    fcntl::open(
        path,
        stream.flags() | OFlag::O_CLOEXEC,
        Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP,
    )
    .map_err(|err| {
        Error::errno(
            format!(
                "failed to open '{}' for {}",
                path.display(),
                stream.name()
            ),
            err,
        )
    })
}

/// Descriptors backing `File` stdio targets, which the caller still owns.
pub(crate) fn borrowed_fds<'a>(
    streams: impl IntoIterator<Item = &'a Stdio>,
) -> impl Iterator<Item = RawFd> {
    streams.into_iter().filter_map(Stdio::raw_fd)
}

/// Closes every descriptor above the standard streams that is not in `keep`.
///
/// Descriptors that turn out to be closed already are skipped. Returns the
/// number of descriptors closed.
pub fn close_all_except(keep: &BTreeSet<RawFd>) -> Result<usize> {
    let candidates = open_descriptors()?;
    let mut closed = 0;

    for fd in closable(candidates, keep) {
        if close(fd) {
            closed += 1;
        }
    }

    debug!(closed, kept = ?keep, "closed inherited file descriptors");

    Ok(closed)
}

fn closable(
    candidates: impl IntoIterator<Item = RawFd>,
    keep: &BTreeSet<RawFd>,
) -> Vec<RawFd> {
    candidates
        .into_iter()
        .filter(|fd| *fd > 2 && !keep.contains(fd))
        .collect()
}

/// Closes `fd`, returning whether it was open.
fn close(fd: RawFd) -> bool {
    match unistd::close(fd) {
        Ok(()) => true,
        Err(Errno::EBADF) => false,
        Err(err) => {
            // The descriptor is released even when close reports an error.
            debug!(fd, %err, "error while closing descriptor");
            true
        }
    }
}

/// Lists the process's descriptors, falling back to every number below the
/// descriptor limit where `/proc` is unavailable.
fn open_descriptors() -> Result<Vec<RawFd>> {
    if let Ok(entries) = fs::read_dir("/proc/self/fd") {
        // The listing includes the directory handle itself, which is gone by
        // the time it is closed.
        return Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect());
    }

    Ok((0..max_fd()?).collect())
}

fn max_fd() -> Result<RawFd> {
    let (soft, _) = resource::getrlimit(Resource::RLIMIT_NOFILE).map_err(|err| {
        Error::ResourceExhaustion {
            call: "getrlimit",
            source: err,
        }
    })?;

    if soft == RLIM_INFINITY {
        return Ok(FALLBACK_MAX_FD);
    }

    Ok(RawFd::try_from(soft).unwrap_or(RawFd::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::fd::IntoRawFd;
    use tempfile::tempdir;

    #[test]
    fn closable_skips_standard_streams_and_kept() {
        let keep = BTreeSet::from([4, 9]);

        assert_eq!(closable([0, 1, 2, 3, 4, 5, 9, 12], &keep), vec![3, 5, 12]);
    }

    #[test]
    fn closing_invalid_descriptor_is_tolerated() {
        assert!(!close(RawFd::MAX - 1));
    }

    #[test]
    fn close_reports_open_descriptor() {
        let dir = tempdir().unwrap();
        let fd = File::create(dir.path().join("scratch")).unwrap().into_raw_fd();

        assert!(close(fd));
    }

    #[test]
    fn open_descriptors_lists_new_file() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("scratch")).unwrap();

        assert!(open_descriptors().unwrap().contains(&file.as_raw_fd()));
    }

    #[test]
    fn redirect_targets_open_before_use() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("daemon.log");

        let redirects =
            Redirects::open(&Stdio::Null, &Stdio::path(&log), &Stdio::Keep)
                .unwrap();

        assert!(log.exists());
        assert!(redirects.stdin.is_some());
        assert!(redirects.stderr.is_none());
        assert_eq!(redirects.raw_fds().count(), 2);
    }

    #[test]
    fn missing_redirect_target_fails() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("missing").join("daemon.log");

        let err = Redirects::open(&Stdio::Null, &Stdio::path(&log), &Stdio::Null)
            .unwrap_err();

        assert!(err.to_string().contains("stdout"));
    }

    #[test]
    fn file_targets_are_duplicated() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("out")).unwrap();
        let raw = file.as_raw_fd();
        let stdout = Stdio::from(file);

        let redirects = Redirects::open(&Stdio::Keep, &stdout, &Stdio::Keep).unwrap();

        let fds: Vec<_> = redirects.raw_fds().collect();
        assert_eq!(fds.len(), 1);
        assert_ne!(fds[0], raw);
        assert_eq!(borrowed_fds([&stdout]).collect::<Vec<_>>(), vec![raw]);
    }
}
