use crate::{
    Error, Result,
    detach::Detach,
    pidfile::StalePolicy,
    signal::SignalMap,
    stdio::Stdio,
    user::{Identity, Privileges},
};

use nix::sys::stat::Mode;
use std::{
    collections::BTreeSet,
    os::fd::{AsRawFd, RawFd},
    path::{self, Path, PathBuf},
};

/// The umask a daemon runs with unless told otherwise.
pub const DEFAULT_UMASK: Mode = Mode::from_bits_truncate(0o027);

/// Everything a [`DaemonContext`](crate::DaemonContext) needs to know before
/// it starts.
///
/// Built with chained calls and then handed to the context, which never
/// changes it.
///
/// # Examples
///
/// ```
/// use daemon_context::{Detach, Stdio};
///
/// let config = daemon_context::options()
///     .pidfile(Some("/run/app.pid"))
///     .working_directory(Some("/var/lib/app"))
///     .stderr(Stdio::path("/var/log/app.err"))
///     .detach(Detach::Always);
///
/// assert_eq!(config.pidfile_path().unwrap().to_str(), Some("/run/app.pid"));
/// ```
#[derive(Debug)]
pub struct DaemonConfig {
    pub(crate) working_directory: PathBuf,
    pub(crate) umask: Mode,
    pub(crate) chroot: Option<PathBuf>,
    pub(crate) prevent_core: bool,
    pub(crate) preserve: BTreeSet<RawFd>,
    pub(crate) signals: SignalMap,
    pub(crate) pidfile: Option<PathBuf>,
    pub(crate) stale_pidfile: StalePolicy,
    pub(crate) remove_pidfile: bool,
    pub(crate) privileges: Option<Privileges>,
    pub(crate) detach: Detach,
    pub(crate) stdin: Stdio,
    pub(crate) stdout: Stdio,
    pub(crate) stderr: Stdio,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            working_directory: "/".into(),
            umask: DEFAULT_UMASK,
            chroot: None,
            prevent_core: true,
            preserve: BTreeSet::new(),
            signals: SignalMap::default(),
            pidfile: None,
            stale_pidfile: StalePolicy::default(),
            remove_pidfile: true,
            privileges: None,
            detach: Detach::default(),
            stdin: Stdio::Null,
            stdout: Stdio::Null,
            stderr: Stdio::Null,
        }
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the working directory, or `/` if `None`.
    ///
    /// With a chroot, the path is taken inside the new root.
    pub fn working_directory<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.working_directory = path
            .as_ref()
            .map(|path| path.as_ref())
            .unwrap_or(Path::new("/"))
            .to_path_buf();

        self
    }

    pub fn umask(mut self, mode: Mode) -> Self {
        self.umask = mode;
        self
    }

    pub fn chroot<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.chroot = path.map(|path| path.as_ref().to_path_buf());
        self
    }

    /// Disables core dumps so that a crash cannot leak process memory.
    /// Enabled by default.
    pub fn prevent_core(mut self, prevent: bool) -> Self {
        self.prevent_core = prevent;
        self
    }

    /// Keeps a descriptor open across daemonization.
    pub fn preserve_fd(mut self, fd: RawFd) -> Self {
        self.preserve.insert(fd);
        self
    }

    /// Keeps the descriptor behind `file` open across daemonization.
    ///
    /// Anything that writes to a descriptor after the daemon starts, such as
    /// a log file, must be preserved.
    pub fn preserve<F: AsRawFd>(self, file: &F) -> Self {
        self.preserve_fd(file.as_raw_fd())
    }

    pub fn signals(mut self, signals: SignalMap) -> Self {
        self.signals = signals;
        self
    }

    pub fn pidfile<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.pidfile = path.map(|path| path.as_ref().to_path_buf());
        self
    }

    pub fn stale_pidfile(mut self, policy: StalePolicy) -> Self {
        self.stale_pidfile = policy;
        self
    }

    /// Whether closing the context deletes the pidfile. Enabled by default.
    pub fn remove_pidfile(mut self, remove: bool) -> Self {
        self.remove_pidfile = remove;
        self
    }

    pub fn privileges<P: Into<Privileges>>(mut self, privileges: Option<P>) -> Self {
        self.privileges = privileges.map(Into::into);
        self
    }

    pub fn detach(mut self, detach: Detach) -> Self {
        self.detach = detach;
        self
    }

    pub fn stdin<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stdin = stdio.into();
        self
    }

    pub fn stdout<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stdout = stdio.into();
        self
    }

    pub fn stderr<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stderr = stdio.into();
        self
    }

    pub fn pidfile_path(&self) -> Option<&Path> {
        self.pidfile.as_deref()
    }

    pub fn working_directory_path(&self) -> &Path {
        &self.working_directory
    }

    pub fn preserved(&self) -> &BTreeSet<RawFd> {
        &self.preserve
    }

    pub(crate) fn streams(&self) -> [&Stdio; 3] {
        [&self.stdin, &self.stdout, &self.stderr]
    }

    /// Checks everything that can be checked without changing the process,
    /// resolving the target user and group along the way.
    pub fn validate(&self) -> Result<Option<Identity>> {
        match &self.chroot {
            Some(root) => {
                require_dir(root, "chroot directory")?;

                // Entering the root also moves to its top, so a relative
                // working directory starts there too.
                let workdir = self
                    .working_directory
                    .strip_prefix("/")
                    .unwrap_or(&self.working_directory);
                require_dir(&root.join(workdir), "working directory")?;

                if let Some(pidfile) = &self.pidfile {
                    require_inside(root, pidfile)?;
                }
            }
            None => require_dir(&self.working_directory, "working directory")?,
        }

        if let Some(pidfile) = &self.pidfile
            && let Some(parent) = pidfile.parent()
            && !parent.as_os_str().is_empty()
        {
            require_dir(parent, "pidfile directory")?;
        }

        self.privileges
            .as_ref()
            .map(Privileges::resolve)
            .transpose()
    }
}

/// The pidfile is released from inside the new root, so it must live there.
fn require_inside(root: &Path, pidfile: &Path) -> Result<()> {
    let resolve = |path: &Path| {
        path::absolute(path).map_err(|err| {
            Error::io(format!("failed to resolve '{}'", path.display()), err)
        })
    };

    if resolve(pidfile)?.starts_with(resolve(root)?) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "pidfile '{}' is outside the chroot directory '{}'",
            pidfile.display(),
            root.display()
        )))
    }
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{what} '{}' does not exist or is not a directory",
            path.display()
        )))
    }
}
