use crate::{
    Error, Result,
    config::DaemonConfig,
    detach::Origin,
    pidfile::PidFileLock,
    process::{ProcessControl, System},
    stdio::{self, Redirects},
};

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    os::fd::{AsRawFd, RawFd},
    process::exit,
};
use tracing::{debug, error, info, warn};

/// Where a [`DaemonContext`] is in its life.
///
/// ```text
/// NotStarted -> Detaching -> Active -> Closing -> Closed
///                   |
///                   +-------> Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Detaching,
    Active,
    Closing,
    Closed,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::Detaching => "detaching",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        })
    }
}

/// Turns the calling process into a daemon and back.
///
/// [`open`](Self::open) runs every step exactly once, in order: validate
/// the configuration, lock the pidfile, detach, change root, disable core
/// dumps, set the umask, change owner, change directory, close inherited
/// descriptors, redirect the standard streams, install signal handlers, and
/// record the final process ID. [`close`](Self::close) releases the pidfile.
/// Dropping an open context closes it.
///
/// Errors raised before the process forks are returned to the caller.
/// After the fork the caller's terminal is gone: the error is sent to the
/// original process, which prints it and exits, and the daemon exits with
/// [`FAILURE_EXIT_CODE`](crate::FAILURE_EXIT_CODE).
///
/// # Examples
///
/// ```no_run
/// use daemon_context::{DaemonContext, Error};
///
/// fn main() -> Result<(), Error> {
///     let config = daemon_context::options().pidfile(Some("/run/app.pid"));
///
///     DaemonContext::new(config).run(|| {
///         // Serve requests...
///         Ok::<(), Error>(())
///     })
/// }
/// ```
#[derive(Debug)]
pub struct DaemonContext<P: ProcessControl = System> {
    config: DaemonConfig,
    process: P,
    phase: Phase,
    pidfile: Option<PidFileLock>,
    origin: Origin,
}

impl DaemonContext {
    pub fn new(config: DaemonConfig) -> Self {
        Self::with_process(config, System)
    }
}

impl<P: ProcessControl> DaemonContext<P> {
    pub fn with_process(config: DaemonConfig, process: P) -> Self {
        Self {
            config,
            process,
            phase: Phase::NotStarted,
            pidfile: None,
            origin: Origin::default(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Active
    }

    /// The held pidfile lock, while the context is open.
    pub fn pidfile(&self) -> Option<&PidFileLock> {
        self.pidfile.as_ref()
    }

    /// Becomes a daemon.
    ///
    /// Opening an open context does nothing. A context that has failed or
    /// closed cannot be opened again.
    pub fn open(&mut self) -> Result<()> {
        match self.phase {
            Phase::NotStarted => (),
            Phase::Active => return Ok(()),
            phase => {
                return Err(Error::InvalidPhase {
                    operation: "open",
                    phase,
                });
            }
        }

        self.transition(Phase::Detaching);

        if let Err(err) = self.enter() {
            return Err(self.fail(err));
        }

        self.transition(Phase::Active);

        if let Err(err) = self.origin.success() {
            warn!("failed to notify the original process of startup: {err}");
        }

        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        let identity = self.config.validate()?;
        let redirects = Redirects::open(
            &self.config.stdin,
            &self.config.stdout,
            &self.config.stderr,
        )?;

        if let Some(path) = &self.config.pidfile {
            self.pidfile =
                Some(PidFileLock::acquire(path, self.config.stale_pidfile)?);
        }

        if self.config.detach.is_required() {
            self.origin = self.process.detach()?;
        } else {
            debug!("skipping detachment");
        }

        if let Some(root) = &self.config.chroot {
            self.process.change_root(root)?;

            if let Some(pidfile) = &mut self.pidfile {
                pidfile.enter_root(root)?;
            }
        }

        if self.config.prevent_core {
            self.process.prevent_core_dumps()?;
        }

        self.process.set_umask(self.config.umask);

        if let Some(identity) = &identity {
            self.process.change_owner(identity)?;
        }

        self.process
            .change_directory(&self.config.working_directory)?;

        let keep = self.keep(&redirects);
        self.process.close_descriptors(&keep)?;
        self.process.redirect(redirects)?;

        let cleanup = self
            .pidfile
            .as_ref()
            .map(PidFileLock::path)
            .filter(|_| self.config.remove_pidfile);
        self.process.install_signals(&self.config.signals, cleanup)?;

        if let Some(pidfile) = &mut self.pidfile {
            pidfile.rewrite(self.process.pid())?;
        }

        Ok(())
    }

    /// Descriptors that survive [`ProcessControl::close_descriptors`].
    fn keep(&self, redirects: &Redirects) -> BTreeSet<RawFd> {
        let mut keep = self.config.preserve.clone();

        keep.extend(redirects.raw_fds());
        keep.extend(stdio::borrowed_fds(self.config.streams()));
        keep.extend(self.origin.raw_fd());
        keep.extend(self.pidfile.as_ref().map(AsRawFd::as_raw_fd));

        keep
    }

    fn fail(&mut self, err: Error) -> Error {
        self.transition(Phase::Failed);
        error!("daemonization failed: {err}");

        self.process.forget_pidfile();

        if let Some(pidfile) = self.pidfile.take()
            && let Err(err) = pidfile.release(self.config.remove_pidfile)
        {
            warn!("{err}");
        }

        if self.origin.is_detached() {
            if let Err(notify) = self.origin.notify(&err.to_string()) {
                error!("failed to notify the original process of failure: {notify}");
            }

            exit(err.exit_code());
        }

        err
    }

    /// Leaves the daemon state, releasing the pidfile.
    ///
    /// Closing a context that is not open does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.phase != Phase::Active {
            debug!(phase = %self.phase, "close ignored");
            return Ok(());
        }

        self.transition(Phase::Closing);
        self.process.forget_pidfile();

        let released = match self.pidfile.take() {
            Some(pidfile) => pidfile.release(self.config.remove_pidfile),
            None => Ok(()),
        };

        self.transition(Phase::Closed);
        released
    }

    /// Opens the context, calls `main` once, and closes the context however
    /// `main` returns.
    ///
    /// An error from `main` takes precedence over one from closing, which is
    /// logged instead.
    pub fn run<F, T, E>(&mut self, main: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<Error>,
    {
        self.open()?;

        let result = main();
        let closed = self.close();

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), closed) => {
                if let Err(close) = closed {
                    warn!("{close}");
                }

                Err(err)
            }
        }
    }

    fn transition(&mut self, phase: Phase) {
        info!(from = %self.phase, to = %phase, pid = %self.process.pid(), "daemon phase changed");
        self.phase = phase;
    }
}

impl<P: ProcessControl> Drop for DaemonContext<P> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close daemon context: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        Detach,
        pidfile::{self, PidFileStatus, StalePolicy},
        signal::SignalMap,
        stdio::Stdio,
        user::Identity,
    };

    use nix::{sys::stat::Mode, unistd::Pid};
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tempfile::{TempDir, tempdir, tempdir_in};

    const FAKE_PID: i32 = 4242;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Step {
        Detach,
        ChangeRoot,
        PreventCore,
        Umask(u32),
        ChangeOwner(String),
        ChangeDirectory,
        Close(BTreeSet<RawFd>),
        Redirect,
        Signals(Option<PathBuf>),
        ForgetPidfile,
    }

    impl Step {
        fn name(&self) -> &'static str {
            match self {
                Self::Detach => "detach",
                Self::ChangeRoot => "chroot",
                Self::PreventCore => "core",
                Self::Umask(_) => "umask",
                Self::ChangeOwner(_) => "owner",
                Self::ChangeDirectory => "chdir",
                Self::Close(_) => "close",
                Self::Redirect => "redirect",
                Self::Signals(_) => "signals",
                Self::ForgetPidfile => "forget",
            }
        }
    }

    /// Records each operation instead of performing it.
    #[derive(Debug, Default)]
    struct Recorder {
        steps: Vec<Step>,
        fail_at: Option<&'static str>,
    }

    impl Recorder {
        fn failing_at(step: &'static str) -> Self {
            Self {
                fail_at: Some(step),
                ..Default::default()
            }
        }

        fn record(&mut self, step: Step) -> Result<()> {
            let name = step.name();
            self.steps.push(step);

            match self.fail_at {
                Some(fail) if fail == name => {
                    Err(Error::Configuration(format!("{name} failed")))
                }
                _ => Ok(()),
            }
        }

        fn names(&self) -> Vec<&'static str> {
            self.steps.iter().map(Step::name).collect()
        }
    }

    impl ProcessControl for Recorder {
        fn detach(&mut self) -> Result<Origin> {
            self.record(Step::Detach).map(|()| Origin::default())
        }

        fn change_root(&mut self, _: &Path) -> Result<()> {
            self.record(Step::ChangeRoot)
        }

        fn prevent_core_dumps(&mut self) -> Result<()> {
            self.record(Step::PreventCore)
        }

        fn set_umask(&mut self, mask: Mode) {
            let _ = self.record(Step::Umask(mask.bits()));
        }

        fn change_owner(&mut self, identity: &Identity) -> Result<()> {
            self.record(Step::ChangeOwner(identity.user.name.clone()))
        }

        fn change_directory(&mut self, _: &Path) -> Result<()> {
            self.record(Step::ChangeDirectory)
        }

        fn close_descriptors(&mut self, keep: &BTreeSet<RawFd>) -> Result<()> {
            self.record(Step::Close(keep.clone()))
        }

        fn redirect(&mut self, _: Redirects) -> Result<()> {
            self.record(Step::Redirect)
        }

        fn install_signals(
            &mut self,
            _: &SignalMap,
            pidfile: Option<&Path>,
        ) -> Result<()> {
            self.record(Step::Signals(pidfile.map(Path::to_path_buf)))
        }

        fn forget_pidfile(&mut self) {
            self.steps.push(Step::ForgetPidfile);
        }

        fn pid(&self) -> Pid {
            Pid::from_raw(FAKE_PID)
        }
    }

    fn config(dir: &TempDir) -> DaemonConfig {
        DaemonConfig::new()
            .working_directory(Some(dir.path()))
            .detach(Detach::Always)
    }

    fn context(config: DaemonConfig) -> DaemonContext<Recorder> {
        DaemonContext::with_process(config, Recorder::default())
    }

    #[test]
    fn open_runs_steps_in_order() {
        let dir = tempdir().unwrap();
        let mut context = context(config(&dir).umask(Mode::from_bits_truncate(0o022)));

        context.open().unwrap();

        assert_eq!(context.phase(), Phase::Active);
        assert!(context.is_open());
        assert_eq!(
            context.process().names(),
            ["detach", "core", "umask", "chdir", "close", "redirect", "signals"]
        );
        assert!(context.process().steps.contains(&Step::Umask(0o022)));
    }

    #[test]
    fn optional_steps() {
        let dir = tempdir().unwrap();
        let config = config(&dir)
            .chroot(Some("/"))
            .privileges(Some("root"))
            .prevent_core(false);
        let mut context = context(config);

        context.open().unwrap();

        assert_eq!(
            context.process().names(),
            ["detach", "chroot", "umask", "owner", "chdir", "close", "redirect", "signals"]
        );
        assert!(
            context
                .process()
                .steps
                .contains(&Step::ChangeOwner("root".into()))
        );
    }

    #[test]
    fn no_detach_still_changes_process() {
        let dir = tempdir().unwrap();
        let mut context = context(config(&dir).detach(Detach::Never));

        context.open().unwrap();

        assert_eq!(
            context.process().names(),
            ["core", "umask", "chdir", "close", "redirect", "signals"]
        );
    }

    #[test]
    fn pidfile_holds_final_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let mut context = context(config(&dir).pidfile(Some(&path)));

        context.open().unwrap();

        assert_eq!(pidfile::read_pid(&path).unwrap(), Some(Pid::from_raw(FAKE_PID)));
        assert_eq!(context.pidfile().unwrap().pid().as_raw(), FAKE_PID);
        assert_eq!(
            pidfile::status(&path).unwrap(),
            PidFileStatus::Locked {
                pid: Some(Pid::from_raw(FAKE_PID))
            }
        );
        assert!(context.process().steps.contains(&Step::Signals(Some(path.clone()))));

        context.close().unwrap();

        assert_eq!(context.phase(), Phase::Closed);
        assert!(!path.exists());
        assert_eq!(context.process().steps.last(), Some(&Step::ForgetPidfile));
    }

    #[test]
    fn relative_pidfile_is_tracked_by_absolute_path() {
        let dir = tempdir().unwrap();
        let local = tempdir_in(".").unwrap();
        let relative = local.path().join("app.pid");
        let mut context = context(config(&dir).pidfile(Some(&relative)));

        context.open().unwrap();

        let held = context.pidfile().unwrap().path().to_path_buf();
        assert!(held.is_absolute());
        assert_eq!(
            fs::canonicalize(&held).unwrap(),
            fs::canonicalize(&relative).unwrap()
        );
        assert!(context.process().steps.contains(&Step::Signals(Some(held))));

        context.close().unwrap();

        assert!(!relative.exists());
    }

    #[test]
    fn chroot_rebases_pidfile() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("run")).unwrap();
        let path = dir.path().join("run").join("app.pid");
        let config = config(&dir)
            .working_directory(Some("/"))
            .chroot(Some(dir.path()))
            .pidfile(Some(&path));
        let mut context = context(config);

        context.open().unwrap();

        assert_eq!(context.pidfile().unwrap().path(), Path::new("/run/app.pid"));
        assert!(
            context
                .process()
                .steps
                .contains(&Step::Signals(Some("/run/app.pid".into())))
        );

        // Dropping the context would try to remove "/run/app.pid" from the
        // real root, which the recorder never left.
        context.config.remove_pidfile = false;
    }

    #[test]
    fn kept_pidfile_survives_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let mut context =
            context(config(&dir).pidfile(Some(&path)).remove_pidfile(false));

        context.open().unwrap();
        assert!(context.process().steps.contains(&Step::Signals(None)));
        context.close().unwrap();

        assert_eq!(
            pidfile::status(&path).unwrap(),
            PidFileStatus::Unlocked {
                pid: Some(Pid::from_raw(FAKE_PID))
            }
        );
    }

    #[test]
    fn keep_set_covers_owned_descriptors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let log = fs::File::create(dir.path().join("log")).unwrap();
        let mut context = context(
            config(&dir)
                .pidfile(Some(&path))
                .preserve(&log)
                .stdout(Stdio::Keep)
                .stderr(Stdio::Keep),
        );

        context.open().unwrap();

        let keep = context
            .process()
            .steps
            .iter()
            .find_map(|step| match step {
                Step::Close(keep) => Some(keep.clone()),
                _ => None,
            })
            .unwrap();
        let pidfile_fd = context.pidfile().unwrap().as_raw_fd();

        assert!(keep.contains(&log.as_raw_fd()));
        assert!(keep.contains(&pidfile_fd));
        // The pidfile, the log, and /dev/null for stdin.
        assert_eq!(keep.len(), 3);
    }

    #[test]
    fn already_running_fails_before_detaching() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let held = PidFileLock::acquire(&path, StalePolicy::Reclaim).unwrap();
        let mut context = context(config(&dir).pidfile(Some(&path)));

        let err = context.open().unwrap_err();

        assert!(matches!(err, Error::AlreadyRunning { pid, .. } if pid == Some(held.pid())));
        assert_eq!(context.phase(), Phase::Failed);
        assert!(!context.process().names().contains(&"detach"));
        assert_eq!(pidfile::read_pid(&path).unwrap(), Some(held.pid()));
    }

    #[test]
    fn configuration_error_changes_nothing() {
        let dir = tempdir().unwrap();
        let mut context = context(
            config(&dir).working_directory(Some(dir.path().join("missing"))),
        );

        let err = context.open().unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(context.phase(), Phase::Failed);
        assert_eq!(context.process().names(), ["forget"]);
    }

    #[test]
    fn missing_redirect_target_fails_before_detaching() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("missing").join("out.log");
        let mut context = context(config(&dir).stdout(Stdio::path(&log)));

        assert!(matches!(context.open(), Err(Error::Io { .. })));
        assert!(!context.process().names().contains(&"detach"));
    }

    #[test]
    fn late_failure_releases_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let mut context = DaemonContext::with_process(
            config(&dir).pidfile(Some(&path)),
            Recorder::failing_at("signals"),
        );

        assert!(context.open().is_err());
        assert_eq!(context.phase(), Phase::Failed);
        assert!(!path.exists());

        PidFileLock::acquire(&path, StalePolicy::Refuse).unwrap();
    }

    #[test]
    fn failed_context_cannot_reopen() {
        let dir = tempdir().unwrap();
        let mut context =
            DaemonContext::with_process(config(&dir), Recorder::failing_at("detach"));

        assert!(context.open().is_err());

        let err = context.open().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPhase {
                phase: Phase::Failed,
                ..
            }
        ));
    }

    #[test]
    fn open_and_close_are_idempotent() {
        let dir = tempdir().unwrap();
        let mut context = context(config(&dir));

        context.close().unwrap();
        assert_eq!(context.phase(), Phase::NotStarted);

        context.open().unwrap();
        context.open().unwrap();
        assert_eq!(context.process().names().len(), 7);

        context.close().unwrap();
        context.close().unwrap();
        assert_eq!(context.phase(), Phase::Closed);
        assert!(context.open().is_err());
    }

    #[test]
    fn drop_releases_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");

        {
            let mut context = context(config(&dir).pidfile(Some(&path)));
            context.open().unwrap();
        }

        assert!(!path.exists());
        PidFileLock::acquire(&path, StalePolicy::Refuse).unwrap();
    }

    #[test]
    fn run_closes_after_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let mut context = context(config(&dir).pidfile(Some(&path)));
        let mut calls = 0;

        let value = context
            .run(|| {
                calls += 1;
                assert!(path.exists());
                Ok::<_, Error>(7)
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls, 1);
        assert_eq!(context.phase(), Phase::Closed);
        assert!(!path.exists());
    }

    #[test]
    fn run_closes_after_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let mut context = context(config(&dir).pidfile(Some(&path)));

        let err = context
            .run(|| Err::<(), _>(Error::Configuration("application failed".into())))
            .unwrap_err();

        assert!(err.to_string().contains("application failed"));
        assert_eq!(context.phase(), Phase::Closed);
        assert!(!path.exists());
    }

    #[test]
    fn run_does_not_call_main_when_open_fails() {
        let dir = tempdir().unwrap();
        let mut context =
            DaemonContext::with_process(config(&dir), Recorder::failing_at("close"));

        let result = context.run(|| -> Result<()> { panic!("main must not run") });

        assert!(result.is_err());
        assert_eq!(context.phase(), Phase::Failed);
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::NotStarted.to_string(), "not started");
        assert_eq!(Phase::Failed.to_string(), "failed");
    }
}
