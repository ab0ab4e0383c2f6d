use crate::{
    Result,
    detach::{self, Origin},
    error::Error,
    signal::{self, SignalMap},
    stdio::{self, Redirects},
    user::Identity,
};

use nix::{
    sys::{
        resource::{self, Resource},
        stat::{self, Mode},
    },
    unistd::{self, Pid},
};
use std::{collections::BTreeSet, env, os::fd::RawFd, path::Path};

/// The process-wide operations a daemon context performs, in the order it
/// performs them.
///
/// [`System`] carries them out on the running process. Other
/// implementations stand in for the operating system where forking or
/// closing descriptors is not an option, such as in unit tests.
pub trait ProcessControl {
    /// Leaves the controlling terminal and session.
    fn detach(&mut self) -> Result<Origin>;

    fn change_root(&mut self, path: &Path) -> Result<()>;

    fn prevent_core_dumps(&mut self) -> Result<()>;

    fn set_umask(&mut self, mask: Mode);

    fn change_owner(&mut self, identity: &Identity) -> Result<()>;

    fn change_directory(&mut self, path: &Path) -> Result<()>;

    /// Closes every descriptor above the standard streams not in `keep`.
    fn close_descriptors(&mut self, keep: &BTreeSet<RawFd>) -> Result<()>;

    fn redirect(&mut self, redirects: Redirects) -> Result<()>;

    /// Installs `signals`. A terminate action removes `pidfile` if given.
    fn install_signals(
        &mut self,
        signals: &SignalMap,
        pidfile: Option<&Path>,
    ) -> Result<()>;

    /// Stops a later terminate signal from removing the pidfile.
    fn forget_pidfile(&mut self);

    fn pid(&self) -> Pid;
}

/// The real operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct System;

impl ProcessControl for System {
    fn detach(&mut self) -> Result<Origin> {
        detach::double_fork()
    }

    fn change_root(&mut self, path: &Path) -> Result<()> {
        unistd::chroot(path).map_err(|err| {
            Error::errno(
                format!("failed to change root directory to '{}'", path.display()),
                err,
            )
        })?;

        env::set_current_dir("/")
            .map_err(|err| Error::io("failed to enter new root directory", err))
    }

    fn prevent_core_dumps(&mut self) -> Result<()> {
        resource::setrlimit(Resource::RLIMIT_CORE, 0, 0)
            .map_err(|err| Error::errno("failed to disable core dumps", err))
    }

    fn set_umask(&mut self, mask: Mode) {
        stat::umask(mask);
    }

    fn change_owner(&mut self, identity: &Identity) -> Result<()> {
        identity.assume()
    }

    // Runs after the owner changes so that the daemon user's access to the
    // directory is what counts.
    fn change_directory(&mut self, path: &Path) -> Result<()> {
        env::set_current_dir(path).map_err(|err| {
            Error::io(
                format!(
                    "failed to change working directory to '{}'",
                    path.display()
                ),
                err,
            )
        })
    }

    fn close_descriptors(&mut self, keep: &BTreeSet<RawFd>) -> Result<()> {
        stdio::close_all_except(keep).map(|_| ())
    }

    fn redirect(&mut self, redirects: Redirects) -> Result<()> {
        redirects.apply()
    }

    fn install_signals(
        &mut self,
        signals: &SignalMap,
        pidfile: Option<&Path>,
    ) -> Result<()> {
        signal::register_cleanup(pidfile)?;
        signals.install()
    }

    fn forget_pidfile(&mut self) {
        signal::clear_cleanup();
    }

    fn pid(&self) -> Pid {
        unistd::getpid()
    }
}
