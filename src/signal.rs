//! Signal dispositions for the daemon's lifetime.

use crate::{Error, Result};

use nix::{
    libc::{self, c_int},
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{self, Pid},
};
use std::{
    collections::BTreeMap,
    ffi::CString,
    os::unix::ffi::OsStrExt,
    path::Path,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};
use tracing::debug;

/// Exit status of a daemon stopped by [`SignalAction::Terminate`].
pub const TERMINATED_EXIT_CODE: c_int = 0;

/// What happens when a signal arrives.
#[derive(Clone, Copy, Debug)]
pub enum SignalAction {
    /// The system default disposition.
    Default,
    Ignore,
    /// Remove the pidfile and exit immediately.
    ///
    /// The handler leaves from signal context with
    /// [`TERMINATED_EXIT_CODE`], so an open `DaemonContext` never observes
    /// its closing phases and none of the process's destructors run. The
    /// pidfile is removed only when the context was configured to remove
    /// it, and its lock goes away with the process.
    Terminate,
    /// A caller-supplied handler. It runs in signal context and must only
    /// perform async-signal-safe operations.
    Handler(extern "C" fn(c_int)),
}

impl SignalAction {
    fn handler(self) -> SigHandler {
        match self {
            Self::Default => SigHandler::SigDfl,
            Self::Ignore => SigHandler::SigIgn,
            Self::Terminate => SigHandler::Handler(terminate),
            Self::Handler(handler) => SigHandler::Handler(handler),
        }
    }
}

/// A mapping from signals to the actions taken on delivery.
///
/// The default map terminates on `SIGTERM` and ignores the job control
/// signals a daemon without a terminal would otherwise stop on.
#[derive(Clone, Debug)]
pub struct SignalMap(BTreeMap<Signal, SignalAction>);

impl Default for SignalMap {
    fn default() -> Self {
        Self::empty()
            .set(Signal::SIGTSTP, SignalAction::Ignore)
            .set(Signal::SIGTTIN, SignalAction::Ignore)
            .set(Signal::SIGTTOU, SignalAction::Ignore)
            .set(Signal::SIGTERM, SignalAction::Terminate)
    }
}

impl SignalMap {
    /// A map that leaves every disposition untouched.
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets the action for `signal`, replacing any earlier one.
    pub fn set(mut self, signal: Signal, action: SignalAction) -> Self {
        self.0.insert(signal, action);
        self
    }

    pub fn remove(mut self, signal: Signal) -> Self {
        self.0.remove(&signal);
        self
    }

    pub fn get(&self, signal: Signal) -> Option<SignalAction> {
        self.0.get(&signal).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Signal, SignalAction)> + '_ {
        self.0.iter().map(|(signal, action)| (*signal, *action))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Installs every mapping. Installing the same map again is harmless.
    pub fn install(&self) -> Result<()> {
        for (signal, action) in self.iter() {
            let sigaction =
                SigAction::new(action.handler(), SaFlags::SA_RESTART, SigSet::empty());

            unsafe { signal::sigaction(signal, &sigaction) }
                .map_err(|source| Error::Signal { signal, source })?;

            debug!(%signal, ?action, "installed signal disposition");
        }

        Ok(())
    }
}

struct Cleanup {
    owner: Pid,
    pidfile: Option<CString>,
}

/// State read by the terminate handler.
///
/// Replaced values are leaked rather than freed because a handler running
/// concurrently may still hold a pointer to them.
static CLEANUP: AtomicPtr<Cleanup> = AtomicPtr::new(ptr::null_mut());

/// Registers the pidfile the terminate handler removes before exiting.
///
/// Only the calling process removes the file; children that inherit the
/// handler exit without touching it.
pub(crate) fn register_cleanup(pidfile: Option<&Path>) -> Result<()> {
    let pidfile = pidfile
        .map(|path| {
            CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                Error::Configuration(format!(
                    "pidfile path '{}' contains a NUL byte",
                    path.display()
                ))
            })
        })
        .transpose()?;

    let cleanup = Box::new(Cleanup {
        owner: unistd::getpid(),
        pidfile,
    });

    CLEANUP.swap(Box::into_raw(cleanup), Ordering::SeqCst);
    Ok(())
}

/// Stops the terminate handler from touching the pidfile.
pub(crate) fn clear_cleanup() {
    CLEANUP.swap(ptr::null_mut(), Ordering::SeqCst);
}

extern "C" fn terminate(_: c_int) {
    let cleanup = CLEANUP.load(Ordering::SeqCst);

    // Only async-signal-safe calls from here on: getpid, unlink, _exit.
    if let Some(cleanup) = unsafe { cleanup.as_ref() }
        && cleanup.owner == unistd::getpid()
        && let Some(pidfile) = &cleanup.pidfile
    {
        let _ = unistd::unlink(pidfile.as_c_str());
    }

    // The flock is released when the kernel closes the descriptor.
    unsafe { libc::_exit(TERMINATED_EXIT_CODE) }
}
