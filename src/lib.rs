//! Turn the running process into a well-behaved Unix daemon.
//!
//! A [`DaemonContext`] detaches the process from its terminal and session
//! with a double fork, closes inherited descriptors, points the standard
//! streams somewhere safe, resets the working directory, umask, and owner,
//! installs signal dispositions, and holds an exclusive lock on a pidfile
//! until it is closed.
//!
//! ```no_run
//! use daemon_context::{DaemonContext, Error};
//!
//! fn main() -> Result<(), Error> {
//!     let config = daemon_context::options()
//!         .pidfile(Some("/run/app.pid"))
//!         .privileges(Some("app:app"));
//!
//!     DaemonContext::new(config).run(|| {
//!         // Serve until SIGTERM.
//!         Ok(())
//!     })
//! }
//! ```

mod config;
mod context;
mod detach;
mod error;
pub mod pidfile;
mod process;
#[cfg(feature = "serde")]
mod serde;
pub mod signal;
mod stdio;
pub mod user;

pub use config::{DEFAULT_UMASK, DaemonConfig};
pub use context::{DaemonContext, Phase};
pub use detach::{Detach, Origin};
pub use error::{Error, FAILURE_EXIT_CODE, Result};
pub use pidfile::{PidFileLock, PidFileStatus, StalePolicy};
pub use process::{ProcessControl, System};
#[cfg(feature = "serde")]
pub use crate::serde::Settings;
pub use signal::{SignalAction, SignalMap};
pub use stdio::{Redirects, Stdio};
pub use user::{Group, Identity, Privileges, User};

pub use nix;
pub use nix::sys::stat::Mode;

pub fn options() -> DaemonConfig {
    DaemonConfig::new()
}
