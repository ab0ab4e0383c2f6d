//! Users, groups, and the identity a daemon runs as.

use crate::{Error, Result};

use nix::{
    libc::{gid_t, uid_t},
    unistd::{self, Gid, Uid},
};
use std::{
    convert::Infallible,
    env,
    ffi::CString,
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use tracing::debug;

/// A user given either by ID or by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum User {
    Uid(Uid),
    Name(String),
}

impl User {
    /// Looks the user up in the password database.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemon_context::User;
    ///
    /// let user = User::Uid(0.into()).get().unwrap();
    /// assert_eq!(user.name, "root");
    /// ```
    pub fn get(&self) -> Result<unistd::User> {
        match self {
            Self::Uid(uid) => unistd::User::from_uid(*uid),
            Self::Name(name) => unistd::User::from_name(name),
        }
        .map_err(|err| Error::Configuration(format!("{self}: {err}")))?
        .ok_or_else(|| Error::Configuration(format!("{self} does not exist")))
    }
}

impl Display for User {
    /// ```
    /// use daemon_context::User;
    ///
    /// assert_eq!(User::from(0).to_string(), "user with ID (0)");
    /// assert_eq!(User::from("root").to_string(), "user 'root'");
    /// ```
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uid(uid) => write!(f, "user with ID ({uid})"),
            Self::Name(name) => write!(f, "user '{name}'"),
        }
    }
}

impl FromStr for User {
    type Err = Infallible;

    /// Numeric strings become [`Self::Uid`]; anything else is a name.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<uid_t>() {
            Ok(uid) => Self::Uid(uid.into()),
            Err(_) => Self::Name(s.into()),
        })
    }
}

impl From<&str> for User {
    fn from(value: &str) -> Self {
        let Ok(user) = value.parse::<Self>();
        user
    }
}

impl From<Uid> for User {
    fn from(value: Uid) -> Self {
        Self::Uid(value)
    }
}

impl From<uid_t> for User {
    fn from(value: uid_t) -> Self {
        Self::Uid(value.into())
    }
}

/// A group given either by ID or by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Group {
    Gid(Gid),
    Name(String),
}

impl Group {
    /// Looks the group up in the group database.
    pub fn get(&self) -> Result<unistd::Group> {
        match self {
            Self::Gid(gid) => unistd::Group::from_gid(*gid),
            Self::Name(name) => unistd::Group::from_name(name),
        }
        .map_err(|err| Error::Configuration(format!("{self}: {err}")))?
        .ok_or_else(|| Error::Configuration(format!("{self} does not exist")))
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gid(gid) => write!(f, "group with ID ({gid})"),
            Self::Name(name) => write!(f, "group '{name}'"),
        }
    }
}

impl FromStr for Group {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<gid_t>() {
            Ok(gid) => Self::Gid(gid.into()),
            Err(_) => Self::Name(s.into()),
        })
    }
}

impl From<&str> for Group {
    fn from(value: &str) -> Self {
        let Ok(group) = value.parse::<Self>();
        group
    }
}

impl From<Gid> for Group {
    fn from(value: Gid) -> Self {
        Self::Gid(value)
    }
}

impl From<gid_t> for Group {
    fn from(value: gid_t) -> Self {
        Self::Gid(value.into())
    }
}

/// The user and optional group the daemon should run as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Privileges {
    pub user: User,
    pub group: Option<Group>,
}

impl Privileges {
    /// Resolves the user and group into concrete database entries.
    ///
    /// Without an explicit group, the user's primary group is used.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemon_context::Privileges;
    ///
    /// let identity = Privileges::from("root").resolve().unwrap();
    /// assert!(identity.user.uid.is_root());
    /// assert_eq!(identity.group.gid.as_raw(), 0);
    /// ```
    pub fn resolve(&self) -> Result<Identity> {
        let user = self.user.get()?;

        let group = match &self.group {
            Some(group) => group.get()?,
            None => Group::Gid(user.gid).get()?,
        };

        Ok(Identity { user, group })
    }
}

impl Display for Privileges {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{} and {group}", self.user),
            None => write!(f, "{}", self.user),
        }
    }
}

impl FromStr for Privileges {
    type Err = Infallible;

    /// Parses `user` or `user:group`, where each part is a name or an ID.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (user, group) = match s.trim().split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (s.trim(), None),
        };

        Ok(Self {
            user: user.into(),
            group: group.map(Group::from),
        })
    }
}

impl From<&str> for Privileges {
    fn from(value: &str) -> Self {
        let Ok(privileges) = value.parse::<Self>();
        privileges
    }
}

impl From<User> for Privileges {
    fn from(user: User) -> Self {
        Self { user, group: None }
    }
}

impl From<uid_t> for Privileges {
    fn from(value: uid_t) -> Self {
        User::from(value).into()
    }
}

impl<U, G> From<(U, G)> for Privileges
where
    U: Into<User>,
    G: Into<Group>,
{
    fn from((user, group): (U, G)) -> Self {
        Self {
            user: user.into(),
            group: Some(group.into()),
        }
    }
}

/// A resolved user and group, ready to be assumed by the process.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user: unistd::User,
    pub group: unistd::Group,
}

impl Identity {
    /// Switches the calling process to this identity.
    ///
    /// Sets the supplementary group list, then the group ID, then the user
    /// ID, and finally the `USER`, `HOME`, and `SHELL` environment variables.
    /// Once the user ID changes there is no way back.
    pub fn assume(&self) -> Result<()> {
        let name = CString::new(self.user.name.as_str()).map_err(|_| {
            Error::Privileges(format!(
                "user name '{}' contains a NUL byte",
                self.user.name
            ))
        })?;

        unistd::initgroups(&name, self.group.gid).map_err(|err| {
            Error::Privileges(format!(
                "failed to set supplementary group list for user '{}': {err}",
                self.user.name
            ))
        })?;

        unistd::setgid(self.group.gid).map_err(|err| {
            Error::Privileges(format!(
                "failed to set group to '{}': {err}",
                self.group.name
            ))
        })?;

        unistd::setuid(self.user.uid).map_err(|err| {
            Error::Privileges(format!(
                "failed to set user to '{}': {err}",
                self.user.name
            ))
        })?;

        // The process is single threaded at this point.
        unsafe {
            env::set_var("USER", &self.user.name);
            env::set_var("HOME", &self.user.dir);
            env::set_var("SHELL", &self.user.shell);
        }

        debug!(user = %self.user.name, group = %self.group.name, "changed process owner");

        Ok(())
    }
}
