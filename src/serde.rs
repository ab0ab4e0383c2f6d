//! Deserializable daemon settings, for configuration files.

use crate::{
    DaemonConfig, Detach, Error, Result, Stdio,
    pidfile::StalePolicy,
    user::{Group, Privileges, User},
};

use nix::sys::stat::Mode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;

impl<'de> Deserialize<'de> for User {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.as_str().into())
    }
}

impl Serialize for User {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Uid(uid) => serializer.serialize_str(&uid.to_string()),
            Self::Name(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Group {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.as_str().into())
    }
}

impl Serialize for Group {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Gid(gid) => serializer.serialize_str(&gid.to_string()),
            Self::Name(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Privileges {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.as_str().into())
    }
}

impl Serialize for Privileges {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let user = match &self.user {
            User::Uid(uid) => uid.to_string(),
            User::Name(name) => name.clone(),
        };

        match &self.group {
            None => serializer.serialize_str(&user),
            Some(Group::Gid(gid)) => serializer.serialize_str(&format!("{user}:{gid}")),
            Some(Group::Name(group)) => {
                serializer.serialize_str(&format!("{user}:{group}"))
            }
        }
    }
}

/// Daemon settings as they appear in a configuration file.
///
/// Missing fields keep the [`DaemonConfig`] defaults. The umask is an octal
/// string such as `"027"`. Signal dispositions and preserved descriptors
/// only exist at run time and are set on the resulting config.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    pub working_directory: Option<PathBuf>,
    pub umask: Option<String>,
    pub chroot: Option<PathBuf>,
    pub prevent_core: Option<bool>,
    pub pidfile: Option<PathBuf>,
    pub stale_pidfile: StalePolicy,
    pub remove_pidfile: Option<bool>,
    pub user: Option<Privileges>,
    pub detach: Detach,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl Settings {
    pub fn into_config(self) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::new()
            .working_directory(self.working_directory)
            .chroot(self.chroot)
            .pidfile(self.pidfile)
            .stale_pidfile(self.stale_pidfile)
            .privileges(self.user)
            .detach(self.detach);

        if let Some(umask) = self.umask {
            config = config.umask(parse_umask(&umask)?);
        }

        if let Some(prevent) = self.prevent_core {
            config = config.prevent_core(prevent);
        }

        if let Some(remove) = self.remove_pidfile {
            config = config.remove_pidfile(remove);
        }

        if let Some(stdout) = self.stdout {
            config = config.stdout(Stdio::Path(stdout));
        }

        if let Some(stderr) = self.stderr {
            config = config.stderr(Stdio::Path(stderr));
        }

        Ok(config)
    }
}

impl TryFrom<Settings> for DaemonConfig {
    type Error = Error;

    fn try_from(settings: Settings) -> Result<Self> {
        settings.into_config()
    }
}

fn parse_umask(value: &str) -> Result<Mode> {
    let digits = value.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);

    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|bits| *bits <= 0o777)
        .and_then(|bits| Mode::from_bits(bits as _))
        .ok_or_else(|| Error::Configuration(format!("invalid umask '{value}'")))
}
