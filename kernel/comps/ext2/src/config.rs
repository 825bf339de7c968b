// SPDX-License-Identifier: MPL-2.0

//! Mount-time configuration.

use core::str::FromStr;

use crate::prelude::*;

/// The options of an ext2 mount.
///
/// The options are parsed from the comma-separated string given to `mount`,
/// e.g. `"ro,check=strict"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Refuses every modification with `EROFS`.
    pub read_only: bool,
    /// How the free counts are verified at mount.
    pub check: CheckMode,
    /// Which operation contexts are used.
    pub ctx: CtxPolicy,
    /// Flushes the device's write cache after every operation.
    pub sync: bool,
}

/// How the free block and inode counts are verified at mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// No verification.
    None,
    /// Mismatches are logged and the sums of the group counts are adopted.
    Normal,
    /// Mismatches fail the mount.
    Strict,
}

/// The policy of acquiring operation contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxPolicy {
    /// Try the persistent context of the mount first.
    Shared,
    /// Always allocate a throwaway context.
    Transient,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            check: CheckMode::Normal,
            ctx: CtxPolicy::Shared,
            sync: false,
        }
    }
}

impl MountOptions {
    /// Parses the options from a comma-separated string.
    pub fn parse(args: &str) -> Result<Self> {
        let mut options = Self::default();
        for entry in args.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = entry.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some("ro"), None) => options.read_only = true,
                (Some("rw"), None) => options.read_only = false,
                (Some("sync"), None) => options.sync = true,
                (Some("check"), Some(mode)) => {
                    options.check = match mode {
                        "none" => CheckMode::None,
                        "normal" => CheckMode::Normal,
                        "strict" => CheckMode::Strict,
                        _ => return_errno_with_message!(Errno::EINVAL, "invalid check mode"),
                    }
                }
                (Some("ctx"), Some(policy)) => {
                    options.ctx = match policy {
                        "shared" => CtxPolicy::Shared,
                        "transient" => CtxPolicy::Transient,
                        _ => return_errno_with_message!(Errno::EINVAL, "invalid context policy"),
                    }
                }
                _ => {
                    warn!("[ext2] unknown mount option: {}", entry);
                    return_errno_with_message!(Errno::EINVAL, "unknown mount option");
                }
            }
        }
        Ok(options)
    }
}

impl FromStr for MountOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// The source of the timestamps stored in inodes.
pub trait Clock: Send + Sync + Debug {
    /// Returns the time elapsed since the Unix epoch.
    fn now(&self) -> Duration;
}

/// A clock stuck at the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct EpochClock;

impl Clock for EpochClock {
    fn now(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_options() -> Result<()> {
        assert_eq!(MountOptions::parse("")?, MountOptions::default());

        let options: MountOptions = "ro, check=strict,ctx=transient,sync".parse()?;
        assert!(options.read_only);
        assert_eq!(options.check, CheckMode::Strict);
        assert_eq!(options.ctx, CtxPolicy::Transient);
        assert!(options.sync);

        assert!(!MountOptions::parse("ro,rw")?.read_only);
        Ok(())
    }

    #[test]
    fn reject_bad_options() {
        for args in ["noatime", "check=maybe", "ctx", "ro=1"] {
            let err = MountOptions::parse(args).unwrap_err();
            assert_eq!(err.error(), Errno::EINVAL, "{}", args);
        }
    }
}
