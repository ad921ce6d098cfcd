use core::fmt;

use crate::error::{host_err, Result};

/// OpenCL revision reported by a platform, device or context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClVersion {
    pub major: u8,
    pub minor: u8,
}

impl ClVersion {
    pub const V1_0: ClVersion = ClVersion::new(1, 0);
    pub const V1_1: ClVersion = ClVersion::new(1, 1);
    pub const V1_2: ClVersion = ClVersion::new(1, 2);
    pub const V2_0: ClVersion = ClVersion::new(2, 0);
    pub const V2_1: ClVersion = ClVersion::new(2, 1);

    pub const fn new(major: u8, minor: u8) -> Self {
        ClVersion { major, minor }
    }

    /// Parses strings of the form `OpenCL <major>.<minor> <vendor-specific>`.
    pub fn parse(text: &str) -> Result<Self> {
        let bad = || host_err!(InvalidData, "malformed OpenCL version string '{}'", text);
        let rest = text.trim().strip_prefix("OpenCL").ok_or_else(bad)?.trim_start();
        let number = rest.split_whitespace().next().ok_or_else(bad)?;
        let (major, minor) = number.split_once('.').ok_or_else(bad)?;
        let digits = |s: &str| -> Option<u8> {
            let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
            s[..end].parse().ok()
        };
        match (digits(major), digits(minor)) {
            (Some(major), Some(minor)) => Ok(ClVersion { major, minor }),
            _ => Err(bad()),
        }
    }

    /// Version as an integer, e.g. 120 for 1.2.
    pub fn as_number(self) -> u32 {
        self.major as u32 * 100 + self.minor as u32 * 10
    }

    /// Fails with `UnsupportedRuntimeVersion` when `self` is older than
    /// `needed`.
    pub(crate) fn require(self, needed: ClVersion, what: &str) -> Result<()> {
        if self >= needed {
            Ok(())
        } else {
            Err(host_err!(
                UnsupportedRuntimeVersion,
                "{} requires OpenCL {}, but the platform only supports {}",
                what,
                needed,
                self
            ))
        }
    }
}

impl fmt::Display for ClVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
