//! Target platform for control plane binaries
//!
//! Release archives use Go naming (`linux`/`darwin`, `amd64`/`arm64`), so the
//! Rust target constants are translated once at startup.

use std::fmt;

use crate::error::{Error, Result};

/// Operating system and architecture pair
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Platform {
    /// Operating system (e.g. "linux")
    pub os: String,
    /// CPU architecture (e.g. "amd64")
    pub arch: String,
}

impl Platform {
    /// Explicit platform, e.g. when provisioning for another machine
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Platform of the running process
    pub fn current() -> Result<Self> {
        Self::from_rust_target(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Translate Rust target names to release naming
    pub fn from_rust_target(os: &str, arch: &str) -> Result<Self> {
        let os = match os {
            "linux" => "linux",
            "macos" => "darwin",
            "windows" => "windows",
            other => {
                return Err(Error::configuration(format!(
                    "unsupported operating system: {}",
                    other
                )))
            }
        };
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "powerpc64" => "ppc64le",
            "s390x" => "s390x",
            other => {
                return Err(Error::configuration(format!(
                    "unsupported architecture: {}",
                    other
                )))
            }
        };
        Ok(Self::new(os, arch))
    }

    /// Whether both components are set
    pub fn is_complete(&self) -> bool {
        !self.os.trim().is_empty() && !self.arch.trim().is_empty()
    }

    /// Suffix used in archive and cache entry names (`linux-amd64`)
    pub fn suffix(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}
