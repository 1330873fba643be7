//! Kubernetes version detection and selection
//!
//! A bundle records the exact server version it was captured from, but the
//! control plane only needs to match the minor version family. The nearest
//! published patch release is good enough to serve the captured objects.

use std::fmt;
use std::str::FromStr;

use kubelive_common::Bundle;
use semver::Version;
use tracing::info;

use crate::error::{Error, Result};

/// Selects a compatible control plane release
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VersionSpec {
    /// Any stable patch release of `major.minor` (highest wins)
    Minor {
        /// Major version
        major: u64,
        /// Minor version
        minor: u64,
    },
    /// Exactly this release
    Exact(Version),
}

impl VersionSpec {
    /// Minor-family selector for a raw server version such as `v1.27.3-eks-4f4795d`
    pub fn from_server_version(raw: &str) -> std::result::Result<Self, String> {
        let (major, minor, _) = parse_core(raw)?;
        Ok(VersionSpec::Minor { major, minor })
    }

    /// Whether a published release satisfies this selector
    ///
    /// Pre-releases only ever match an exact selector naming them.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Minor { major, minor } => {
                version.major == *major && version.minor == *minor && version.pre.is_empty()
            }
            VersionSpec::Exact(exact) => {
                version.major == exact.major
                    && version.minor == exact.minor
                    && version.patch == exact.patch
                    && version.pre == exact.pre
            }
        }
    }

    /// Highest version among `candidates` satisfying this selector
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates.into_iter().filter(|v| self.matches(v)).max()
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Minor { major, minor } => write!(f, "{}.{}.x", major, minor),
            VersionSpec::Exact(version) => write!(f, "{}", version),
        }
    }
}

impl FromStr for VersionSpec {
    type Err = String;

    /// Parses `1.27`, `1.27.x`, `v1.27.3` or `1.27.3-rc.0`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        if let Some(family) = trimmed.strip_suffix(".x") {
            let (major, minor, patch) = parse_core(family)?;
            if patch.is_some() {
                return Err(format!("invalid version selector '{}'", s));
            }
            return Ok(VersionSpec::Minor { major, minor });
        }

        match parse_core(trimmed)? {
            (major, minor, None) => Ok(VersionSpec::Minor { major, minor }),
            (_, _, Some(_)) => Version::parse(trimmed)
                .map(VersionSpec::Exact)
                .map_err(|e| format!("invalid version '{}': {}", s, e)),
        }
    }
}

/// Extract `(major, minor, patch)` from a Kubernetes version string
///
/// Accepts an optional `v` prefix and ignores anything after the first `-`
/// or `+` (distribution suffixes such as `-eks-…`, `-gke.100`, `+k3s1`).
fn parse_core(raw: &str) -> std::result::Result<(u64, u64, Option<u64>), String> {
    let trimmed = raw.trim();
    let without_prefix = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let core = without_prefix
        .split(['-', '+'])
        .next()
        .unwrap_or(without_prefix);

    let mut parts = core.split('.');
    let number = |part: Option<&str>, name: &str| -> std::result::Result<u64, String> {
        part.filter(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| format!("missing {} version in '{}'", name, raw))?
            .parse::<u64>()
            .map_err(|e| format!("invalid {} version in '{}': {}", name, raw, e))
    };

    let major = number(parts.next(), "major")?;
    let minor = number(parts.next(), "minor")?;
    let patch = match parts.next() {
        Some(p) => Some(number(Some(p), "patch")?),
        None => None,
    };
    if parts.next().is_some() {
        return Err(format!("too many version components in '{}'", raw));
    }
    Ok((major, minor, patch))
}

/// Determine the control plane version family a bundle requires
///
/// Pure and deterministic for a given bundle; emits one diagnostic record.
pub fn resolve(bundle: &dyn Bundle) -> Result<VersionSpec> {
    let raw = bundle
        .detect_version()
        .map_err(|e| Error::VersionDetection {
            bundle: bundle.id().to_string(),
            message: e.to_string(),
        })?;

    let spec = VersionSpec::from_server_version(&raw).map_err(|message| {
        Error::VersionDetection {
            bundle: bundle.id().to_string(),
            message,
        }
    })?;

    info!(
        bundle = %bundle.id(),
        detected = %raw,
        spec = %spec,
        "Detected Kubernetes version"
    );
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelive_common::MemoryBundle;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_from_server_version_variants() {
        let expected = VersionSpec::Minor {
            major: 1,
            minor: 27,
        };
        for raw in [
            "v1.27.3",
            "1.27.3",
            "v1.27.3-eks-4f4795d",
            "v1.27.3+k3s1",
            "v1.27.3-gke.100",
            "v1.27",
        ] {
            assert_eq!(
                VersionSpec::from_server_version(raw).unwrap(),
                expected,
                "{}",
                raw
            );
        }
    }

    #[test]
    fn test_from_server_version_rejects_garbage() {
        for raw in ["", "v", "latest", "1", "1.x", "v1.27.3.4", "1..2"] {
            assert!(
                VersionSpec::from_server_version(raw).is_err(),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            VersionSpec::Minor {
                major: 1,
                minor: 27
            }
            .to_string(),
            "1.27.x"
        );
        assert_eq!(VersionSpec::Exact(v("1.28.0")).to_string(), "1.28.0");
    }

    #[test]
    fn test_parse_selectors() {
        assert_eq!(
            "1.27.x".parse::<VersionSpec>().unwrap(),
            VersionSpec::Minor {
                major: 1,
                minor: 27
            }
        );
        assert_eq!(
            "1.27".parse::<VersionSpec>().unwrap(),
            VersionSpec::Minor {
                major: 1,
                minor: 27
            }
        );
        assert_eq!(
            "v1.27.1".parse::<VersionSpec>().unwrap(),
            VersionSpec::Exact(v("1.27.1"))
        );
        assert!("1.27.1.x".parse::<VersionSpec>().is_err());
        assert!("banana".parse::<VersionSpec>().is_err());
    }

    #[test]
    fn test_minor_matches_only_stable_patches() {
        let spec = VersionSpec::Minor {
            major: 1,
            minor: 27,
        };
        assert!(spec.matches(&v("1.27.0")));
        assert!(spec.matches(&v("1.27.9")));
        assert!(!spec.matches(&v("1.27.10-rc.0")));
        assert!(!spec.matches(&v("1.28.0")));
        assert!(!spec.matches(&v("2.27.0")));
    }

    #[test]
    fn test_best_match_picks_highest_patch() {
        let candidates = vec![v("1.26.5"), v("1.27.1"), v("1.27.10"), v("1.27.3"), v("1.28.0")];
        let spec = VersionSpec::Minor {
            major: 1,
            minor: 27,
        };
        assert_eq!(spec.best_match(&candidates), Some(&v("1.27.10")));

        let exact = VersionSpec::Exact(v("1.27.3"));
        assert_eq!(exact.best_match(&candidates), Some(&v("1.27.3")));

        let missing = VersionSpec::Minor {
            major: 1,
            minor: 30,
        };
        assert_eq!(missing.best_match(&candidates), None);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let bundle = MemoryBundle::new("support-bundle-2024").with_version("v1.27.3");
        let first = resolve(&bundle).unwrap();
        let second = resolve(&bundle).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), "1.27.x");
    }

    #[test]
    fn test_resolve_missing_version() {
        let bundle = MemoryBundle::new("no-version");
        match resolve(&bundle) {
            Err(Error::VersionDetection { bundle, .. }) => assert_eq!(bundle, "no-version"),
            other => panic!("expected VersionDetection, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_unparseable_version() {
        let bundle = MemoryBundle::new("weird").with_version("unknown");
        assert!(matches!(
            resolve(&bundle),
            Err(Error::VersionDetection { .. })
        ));
    }
}
