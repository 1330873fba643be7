//! Local cache of control plane binary sets
//!
//! Entries live under `<root>/k8s/<version>-<os>-<arch>/`. An entry is either
//! absent or complete: archives are unpacked into a hidden staging directory
//! next to the entries and only renamed into place after validation, so a
//! crash mid-write leaves nothing that [`AssetStore::lookup`] will return.
//!
//! Writers serialize on an advisory lock (`<root>/.lock`) so that several
//! processes can share one cache root. Readers never lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use fs2::FileExt;
use rand::Rng;
use semver::Version;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::version::VersionSpec;

/// Binaries a control plane cannot start without
pub const REQUIRED_BINARIES: &[&str] = &["kube-apiserver", "etcd"];

/// Binaries extracted when present but not required
pub const OPTIONAL_BINARIES: &[&str] = &["kubectl"];

const ENTRIES_DIR: &str = "k8s";
const LOCK_FILE: &str = ".lock";
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// An installed binary set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Release version
    pub version: Version,
    /// Platform the binaries are built for
    pub platform: Platform,
    /// Directory containing the binaries
    pub path: PathBuf,
}

/// What [`AssetStore::store`] does when a valid entry already exists
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistingEntry {
    /// Keep the installed entry and discard the new archive
    Keep,
    /// Replace the installed entry with the new archive
    Replace,
}

/// Content-addressed store of binary sets keyed by version and platform
#[derive(Clone, Debug)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    /// Store rooted at `root` (created lazily)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join(ENTRIES_DIR)
    }

    /// Create the cache directories; idempotent
    pub fn ensure_base_dirs(&self) -> Result<()> {
        let dir = self.entries_dir();
        fs::create_dir_all(&dir).map_err(|e| Error::asset_write(dir, e))
    }

    /// Directory an entry for `version` and `platform` lives in
    pub fn entry_path(&self, version: &Version, platform: &Platform) -> PathBuf {
        self.entries_dir().join(entry_name(version, platform))
    }

    /// All installed entries (valid or not), ordered by version
    ///
    /// Staging and retired directories are never listed.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let dir = self.entries_dir();
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::asset_write(dir, e)),
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.map_err(|e| Error::asset_write(&dir, e))?;
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !item.path().is_dir() {
                continue;
            }
            match parse_entry_name(&name) {
                Some((version, platform)) => entries.push(CacheEntry {
                    version,
                    platform,
                    path: item.path(),
                }),
                None => debug!(name = %name, "Ignoring unrecognized cache directory"),
            }
        }

        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(entries)
    }

    /// Highest valid installed entry for `spec` on `platform`, without
    /// network IO
    ///
    /// Incomplete entries are skipped, so a broken newer patch does not hide
    /// a usable older one.
    pub fn lookup(&self, spec: &VersionSpec, platform: &Platform) -> Option<CacheEntry> {
        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list cache entries");
                return None;
            }
        };

        entries
            .into_iter()
            .filter(|entry| &entry.platform == platform && spec.matches(&entry.version))
            .filter(|entry| {
                let valid = self.validate(&entry.path);
                if !valid {
                    debug!(version = %entry.version, path = %entry.path.display(), "Skipping incomplete cache entry");
                }
                valid
            })
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Whether `path` holds every required binary as an executable file
    ///
    /// Never executes the binaries.
    pub fn validate(&self, path: &Path) -> bool {
        missing_binaries(path).is_empty()
    }

    /// Install the binaries from a gzipped tarball at `archive`
    ///
    /// Once this returns `Ok`, the returned directory is a complete entry.
    /// On error no entry is published and the previous entry (if any) is
    /// left untouched.
    pub fn store(
        &self,
        version: &Version,
        platform: &Platform,
        archive: &Path,
        existing: ExistingEntry,
    ) -> Result<PathBuf> {
        self.ensure_base_dirs()?;
        let _lock = StoreLock::acquire(&self.root.join(LOCK_FILE))?;
        self.remove_leftovers();

        let final_path = self.entry_path(version, platform);
        if existing == ExistingEntry::Keep && self.validate(&final_path) {
            info!(
                path = %final_path.display(),
                "Valid entry already installed (by another process)"
            );
            return Ok(final_path);
        }

        let name = entry_name(version, platform);
        let staging = self.entries_dir().join(format!(
            "{}{}-{:08x}",
            STAGING_PREFIX,
            name,
            rand::thread_rng().gen::<u32>()
        ));

        let result = populate_staging(archive, &staging)
            .and_then(|()| self.promote(&staging, &final_path, &name));

        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
                }
            }
        }
        result?;

        info!(
            version = %version,
            platform = %platform,
            path = %final_path.display(),
            "Stored control plane binaries"
        );
        Ok(final_path)
    }

    /// Atomically move a validated staging directory to its final name
    fn promote(&self, staging: &Path, final_path: &Path, name: &str) -> Result<()> {
        if final_path.exists() {
            let retired = self.entries_dir().join(format!(
                "{}{}-{:08x}",
                RETIRED_PREFIX,
                name,
                rand::thread_rng().gen::<u32>()
            ));
            fs::rename(final_path, &retired).map_err(|e| Error::asset_write(final_path, e))?;

            if let Err(e) = fs::rename(staging, final_path) {
                // Put the old entry back so a failed replace changes nothing
                if let Err(restore) = fs::rename(&retired, final_path) {
                    warn!(path = %final_path.display(), error = %restore, "Failed to restore previous entry");
                }
                return Err(Error::asset_write(final_path, e));
            }

            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!(path = %retired.display(), error = %e, "Failed to remove replaced entry");
            }
        } else {
            fs::rename(staging, final_path).map_err(|e| Error::asset_write(final_path, e))?;
        }

        sync_dir(&self.entries_dir());
        Ok(())
    }

    /// Remove staging and retired directories left behind by crashed writers
    ///
    /// Only safe while holding the store lock.
    fn remove_leftovers(&self) {
        let Ok(read_dir) = fs::read_dir(self.entries_dir()) else {
            return;
        };
        for item in read_dir.filter_map(|item| item.ok()) {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(STAGING_PREFIX) && !name.starts_with(RETIRED_PREFIX) {
                continue;
            }
            match fs::remove_dir_all(item.path()) {
                Ok(()) => info!(path = %item.path().display(), "Removed stale cache directory"),
                Err(e) => warn!(path = %item.path().display(), error = %e, "Failed to remove stale cache directory"),
            }
        }
    }
}

/// Required binaries that are missing or not executable under `path`
pub fn missing_binaries(path: &Path) -> Vec<&'static str> {
    REQUIRED_BINARIES
        .iter()
        .copied()
        .filter(|binary| !is_executable_file(&path.join(binary)))
        .collect()
}

fn entry_name(version: &Version, platform: &Platform) -> String {
    format!("{}-{}", version, platform.suffix())
}

/// Parse `<version>-<os>-<arch>`; the version itself may contain dashes
fn parse_entry_name(name: &str) -> Option<(Version, Platform)> {
    let mut parts = name.rsplitn(3, '-');
    let arch = parts.next()?;
    let os = parts.next()?;
    let version = Version::parse(parts.next()?).ok()?;
    if os.is_empty() || arch.is_empty() {
        return None;
    }
    Some((version, Platform::new(os, arch)))
}

fn populate_staging(archive: &Path, staging: &Path) -> Result<()> {
    fs::create_dir(staging).map_err(|e| Error::asset_write(staging, e))?;
    extract_binaries(archive, staging)?;

    let missing = missing_binaries(staging);
    if !missing.is_empty() {
        return Err(Error::AssetValidation {
            path: archive.to_path_buf(),
            message: format!("archive does not contain {}", missing.join(", ")),
        });
    }
    Ok(())
}

/// Unpack known binaries from a `.tar.gz`, flattening directory prefixes
///
/// Only the file name of each entry is used, so archive paths cannot
/// escape `dest`.
fn extract_binaries(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| Error::asset_write(archive, e))?;
    let mut tarball = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let entries = tarball
        .entries()
        .map_err(|e| unreadable_archive(archive, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| unreadable_archive(archive, e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let entry_path = entry
            .path()
            .map_err(|e| unreadable_archive(archive, e))?
            .into_owned();
        let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !REQUIRED_BINARIES.contains(&name) && !OPTIONAL_BINARIES.contains(&name) {
            debug!(entry = %entry_path.display(), "Skipping archive entry");
            continue;
        }

        let target = dest.join(name);
        let mut out = File::create(&target).map_err(|e| Error::asset_write(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                unreadable_archive(archive, e)
            }
            _ => Error::asset_write(&target, e),
        })?;
        out.sync_all().map_err(|e| Error::asset_write(&target, e))?;
        set_executable(&target)?;
        debug!(binary = %name, "Extracted binary");
    }
    Ok(())
}

fn unreadable_archive(archive: &Path, e: io::Error) -> Error {
    Error::AssetValidation {
        path: archive.to_path_buf(),
        message: format!("unreadable archive: {}", e),
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::asset_write(path, e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Persist the rename itself; best effort
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(path = %dir.display(), error = %e, "Failed to sync cache directory");
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Exclusive advisory lock on the store, released on drop
struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| Error::asset_write(path, e))?;

        debug!(path = %path.display(), "Acquiring cache lock");
        FileExt::lock_exclusive(&file).map_err(|e| Error::asset_write(path, e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release cache lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_archive, write_fake_binaries};
    use tempfile::TempDir;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn linux() -> Platform {
        Platform::new("linux", "amd64")
    }

    fn minor(m: u64) -> VersionSpec {
        VersionSpec::Minor { major: 1, minor: m }
    }

    #[test]
    fn test_parse_entry_name() {
        assert_eq!(
            parse_entry_name("1.27.3-linux-amd64"),
            Some((v("1.27.3"), linux()))
        );
        assert_eq!(
            parse_entry_name("1.28.0-rc.1-darwin-arm64"),
            Some((v("1.28.0-rc.1"), Platform::new("darwin", "arm64")))
        );
        assert_eq!(parse_entry_name("garbage"), None);
        assert_eq!(parse_entry_name("x.y.z-linux-amd64"), None);
    }

    #[test]
    fn test_lookup_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path());
        assert!(store.lookup(&minor(27), &linux()).is_none());
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn test_store_then_lookup_and_validate() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path().join("cache"));
        let archive = write_archive(dir.path(), &["kube-apiserver", "etcd", "kubectl"]);

        let path = store
            .store(&v("1.27.1"), &linux(), &archive, ExistingEntry::Keep)
            .unwrap();

        assert_eq!(path, store.entry_path(&v("1.27.1"), &linux()));
        assert!(store.validate(&path));
        assert!(path.join("kubectl").is_file());

        let entry = store.lookup(&minor(27), &linux()).unwrap();
        assert_eq!(entry.path, path);
        assert_eq!(entry.version, v("1.27.1"));
    }

    #[test]
    fn test_lookup_prefers_highest_patch_for_platform() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path());
        for name in [
            "1.27.1-linux-amd64",
            "1.27.5-linux-amd64",
            "1.27.9-darwin-arm64",
            "1.28.0-linux-amd64",
        ] {
            write_fake_binaries(&dir.path().join("k8s").join(name), REQUIRED_BINARIES);
        }

        let entry = store.lookup(&minor(27), &linux()).unwrap();
        assert_eq!(entry.version, v("1.27.5"));

        let exact = store
            .lookup(&VersionSpec::Exact(v("1.27.1")), &linux())
            .unwrap();
        assert_eq!(exact.version, v("1.27.1"));

        assert!(store.lookup(&minor(26), &linux()).is_none());
    }

    #[test]
    fn test_lookup_skips_incomplete_newer_patch() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path());
        write_fake_binaries(&dir.path().join("k8s/1.27.1-linux-amd64"), REQUIRED_BINARIES);
        write_fake_binaries(&dir.path().join("k8s/1.27.5-linux-amd64"), &["kube-apiserver"]);

        let entry = store.lookup(&minor(27), &linux()).unwrap();
        assert_eq!(entry.version, v("1.27.1"));
        assert!(store.validate(&entry.path));

        assert!(store
            .lookup(&VersionSpec::Exact(v("1.27.5")), &linux())
            .is_none());
    }

    #[test]
    fn test_validate_requires_executables() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path());
        let entry = dir.path().join("entry");

        write_fake_binaries(&entry, &["kube-apiserver"]);
        assert!(!store.validate(&entry));
        assert_eq!(missing_binaries(&entry), vec!["etcd"]);

        fs::write(entry.join("etcd"), "not executable").unwrap();
        #[cfg(unix)]
        assert!(!store.validate(&entry));

        write_fake_binaries(&entry, &["etcd"]);
        assert!(store.validate(&entry));
    }

    #[test]
    fn test_store_rejects_incomplete_archive() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path().join("cache"));
        let archive = write_archive(dir.path(), &["kube-apiserver", "kubectl"]);

        let result = store.store(&v("1.27.1"), &linux(), &archive, ExistingEntry::Keep);

        match result {
            Err(Error::AssetValidation { message, .. }) => assert!(message.contains("etcd")),
            other => panic!("expected AssetValidation, got {:?}", other),
        }
        assert!(store.lookup(&minor(27), &linux()).is_none());
        assert!(!store.entry_path(&v("1.27.1"), &linux()).exists());
        assert_no_hidden_dirs(&store);
    }

    #[test]
    fn test_store_rejects_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path().join("cache"));
        let archive = dir.path().join("broken.tar.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();

        let result = store.store(&v("1.27.1"), &linux(), &archive, ExistingEntry::Keep);

        assert!(matches!(result, Err(Error::AssetValidation { .. })));
        assert!(store.lookup(&minor(27), &linux()).is_none());
        assert_no_hidden_dirs(&store);
    }

    #[test]
    fn test_interrupted_store_is_never_valid() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path());
        store.ensure_base_dirs().unwrap();

        // A writer that crashed after extracting one binary
        let staging = dir
            .path()
            .join("k8s")
            .join(".staging-1.27.1-linux-amd64-deadbeef");
        write_fake_binaries(&staging, &["kube-apiserver"]);

        assert!(store.lookup(&minor(27), &linux()).is_none());
        assert!(store.entries().unwrap().is_empty());

        // The next successful store cleans up after it
        let archive = write_archive(dir.path(), &["kube-apiserver", "etcd"]);
        let path = store
            .store(&v("1.27.1"), &linux(), &archive, ExistingEntry::Keep)
            .unwrap();
        assert!(store.validate(&path));
        assert!(!staging.exists());
    }

    #[test]
    fn test_store_keep_returns_existing_valid_entry() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path().join("cache"));
        let existing = store.entry_path(&v("1.27.1"), &linux());
        write_fake_binaries(&existing, REQUIRED_BINARIES);
        fs::write(existing.join("marker"), "original").unwrap();

        let archive = write_archive(dir.path(), &["kube-apiserver", "etcd"]);
        let path = store
            .store(&v("1.27.1"), &linux(), &archive, ExistingEntry::Keep)
            .unwrap();

        assert_eq!(path, existing);
        assert!(path.join("marker").exists());
    }

    #[test]
    fn test_store_replace_swaps_entry() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path().join("cache"));
        let existing = store.entry_path(&v("1.27.1"), &linux());
        write_fake_binaries(&existing, REQUIRED_BINARIES);
        fs::write(existing.join("marker"), "original").unwrap();

        let archive = write_archive(dir.path(), &["kube-apiserver", "etcd"]);
        let path = store
            .store(&v("1.27.1"), &linux(), &archive, ExistingEntry::Replace)
            .unwrap();

        assert!(store.validate(&path));
        assert!(!path.join("marker").exists());
        assert_no_hidden_dirs(&store);
    }

    #[test]
    fn test_store_heals_invalid_entry() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path().join("cache"));
        let existing = store.entry_path(&v("1.27.1"), &linux());
        write_fake_binaries(&existing, &["kube-apiserver"]);
        assert!(!store.validate(&existing));

        let archive = write_archive(dir.path(), &["kube-apiserver", "etcd"]);
        let path = store
            .store(&v("1.27.1"), &linux(), &archive, ExistingEntry::Keep)
            .unwrap();

        assert!(store.validate(&path));
    }

    fn assert_no_hidden_dirs(store: &AssetStore) {
        let hidden: Vec<_> = fs::read_dir(store.root().join(ENTRIES_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(STAGING_PREFIX) || name.starts_with(RETIRED_PREFIX))
            .collect();
        assert!(hidden.is_empty(), "leftover directories: {:?}", hidden);
    }
}
