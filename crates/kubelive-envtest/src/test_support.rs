//! Fixtures shared by the unit tests

use std::fs;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Gzipped tarball laid out like a published envtest archive
pub(crate) fn archive_bytes(binaries: &[&str]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for binary in binaries {
        let data = format!("#!/bin/sh\necho {}\n", binary);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(
                &mut header,
                format!("controller-tools/envtest/{}", binary),
                data.as_bytes(),
            )
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Write [`archive_bytes`] to `dir/envtest.tar.gz`
pub(crate) fn write_archive(dir: &Path, binaries: &[&str]) -> PathBuf {
    let path = dir.join("envtest.tar.gz");
    fs::write(&path, archive_bytes(binaries)).unwrap();
    path
}

/// Create executable placeholder binaries directly in `dir`
pub(crate) fn write_fake_binaries(dir: &Path, binaries: &[&str]) {
    fs::create_dir_all(dir).unwrap();
    for binary in binaries {
        let path = dir.join(binary);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
}

/// Lowercase hex SHA-512 of `data`
pub(crate) fn sha512_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha512};
    hex::encode(Sha512::digest(data))
}
