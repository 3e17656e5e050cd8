//! File copying and hardlinking between image directories.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use ploop_common::PloopResult;

/// Copy a single file like `cp`, keeping its permission bits.
///
/// A partially written destination is removed on failure.
pub fn copy_file(src: &Path, dst: &Path) -> PloopResult<()> {
    let mut source = File::open(src)?;
    let permissions = source.metadata()?.permissions();

    let mut dest = File::create(dst)?;
    let copied = io::copy(&mut source, &mut dest)
        .and_then(|_| dest.sync_all())
        .and_then(|()| fs::set_permissions(dst, permissions));

    if let Err(e) = copied {
        drop(dest);
        let _ = fs::remove_file(dst);
        return Err(e.into());
    }

    Ok(())
}

/// Copy every regular file directly inside `src_dir` into `dst_dir`.
///
/// Subdirectories and symlinks are skipped. Returns the number of files copied.
pub fn copy_dir_files(src_dir: &Path, dst_dir: &Path) -> PloopResult<usize> {
    let mut copied = 0;

    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        copy_file(&entry.path(), &dst_dir.join(entry.file_name()))?;
        copied += 1;
    }

    tracing::debug!(
        src = %src_dir.display(),
        dst = %dst_dir.display(),
        copied,
        "Copied directory files"
    );

    Ok(copied)
}

/// Hardlink every regular file in `src_dir` whose name starts with `prefix`
/// into `dst_dir`. Returns the number of links created.
pub fn hardlink_prefixed(src_dir: &Path, dst_dir: &Path, prefix: &str) -> PloopResult<usize> {
    let mut linked = 0;

    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let matches = name.to_str().is_some_and(|n| n.starts_with(prefix));
        if !matches || !entry.file_type()?.is_file() {
            continue;
        }

        fs::hard_link(entry.path(), dst_dir.join(&name))?;
        linked += 1;
    }

    Ok(linked)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use super::*;

    #[test]
    fn copy_file_keeps_content_and_mode() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::write(&src, b"descriptor").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o600)).unwrap();

        copy_file(&src, &dst).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"descriptor");
        assert_eq!(fs::metadata(&dst).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn copy_file_missing_source_leaves_no_destination() {
        let temp = tempfile::tempdir().unwrap();
        let dst = temp.path().join("dst");

        assert!(copy_file(&temp.path().join("missing"), &dst).is_err());
        assert!(!dst.exists());
    }

    #[test]
    fn copy_dir_files_is_not_recursive() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::create_dir(&dst).unwrap();
        fs::write(src.join("DiskDescriptor.xml"), b"dd").unwrap();
        fs::write(src.join("root.hdd"), b"data").unwrap();
        fs::write(src.join("nested/skip"), b"x").unwrap();

        assert_eq!(copy_dir_files(&src, &dst).unwrap(), 2);
        assert!(dst.join("DiskDescriptor.xml").is_file());
        assert!(dst.join("root.hdd").is_file());
        assert!(!dst.join("nested").exists());
    }

    #[test]
    fn hardlink_prefixed_shares_inodes() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        fs::write(src.join("root.hdd"), b"base").unwrap();
        fs::write(src.join("root.hdd.{1234}"), b"top").unwrap();
        fs::write(src.join("DiskDescriptor.xml"), b"dd").unwrap();

        assert_eq!(hardlink_prefixed(&src, &dst, "root.hdd").unwrap(), 2);

        let original = fs::metadata(src.join("root.hdd")).unwrap();
        let linked = fs::metadata(dst.join("root.hdd")).unwrap();
        assert_eq!(original.ino(), linked.ino());
        assert!(!dst.join("DiskDescriptor.xml").exists());
    }
}
