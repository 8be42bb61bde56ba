//! Filesystem helpers shared by sessions, steps and the installer.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, IoContext, Result};

/// Hex sha256 and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .io_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// `path` with `.suffix` appended to its file name.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

/// Move `src` over `dst` so that readers of `dst` see either the old or the
/// new content. Across filesystems the data is first copied next to `dst`
/// and renamed from there.
pub fn atomic_replace(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    let staged = sibling_path(dst, "incoming");
    fs::copy(src, &staged)
        .io_context(|| format!("copying '{}' to '{}'", src.display(), staged.display()))?;
    File::open(&staged)
        .and_then(|f| f.sync_all())
        .io_context(|| format!("syncing '{}'", staged.display()))?;
    if let Err(err) = fs::rename(&staged, dst) {
        let _ = fs::remove_file(&staged);
        return Err(BuildError::io(
            format!("renaming '{}' over '{}'", staged.display(), dst.display()),
            err,
        ));
    }
    fs::remove_file(src).io_context(|| format!("removing '{}'", src.display()))?;
    Ok(())
}

/// Recursively copy `src` into `dst`, recreating symlinks rather than
/// following them. Existing files and links at the destination are replaced.
/// A destination directory that is itself a link is refused.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if dst.is_symlink() {
        return Err(BuildError::Validation(format!(
            "refusing to copy into symbolic link '{}'",
            dst.display()
        )));
    }
    fs::create_dir_all(dst).io_context(|| format!("creating '{}'", dst.display()))?;

    for entry in fs::read_dir(src).io_context(|| format!("reading '{}'", src.display()))? {
        let entry = entry.io_context(|| format!("reading '{}'", src.display()))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let ft = entry
            .file_type()
            .io_context(|| format!("stat '{}'", src_path.display()))?;

        if ft.is_symlink() {
            copy_symlink(&src_path, &dst_path)?;
        } else if ft.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            if dst_path.is_symlink() {
                fs::remove_file(&dst_path)
                    .io_context(|| format!("removing '{}'", dst_path.display()))?;
            }
            fs::copy(&src_path, &dst_path).io_context(|| {
                format!("copying '{}' to '{}'", src_path.display(), dst_path.display())
            })?;
        }
    }

    Ok(())
}

pub fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).io_context(|| format!("readlink '{}'", src.display()))?;
    if dst.is_symlink() || dst.is_file() {
        fs::remove_file(dst).io_context(|| format!("removing '{}'", dst.display()))?;
    }
    std::os::unix::fs::symlink(&target, dst)
        .io_context(|| format!("creating symlink '{}'", dst.display()))
}
