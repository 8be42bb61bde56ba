//! Deterministic `tar.zst` packing of a filesystem tree.
//!
//! Entries are sorted by relative path and written with zeroed mtime/uid/gid
//! so the same tree always produces the same bytes. Both directions accept an
//! optional deadline which is checked between entries.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::error::{BuildError, IoContext, Result};

pub const DEFAULT_LEVEL: i32 = 3;

/// Pack `src_dir` into `out_path`.
pub fn pack_tree(
    src_dir: &Path,
    out_path: &Path,
    level: i32,
    deadline: Option<(Instant, Duration)>,
) -> Result<()> {
    let out = File::create(out_path)
        .io_context(|| format!("creating archive '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, level)
        .io_context(|| format!("starting zstd encoder for '{}'", out_path.display()))?;
    let mut builder = tar::Builder::new(encoder);

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.map_err(|err| {
            BuildError::io(
                format!("walking '{}'", src_dir.display()),
                err.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walkdir loop")),
            )
        })?;
        if ent.path() == src_dir {
            continue;
        }
        entries.push(ent.path().to_path_buf());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        check_deadline(deadline, "packing image")?;
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");

        let md = fs::symlink_metadata(&p).io_context(|| format!("stat '{}'", p.display()))?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(mode_of(&md));

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .io_context(|| format!("archiving directory '{rel}'"))?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p).io_context(|| format!("readlink '{}'", p.display()))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header
                .set_link_name(&target)
                .io_context(|| format!("setting link name for '{rel}'"))?;
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .io_context(|| format!("archiving symlink '{rel}'"))?;
        } else if md.is_file() {
            let mut f = File::open(&p).io_context(|| format!("opening '{}'", p.display()))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, &mut f)
                .io_context(|| format!("archiving file '{rel}'"))?;
        }
    }

    let encoder = builder
        .into_inner()
        .io_context(|| "finalizing tar stream")?;
    encoder.finish().io_context(|| "finalizing zstd stream")?;
    Ok(())
}

/// Unpack `archive` into the existing directory `dest_dir`.
pub fn unpack_tree(
    archive: &Path,
    dest_dir: &Path,
    deadline: Option<(Instant, Duration)>,
) -> Result<()> {
    let f = File::open(archive).io_context(|| format!("opening '{}'", archive.display()))?;
    let decoder = zstd::stream::Decoder::new(f)
        .io_context(|| format!("reading zstd stream '{}'", archive.display()))?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    let entries = tar
        .entries()
        .io_context(|| format!("reading archive '{}'", archive.display()))?;
    for entry in entries {
        check_deadline(deadline, "unpacking image")?;
        let mut entry =
            entry.io_context(|| format!("reading entry of '{}'", archive.display()))?;
        // unpack_in refuses entries that would escape dest_dir.
        entry
            .unpack_in(dest_dir)
            .io_context(|| format!("unpacking into '{}'", dest_dir.display()))?;
    }
    Ok(())
}

fn check_deadline(deadline: Option<(Instant, Duration)>, operation: &str) -> Result<()> {
    match deadline {
        Some((at, timeout)) if Instant::now() >= at => Err(BuildError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn mode_of(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(md: &fs::Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else {
        0o644
    }
}
