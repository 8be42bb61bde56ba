//! Failure diagnostics.
//!
//! A bundle is written before any cleanup so it can still read the mounted
//! tree:
//!
//! ```text
//! <root>/Diagnostics_<timestamp>/
//!   Logs/         build events, the log sink file, in-image logs
//!   Config/       build configuration, in-image config files
//!   StoreExport/  config store exports
//!   FileSystem/   listing.txt
//!   SystemInfo.txt
//! ```
//!
//! Only creating the bundle directory itself can fail. Everything after that
//! is best-effort and recorded as a bundle warning.

use serde::Serialize;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::DiagnosticsSettings;
use crate::config_store::ConfigStorePatcher;
use crate::error::{BuildError, IoContext, Result};
use crate::logging::LogContext;
use crate::session::MountSession;
use crate::timestamp::{now_utc_compact, now_utc_rfc3339};

const COMPONENT: &str = "diagnostics";

pub struct FailureContext<'a> {
    pub build_id: &'a str,
    pub stage: &'a str,
    pub error: &'a BuildError,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsBundle {
    pub path: PathBuf,
    pub collected_at_utc: String,
    pub artifacts: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

pub struct DiagnosticsCollector {
    root: PathBuf,
    settings: DiagnosticsSettings,
    config_snapshot: Option<String>,
    log: LogContext,
}

struct Collection<'a> {
    dir: PathBuf,
    settings: &'a DiagnosticsSettings,
    artifacts: Vec<PathBuf>,
    warnings: Vec<String>,
}

impl Collection<'_> {
    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    fn subdir(&mut self, name: &str) -> PathBuf {
        let path = self.dir.join(name);
        if let Err(err) = fs::create_dir_all(&path) {
            self.warn(format!("creating {name}/: {err}"));
        }
        path
    }

    fn write(&mut self, dest: PathBuf, contents: &[u8]) {
        if let Some(parent) = dest.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match fs::write(&dest, contents) {
            Ok(()) => self.artifacts.push(dest),
            Err(err) => self.warn(format!("writing '{}': {err}", dest.display())),
        }
    }

    /// Copy at most `max_file_bytes` of `src` to `dest`.
    fn copy_capped(&mut self, src: &Path, dest: PathBuf) {
        let max = self.settings.max_file_bytes;
        let result = (|| -> io::Result<bool> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let md = fs::symlink_metadata(src)?;
            if md.file_type().is_symlink() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "symbolic link not followed",
                ));
            }
            let len = md.len();
            let mut reader = File::open(src)?.take(max);
            let mut out = File::create(&dest)?;
            io::copy(&mut reader, &mut out)?;
            out.flush()?;
            Ok(len > max)
        })();
        match result {
            Ok(truncated) => {
                if truncated {
                    self.warn(format!(
                        "'{}' truncated to {max} bytes",
                        src.display()
                    ));
                }
                self.artifacts.push(dest);
            }
            Err(err) => self.warn(format!("copying '{}': {err}", src.display())),
        }
    }

    /// Copy a mount-relative file or directory into `dest_root`, keeping its
    /// relative layout. Missing paths are skipped quietly.
    fn copy_from_mount(&mut self, session: &MountSession, rel: &str, dest_root: &Path) {
        let src = match session.resolve_file(rel) {
            Ok(src) => src,
            Err(err) => {
                self.warn(format!("skipping '{rel}': {err}"));
                return;
            }
        };
        let rel_dest = rel.replace('\\', "/");
        let rel_dest = rel_dest.trim_start_matches('/');
        if src.is_file() {
            self.copy_capped(&src, dest_root.join(rel_dest));
        } else if src.is_dir() {
            let limit = self.settings.max_listing_entries;
            let mut copied = 0usize;
            for entry in WalkDir::new(&src).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        self.warn(format!("walking '{}': {err}", src.display()));
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                if copied >= limit {
                    self.warn(format!("stopped copying '{rel}' after {limit} files"));
                    break;
                }
                let inner = entry.path().strip_prefix(&src).unwrap_or(entry.path());
                self.copy_capped(entry.path(), dest_root.join(rel_dest).join(inner));
                copied += 1;
            }
        }
    }
}

impl DiagnosticsCollector {
    pub fn new(
        root: impl Into<PathBuf>,
        settings: DiagnosticsSettings,
        config_snapshot: Option<String>,
        log: LogContext,
    ) -> Self {
        Self {
            root: root.into(),
            settings,
            config_snapshot,
            log,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a bundle for `failure`. With a live session the mounted tree is
    /// read as well.
    pub fn collect(
        &self,
        failure: &FailureContext<'_>,
        live: Option<(&mut MountSession, &mut ConfigStorePatcher)>,
    ) -> Result<DiagnosticsBundle> {
        let dir = self.create_bundle_dir()?;
        let collected_at_utc = now_utc_rfc3339();
        let mut c = Collection {
            dir: dir.clone(),
            settings: &self.settings,
            artifacts: Vec::new(),
            warnings: Vec::new(),
        };

        let logs = c.subdir("Logs");
        let config = c.subdir("Config");
        let exports = c.subdir("StoreExport");
        let filesystem = c.subdir("FileSystem");

        self.collect_build_log(&mut c, &logs);
        if let Some(snapshot) = &self.config_snapshot {
            c.write(config.join("build-config.toml"), snapshot.as_bytes());
        }

        let mut session_summary = None;
        if let Some((session, store)) = live {
            for rel in &self.settings.log_paths {
                c.copy_from_mount(session, rel, &logs.join("image"));
            }
            for rel in &self.settings.config_paths {
                c.copy_from_mount(session, rel, &config.join("image"));
            }
            for export in &self.settings.store_exports {
                let present = session
                    .resolve_file(&export.backing_file)
                    .map(|p| p.is_file())
                    .unwrap_or(false);
                if !present && store.handle(&export.alias).is_none() {
                    continue;
                }
                let dest = exports.join(format!("{}.json", export.alias));
                match store.export_with_retry(session, &export.alias, &export.backing_file, &dest) {
                    Ok(()) => c.artifacts.push(dest),
                    Err(err) => c.warn(format!("exporting '{}': {err}", export.alias)),
                }
            }
            let listing = self.listing(session.mount_path(), &mut c);
            c.write(filesystem.join("listing.txt"), listing.as_bytes());
            session_summary = Some(format!(
                "session_id: {}\nsession_state: {}\nartifact: {}\nmount_path: {}\nimage_index: {}\n",
                session.id(),
                session.state(),
                session.artifact_path().display(),
                session.mount_path().display(),
                session.image_index(),
            ));
        }

        let mut info = String::new();
        let _ = writeln!(info, "build_id: {}", failure.build_id);
        let _ = writeln!(info, "stage: {}", failure.stage);
        let _ = writeln!(info, "error_kind: {}", failure.error.kind());
        let _ = writeln!(info, "error: {}", failure.error);
        if let Some(summary) = session_summary {
            info.push_str(&summary);
        }
        let _ = writeln!(info, "host_os: {}", std::env::consts::OS);
        let _ = writeln!(info, "host_arch: {}", std::env::consts::ARCH);
        let _ = writeln!(info, "collected_at_utc: {collected_at_utc}");
        if !c.warnings.is_empty() {
            let _ = writeln!(info, "warnings:");
            for warning in &c.warnings {
                let _ = writeln!(info, "  - {warning}");
            }
        }
        c.write(dir.join("SystemInfo.txt"), info.as_bytes());

        self.log.info(
            COMPONENT,
            "diagnostics bundle written",
            [
                ("path", dir.display().to_string().into()),
                ("artifacts", c.artifacts.len().into()),
                ("warnings", c.warnings.len().into()),
            ],
        );
        Ok(DiagnosticsBundle {
            path: dir,
            collected_at_utc,
            artifacts: c.artifacts,
            warnings: c.warnings,
        })
    }

    fn create_bundle_dir(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .io_context(|| format!("creating diagnostics root '{}'", self.root.display()))?;
        let base = format!("Diagnostics_{}", now_utc_compact());
        let mut candidate = self.root.join(&base);
        let mut n = 2;
        loop {
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    candidate = self.root.join(format!("{base}-{n}"));
                    n += 1;
                }
                Err(err) => {
                    return Err(BuildError::io(
                        format!("creating '{}'", candidate.display()),
                        err,
                    ))
                }
            }
        }
    }

    fn collect_build_log(&self, c: &mut Collection<'_>, logs: &Path) {
        if let Err(err) = self.log.flush() {
            c.warn(format!("flushing build log: {err}"));
        }
        let mut events = String::new();
        for event in self.log.recent() {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    events.push_str(&line);
                    events.push('\n');
                }
                Err(err) => c.warn(format!("serializing event: {err}")),
            }
        }
        c.write(logs.join("build-events.jsonl"), events.as_bytes());

        if let Some(sink) = self.log.sink_location() {
            if sink.is_file() {
                let name = sink
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "build.log".to_string());
                c.copy_capped(&sink, logs.join(name));
            }
        }
    }

    fn listing(&self, mount: &Path, c: &mut Collection<'_>) -> String {
        let limit = self.settings.max_listing_entries;
        let mut out = String::new();
        let mut count = 0usize;
        for entry in WalkDir::new(mount).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    c.warn(format!("listing: {err}"));
                    continue;
                }
            };
            if entry.path() == mount {
                continue;
            }
            if count >= limit {
                let _ = writeln!(out, "... listing truncated after {limit} entries");
                c.warn(format!("filesystem listing truncated after {limit} entries"));
                break;
            }
            let rel = entry.path().strip_prefix(mount).unwrap_or(entry.path());
            let ft = entry.file_type();
            let (tag, size) = if ft.is_dir() {
                ("d", 0)
            } else if ft.is_symlink() {
                ("l", 0)
            } else {
                ("f", entry.metadata().map(|m| m.len()).unwrap_or(0))
            };
            let _ = writeln!(out, "{tag} {size:>12} {}", rel.display());
            count += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreExport, UnloadRetry};
    use crate::config_store::{ConfigValue, HiveFileBackend};
    use crate::retry::RecordingSleeper;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn settings() -> DiagnosticsSettings {
        DiagnosticsSettings {
            log_paths: vec!["Windows/Logs/DISM".into(), "var/log/missing".into()],
            config_paths: vec!["Windows/Panther/unattend.xml".into()],
            store_exports: vec![StoreExport {
                alias: "DIAG_SOFTWARE".into(),
                backing_file: "Windows/System32/config/SOFTWARE".into(),
            }],
            max_file_bytes: 8,
            max_listing_entries: 100,
        }
    }

    fn failure_error() -> BuildError {
        BuildError::step("inject drivers", BuildError::Validation("source missing".into()))
    }

    #[test]
    fn bundle_collects_logs_config_exports_and_listing() {
        let tmp = TempDir::new().unwrap();
        let mount = tmp.path().join("mount");
        fs::create_dir_all(mount.join("Windows/Logs/DISM")).unwrap();
        fs::write(mount.join("Windows/Logs/DISM/dism.log"), "0123456789abcdef").unwrap();
        fs::create_dir_all(mount.join("Windows/Panther")).unwrap();
        fs::write(mount.join("Windows/Panther/unattend.xml"), "<u/>").unwrap();
        fs::create_dir_all(mount.join("Windows/System32/config")).unwrap();
        let mut values = BTreeMap::new();
        values.insert("Setup\\State".to_string(), ConfigValue::Numeric(7));
        HiveFileBackend::create_file(&mount.join("Windows/System32/config/SOFTWARE"), &values)
            .unwrap();

        let mut session = MountSession::detached_for_tests(tmp.path(), &mount);
        let (log, _) = LogContext::in_memory();
        log.info("test", "before failure", []);
        let mut store = ConfigStorePatcher::new(
            Box::new(HiveFileBackend::new()),
            UnloadRetry::default(),
            Arc::new(RecordingSleeper::new()),
            log.clone(),
        );
        let collector = DiagnosticsCollector::new(
            tmp.path().join("diag"),
            settings(),
            Some("work_root = \"/w\"\n".into()),
            log,
        );
        let error = failure_error();
        let bundle = collector
            .collect(
                &FailureContext {
                    build_id: "b1",
                    stage: "Mutations",
                    error: &error,
                },
                Some((&mut session, &mut store)),
            )
            .unwrap();

        let dir = &bundle.path;
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("Diagnostics_"));
        assert_eq!(
            fs::read_to_string(dir.join("Logs/image/Windows/Logs/DISM/dism.log")).unwrap(),
            "01234567"
        );
        assert!(bundle.warnings.iter().any(|w| w.contains("truncated")));
        assert!(dir.join("Config/image/Windows/Panther/unattend.xml").is_file());
        assert!(dir.join("Config/build-config.toml").is_file());
        assert!(dir.join("StoreExport/DIAG_SOFTWARE.json").is_file());
        assert!(store.handle("DIAG_SOFTWARE").is_none());

        let listing = fs::read_to_string(dir.join("FileSystem/listing.txt")).unwrap();
        assert!(listing.contains("Windows/Panther/unattend.xml"));
        let events = fs::read_to_string(dir.join("Logs/build-events.jsonl")).unwrap();
        assert!(events.contains("before failure"));
        let info = fs::read_to_string(dir.join("SystemInfo.txt")).unwrap();
        assert!(info.contains("stage: Mutations"));
        assert!(info.contains("error_kind: validation_failure"));
        assert!(info.contains("session_id: test-session"));
    }

    #[test]
    fn linked_sources_are_not_copied_out_of_the_host() {
        let tmp = TempDir::new().unwrap();
        let secret = tmp.path().join("host-secret");
        fs::write(&secret, "host only").unwrap();
        let mount = tmp.path().join("mount");
        fs::create_dir_all(mount.join("Windows/Logs/DISM")).unwrap();
        fs::create_dir_all(mount.join("Windows/Panther")).unwrap();
        std::os::unix::fs::symlink(&secret, mount.join("Windows/Logs/DISM/dism.log")).unwrap();
        std::os::unix::fs::symlink(&secret, mount.join("Windows/Panther/unattend.xml")).unwrap();

        let mut session = MountSession::detached_for_tests(tmp.path(), &mount);
        let (log, _) = LogContext::in_memory();
        let mut store = ConfigStorePatcher::new(
            Box::new(HiveFileBackend::new()),
            UnloadRetry::default(),
            Arc::new(RecordingSleeper::new()),
            log.clone(),
        );
        let collector = DiagnosticsCollector::new(tmp.path().join("diag"), settings(), None, log);
        let error = failure_error();
        let bundle = collector
            .collect(
                &FailureContext {
                    build_id: "b3",
                    stage: "Mutations",
                    error: &error,
                },
                Some((&mut session, &mut store)),
            )
            .unwrap();

        assert!(!bundle.path.join("Logs/image/Windows/Logs/DISM/dism.log").exists());
        assert!(!bundle.path.join("Config/image/Windows/Panther/unattend.xml").exists());
        assert!(bundle.warnings.iter().any(|w| w.contains("unattend.xml")));
        let listing = fs::read_to_string(bundle.path.join("FileSystem/listing.txt")).unwrap();
        assert!(listing
            .lines()
            .any(|l| l.starts_with("l ") && l.ends_with("Windows/Panther/unattend.xml")));
    }

    #[test]
    fn bundle_without_session_still_has_summary() {
        let tmp = TempDir::new().unwrap();
        let (log, _) = LogContext::in_memory();
        let collector =
            DiagnosticsCollector::new(tmp.path().join("diag"), settings(), None, log);
        let error = failure_error();
        let failure = FailureContext {
            build_id: "b2",
            stage: "Dependencies",
            error: &error,
        };
        let first = collector.collect(&failure, None).unwrap();
        let second = collector.collect(&failure, None).unwrap();
        assert_ne!(first.path, second.path);
        assert!(first.path.join("SystemInfo.txt").is_file());
        assert!(first.path.join("Logs").is_dir());
    }
}
