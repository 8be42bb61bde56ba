//! Mount sessions.
//!
//! A [`MountSession`] is an exclusive, mounted working copy of one image
//! artifact. The canonical artifact is only ever replaced, atomically, by a
//! successful commit; every other way out leaves it byte-identical.
//!
//! Layout under the sessions directory:
//!
//! ```text
//! <sessions>/<session-id>/working/<artifact file name>
//! <sessions>/<session-id>/mount/
//! ```

use fs2::FileExt;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::{BuildConfig, TimeoutProfile, TimeoutProfiles};
use crate::error::{BuildError, IoContext, Result};
use crate::fsutil::{atomic_replace, sha256_hex};
use crate::logging::LogContext;
use crate::retry::{retry_with_backoff, RetryPolicy, Sleeper};
use crate::timestamp::{generate_build_id, now_utc_rfc3339};
use crate::toolkit::{DismountMode, ImagingToolkit};

const COMPONENT: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unmounted,
    Mounted,
    Modified,
    Committing,
    Committed,
    Discarded,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unmounted => "Unmounted",
            SessionState::Mounted => "Mounted",
            SessionState::Modified => "Modified",
            SessionState::Committing => "Committing",
            SessionState::Committed => "Committed",
            SessionState::Discarded => "Discarded",
            SessionState::Failed => "Failed",
        }
    }

    /// Mounted and open for mutation.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Mounted | SessionState::Modified)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive lock keyed by the artifact's canonical path. The file is never
/// unlinked: removing a held lock file would let a second process lock a
/// fresh file at the same path.
#[derive(Debug)]
struct ArtifactLock {
    _file: File,
    path: PathBuf,
}

fn acquire_artifact_lock(lock_dir: &Path, artifact: &Path) -> Result<ArtifactLock> {
    fs::create_dir_all(lock_dir)
        .io_context(|| format!("creating lock dir '{}'", lock_dir.display()))?;
    let key = sha256_hex(artifact.to_string_lossy().as_bytes());
    let path = lock_dir.join(format!("{}.lock", &key[..32]));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .io_context(|| format!("opening lock file '{}'", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        return Err(BuildError::Busy(format!(
            "artifact '{}' is held by another session",
            artifact.display()
        )));
    }
    Ok(ArtifactLock { _file: file, path })
}

#[derive(Debug)]
pub struct MountSession {
    id: String,
    artifact_path: PathBuf,
    working_copy_path: PathBuf,
    mount_path: PathBuf,
    work_dir: PathBuf,
    image_index: u32,
    state: SessionState,
    acquired_at: String,
    artifact_size: u64,
    attached: BTreeSet<String>,
    lock: Option<ArtifactLock>,
    log: LogContext,
}

impl MountSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical path of the artifact this session was acquired for.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn working_copy_path(&self) -> &Path {
        &self.working_copy_path
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn acquired_at(&self) -> &str {
        &self.acquired_at
    }

    pub fn artifact_size(&self) -> u64 {
        self.artifact_size
    }

    pub fn lock_path(&self) -> Option<&Path> {
        self.lock.as_ref().map(|l| l.path.as_path())
    }

    /// Resolve a mount-relative path. Absolute paths, `..` and symbolic
    /// links among the parent directories are rejected so nothing can
    /// address the host outside the mount. The last component may still be
    /// a link; see [`MountSession::resolve_file`].
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        resolve_within(&self.mount_path, rel)
    }

    /// Like [`MountSession::resolve`], but the last component must not be a
    /// symbolic link either. For paths that are read or edited in place.
    pub fn resolve_file(&self, rel: &str) -> Result<PathBuf> {
        let path = resolve_within(&self.mount_path, rel)?;
        if path.is_symlink() {
            return Err(BuildError::Validation(format!(
                "path '{rel}' is a symbolic link"
            )));
        }
        Ok(path)
    }

    /// First successful mutation moves Mounted to Modified.
    pub fn mark_modified(&mut self) {
        if self.state == SessionState::Mounted {
            self.state = SessionState::Modified;
        }
    }

    pub fn attached_aliases(&self) -> Vec<String> {
        self.attached.iter().cloned().collect()
    }

    pub(crate) fn attach_alias(&mut self, alias: &str) {
        self.attached.insert(alias.to_string());
    }

    pub(crate) fn detach_alias(&mut self, alias: &str) {
        self.attached.remove(alias);
    }

    fn release_lock(&mut self) {
        self.lock = None;
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests(work_dir: &Path, mount_path: &Path) -> Self {
        Self {
            id: "test-session".to_string(),
            artifact_path: work_dir.join("artifact.img"),
            working_copy_path: work_dir.join("working.img"),
            mount_path: mount_path.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            image_index: 1,
            state: SessionState::Mounted,
            acquired_at: now_utc_rfc3339(),
            artifact_size: 0,
            attached: BTreeSet::new(),
            lock: None,
            log: LogContext::in_memory().0,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_state_for_tests(&mut self, state: SessionState) {
        self.state = state;
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if self.state.is_live() {
            self.log.warn(
                COMPONENT,
                "mount session dropped while still mounted",
                [
                    ("session", self.id.as_str().into()),
                    ("mount_path", self.mount_path.display().to_string().into()),
                ],
            );
        }
    }
}

pub(crate) fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf> {
    let normalized = rel.replace('\\', "/");
    if normalized.trim_matches('/').is_empty() {
        return Err(BuildError::Validation(format!(
            "path '{rel}' does not name anything inside the mount"
        )));
    }
    // A drive prefix such as `C:` is meaningless inside an offline mount.
    if normalized.len() >= 2 && normalized.as_bytes()[1] == b':' {
        return Err(BuildError::Validation(format!(
            "path '{rel}' must be relative to the mount root"
        )));
    }
    let mut out = root.to_path_buf();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(BuildError::Validation(format!(
                    "path '{rel}' escapes the mount"
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BuildError::Validation(format!(
                    "path '{rel}' must be relative to the mount root"
                )))
            }
        }
    }
    reject_linked_parents(root, &out, rel)?;
    Ok(out)
}

/// Fail if any existing directory between `root` and `path` is a symlink.
/// Checking stops at the first prefix that does not exist yet.
fn reject_linked_parents(root: &Path, path: &Path, rel: &str) -> Result<()> {
    let Ok(inner) = path.strip_prefix(root) else {
        return Ok(());
    };
    let mut prefix = root.to_path_buf();
    let mut parts = inner.components().peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            break;
        }
        prefix.push(part);
        match fs::symlink_metadata(&prefix) {
            Ok(md) if md.file_type().is_symlink() => {
                return Err(BuildError::Validation(format!(
                    "path '{rel}' passes through symbolic link '{}'",
                    prefix.display()
                )))
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
            Err(err) => return Err(BuildError::io(format!("stat '{}'", prefix.display()), err)),
        }
    }
    Ok(())
}

pub struct SessionManager {
    toolkit: Arc<dyn ImagingToolkit>,
    sessions_dir: PathBuf,
    lock_dir: PathBuf,
    mount_retry: RetryPolicy,
    timeouts: TimeoutProfiles,
    sleeper: Arc<dyn Sleeper>,
    log: LogContext,
}

impl SessionManager {
    pub fn new(
        config: &BuildConfig,
        toolkit: Arc<dyn ImagingToolkit>,
        sleeper: Arc<dyn Sleeper>,
        log: LogContext,
    ) -> Self {
        Self {
            toolkit,
            sessions_dir: config.sessions_dir(),
            lock_dir: config.lock_dir(),
            mount_retry: config.mount_retry.policy(),
            timeouts: config.timeouts.clone(),
            sleeper,
            log,
        }
    }

    pub fn toolkit(&self) -> &Arc<dyn ImagingToolkit> {
        &self.toolkit
    }

    pub fn profile_for(&self, artifact_size: u64) -> &TimeoutProfile {
        self.timeouts.for_artifact_size(artifact_size)
    }

    /// Take exclusive ownership of `artifact` and mount image `index` of a
    /// working copy of it.
    ///
    /// A second acquire of the same artifact while a session is live fails
    /// with [`BuildError::Busy`] at once. Busy reports from the toolkit's
    /// mount are retried under the mount policy.
    pub fn acquire(&self, artifact: &Path, index: u32) -> Result<MountSession> {
        if index == 0 {
            return Err(BuildError::Validation("image index starts at 1".to_string()));
        }
        let artifact_path = fs::canonicalize(artifact).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => BuildError::Validation(format!(
                "artifact '{}' does not exist",
                artifact.display()
            )),
            _ => BuildError::io(format!("resolving '{}'", artifact.display()), err),
        })?;
        let lock = acquire_artifact_lock(&self.lock_dir, &artifact_path)?;

        let id = generate_build_id();
        let work_dir = self.sessions_dir.join(&id);
        let file_name = artifact_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "artifact".into());
        let working_copy_path = work_dir.join("working").join(file_name);
        let mount_path = work_dir.join("mount");

        let mut session = MountSession {
            id,
            artifact_path,
            working_copy_path,
            mount_path,
            work_dir,
            image_index: index,
            state: SessionState::Unmounted,
            acquired_at: now_utc_rfc3339(),
            artifact_size: 0,
            attached: BTreeSet::new(),
            lock: Some(lock),
            log: self.log.clone(),
        };

        match self.mount(&mut session) {
            Ok(()) => {
                session.state = SessionState::Mounted;
                self.log.info(
                    COMPONENT,
                    "session acquired",
                    [
                        ("session", session.id.as_str().into()),
                        (
                            "artifact",
                            session.artifact_path.display().to_string().into(),
                        ),
                        ("image_index", index.into()),
                        ("artifact_bytes", session.artifact_size.into()),
                    ],
                );
                Ok(session)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&session.work_dir) {
                    self.log.warn(
                        COMPONENT,
                        "failed to remove working area after failed acquire",
                        [
                            ("session", session.id.as_str().into()),
                            ("error", cleanup.to_string().into()),
                        ],
                    );
                }
                session.release_lock();
                Err(err)
            }
        }
    }

    fn mount(&self, session: &mut MountSession) -> Result<()> {
        let working_dir = session
            .working_copy_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| session.work_dir.clone());
        fs::create_dir_all(&working_dir)
            .io_context(|| format!("creating '{}'", working_dir.display()))?;
        fs::create_dir_all(&session.mount_path)
            .io_context(|| format!("creating '{}'", session.mount_path.display()))?;
        session.artifact_size = fs::copy(&session.artifact_path, &session.working_copy_path)
            .io_context(|| {
                format!(
                    "copying '{}' to working area",
                    session.artifact_path.display()
                )
            })?;

        let timeout = self.profile_for(session.artifact_size).mount();
        let toolkit = Arc::clone(&self.toolkit);
        let outcome = retry_with_backoff(
            &self.mount_retry,
            self.sleeper.as_ref(),
            |_| {
                toolkit.mount(
                    &session.working_copy_path,
                    session.image_index,
                    &session.mount_path,
                    timeout,
                )
            },
            |attempt, err, delay| {
                self.log.warn(
                    COMPONENT,
                    "mount busy, retrying",
                    [
                        ("session", session.id.as_str().into()),
                        ("attempt", attempt.into()),
                        ("backoff_ms", (delay.as_millis() as u64).into()),
                        ("error", err.to_string().into()),
                    ],
                );
            },
        );
        outcome.map(|_| ()).map_err(|exhausted| BuildError::Mount {
            path: session.artifact_path.clone(),
            attempts: exhausted.attempts,
            source: Box::new(exhausted.last),
        })
    }

    /// End a session by committing or discarding it.
    ///
    /// Commit is refused while config store handles are attached. A failed
    /// commit marks the session Failed and keeps the working area for
    /// inspection. Discard never fails once the session is live.
    pub fn release(&self, session: &mut MountSession, commit: bool) -> Result<()> {
        if !session.state.is_live() {
            return Err(BuildError::invalid_state("Mounted or Modified", session.state));
        }
        if commit {
            self.commit(session)
        } else {
            self.discard(session);
            Ok(())
        }
    }

    fn commit(&self, session: &mut MountSession) -> Result<()> {
        if !session.attached.is_empty() {
            return Err(BuildError::HandlesOutstanding {
                session: session.id.clone(),
                aliases: session.attached_aliases(),
            });
        }
        session.state = SessionState::Committing;
        let timeout = self.profile_for(session.artifact_size).commit();
        self.log.info(
            COMPONENT,
            "committing session",
            [
                ("session", session.id.as_str().into()),
                ("timeout_secs", timeout.as_secs().into()),
            ],
        );

        let result = self
            .toolkit
            .dismount(
                &session.working_copy_path,
                &session.mount_path,
                DismountMode::Commit,
                timeout,
            )
            .and_then(|()| atomic_replace(&session.working_copy_path, &session.artifact_path));

        if let Err(err) = result {
            session.state = SessionState::Failed;
            self.log.error(
                COMPONENT,
                "commit failed; working area preserved",
                [
                    ("session", session.id.as_str().into()),
                    ("work_dir", session.work_dir.display().to_string().into()),
                    ("kind", err.kind().as_str().into()),
                    ("error", err.to_string().into()),
                ],
            );
            session.release_lock();
            return Err(err);
        }

        session.state = SessionState::Committed;
        self.remove_work_dir(session);
        session.release_lock();
        self.log.info(
            COMPONENT,
            "session committed",
            [("session", session.id.as_str().into())],
        );
        Ok(())
    }

    fn discard(&self, session: &mut MountSession) {
        let timeout = self.profile_for(session.artifact_size).commit();
        if let Err(err) = self.toolkit.dismount(
            &session.working_copy_path,
            &session.mount_path,
            DismountMode::Discard,
            timeout,
        ) {
            self.log.warn(
                COMPONENT,
                "discard dismount failed",
                [
                    ("session", session.id.as_str().into()),
                    ("error", err.to_string().into()),
                ],
            );
        }
        self.remove_work_dir(session);
        session.state = SessionState::Discarded;
        session.release_lock();
        self.log.info(
            COMPONENT,
            "session discarded",
            [("session", session.id.as_str().into())],
        );
    }

    fn remove_work_dir(&self, session: &MountSession) {
        if let Err(err) = fs::remove_dir_all(&session.work_dir) {
            self.log.warn(
                COMPONENT,
                "failed to remove working area",
                [
                    ("session", session.id.as_str().into()),
                    ("work_dir", session.work_dir.display().to_string().into()),
                    ("error", err.to_string().into()),
                ],
            );
        }
    }
}
