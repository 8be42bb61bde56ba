//! Offline config store patching.
//!
//! A config store is a hierarchical key-value file inside the mounted image
//! (a registry hive on Windows images). The [`ConfigStorePatcher`] owns every
//! live handle for the process: one per alias, loaded and unloaded 1:1, and
//! attached to the session whose mount tree holds the backing file so the
//! session cannot commit while a handle is outstanding.

mod hive;

pub use hive::HiveFileBackend;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::UnloadRetry;
use crate::error::{BuildError, IoContext, Result};
use crate::logging::LogContext;
use crate::retry::{retry_with_backoff, Sleeper};
use crate::session::{MountSession, SessionState};
use crate::timestamp::now_utc_rfc3339;

const COMPONENT: &str = "config_store";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ConfigValue {
    String(String),
    ExpandString(String),
    Numeric(u32),
    Numeric64(u64),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::String(s) => write!(f, "String:{s}"),
            ConfigValue::ExpandString(s) => write!(f, "ExpandString:{s}"),
            ConfigValue::Numeric(n) => write!(f, "Numeric:{n}"),
            ConfigValue::Numeric64(n) => write!(f, "Numeric64:{n}"),
        }
    }
}

/// Storage behind the patcher. Implementations may report
/// [`BuildError::Busy`] from any call while the store is held elsewhere.
pub trait ConfigStoreBackend: Send {
    fn load(&mut self, alias: &str, backing_file: &Path) -> Result<()>;
    fn get(&self, alias: &str, key: &str) -> Result<Option<ConfigValue>>;
    fn set(&mut self, alias: &str, key: &str, value: ConfigValue) -> Result<()>;
    fn export(&self, alias: &str, dest: &Path) -> Result<()>;
    fn unload(&mut self, alias: &str) -> Result<()>;
    /// Force pending writes out and drop cached references so that a
    /// following unload can succeed. Returns the aliases whose writes failed.
    fn finalize(&mut self) -> Vec<(String, BuildError)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandleState {
    Unloaded,
    Loaded,
    UnloadPending,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigStoreHandle {
    pub alias: String,
    pub backing_file: PathBuf,
    pub state: HandleState,
    pub loaded_at: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnloadReport {
    pub attempts: u32,
    pub backoffs: Vec<Duration>,
}

pub struct ConfigStorePatcher {
    backend: Box<dyn ConfigStoreBackend>,
    handles: BTreeMap<String, ConfigStoreHandle>,
    policy: UnloadRetry,
    sleeper: Arc<dyn Sleeper>,
    log: LogContext,
}

impl ConfigStorePatcher {
    pub fn new(
        backend: Box<dyn ConfigStoreBackend>,
        policy: UnloadRetry,
        sleeper: Arc<dyn Sleeper>,
        log: LogContext,
    ) -> Self {
        Self {
            backend,
            handles: BTreeMap::new(),
            policy,
            sleeper,
            log,
        }
    }

    pub fn handle(&self, alias: &str) -> Option<&ConfigStoreHandle> {
        self.handles.get(alias)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConfigStoreHandle> {
        self.handles.values()
    }

    /// Load the store at `backing_rel` (relative to the mount root) as `alias`.
    pub fn load(&mut self, session: &mut MountSession, alias: &str, backing_rel: &str) -> Result<()> {
        if !matches!(session.state(), SessionState::Mounted | SessionState::Modified) {
            return Err(BuildError::invalid_state("Mounted or Modified", session.state()));
        }
        self.load_unchecked(session, alias, backing_rel)
    }

    fn load_unchecked(
        &mut self,
        session: &mut MountSession,
        alias: &str,
        backing_rel: &str,
    ) -> Result<()> {
        if self.handles.contains_key(alias) {
            return Err(BuildError::AlreadyLoaded(alias.to_string()));
        }
        let backing_file = session.resolve_file(backing_rel)?;
        if !backing_file.is_file() {
            return Err(BuildError::Validation(format!(
                "config store backing file '{backing_rel}' does not exist in the mounted image"
            )));
        }

        self.backend.load(alias, &backing_file)?;
        self.handles.insert(
            alias.to_string(),
            ConfigStoreHandle {
                alias: alias.to_string(),
                backing_file: backing_file.clone(),
                state: HandleState::Loaded,
                loaded_at: now_utc_rfc3339(),
                session_id: session.id().to_string(),
            },
        );
        session.attach_alias(alias);
        self.log.info(
            COMPONENT,
            "config store loaded",
            [
                ("alias", alias.into()),
                ("backing_file", backing_file.display().to_string().into()),
            ],
        );
        Ok(())
    }

    pub fn set(&mut self, alias: &str, key: &str, value: ConfigValue) -> Result<()> {
        self.require_loaded(alias)?;
        self.log.debug(
            COMPONENT,
            "config store set",
            [
                ("alias", alias.into()),
                ("key", key.into()),
                ("value", value.to_string().into()),
            ],
        );
        self.backend.set(alias, key, value)
    }

    pub fn get(&self, alias: &str, key: &str) -> Result<Option<ConfigValue>> {
        self.require_loaded(alias)?;
        self.backend.get(alias, key)
    }

    pub fn export(&self, alias: &str, dest: &Path) -> Result<()> {
        self.require_loaded(alias)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating '{}'", parent.display()))?;
        }
        self.backend.export(alias, dest)
    }

    /// Unload `alias`, forcing a finalization pass and a short pause before
    /// every attempt and backing off linearly between attempts.
    ///
    /// Exhaustion is fatal and leaves the handle `UnloadPending`, which keeps
    /// the owning session from committing.
    pub fn unload(&mut self, session: &mut MountSession, alias: &str) -> Result<UnloadReport> {
        let handle = self
            .handles
            .get_mut(alias)
            .ok_or_else(|| BuildError::NotLoaded(alias.to_string()))?;
        if handle.session_id != session.id() {
            return Err(BuildError::invalid_state(
                format!("handle owned by session {}", session.id()),
                format!("session {}", handle.session_id),
            ));
        }
        handle.state = HandleState::UnloadPending;

        let policy = self.policy.policy();
        let pause = self.policy.finalize_pause();
        let sleeper = Arc::clone(&self.sleeper);
        let backend = &mut self.backend;
        let log = self.log.clone();

        let outcome = retry_with_backoff(
            &policy,
            sleeper.as_ref(),
            |_attempt| {
                for (failed, err) in backend.finalize() {
                    log.warn(
                        COMPONENT,
                        "config store finalization failed",
                        [("alias", failed.into()), ("error", err.to_string().into())],
                    );
                }
                sleeper.sleep(pause);
                backend.unload(alias)
            },
            |attempt, err, delay| {
                log.warn(
                    COMPONENT,
                    "config store unload failed, retrying",
                    [
                        ("alias", alias.into()),
                        ("attempt", attempt.into()),
                        ("backoff_ms", (delay.as_millis() as u64).into()),
                        ("error", err.to_string().into()),
                    ],
                );
            },
        );

        match outcome {
            Ok(done) => {
                self.handles.remove(alias);
                session.detach_alias(alias);
                self.log.info(
                    COMPONENT,
                    "config store unloaded",
                    [("alias", alias.into()), ("attempts", done.attempts.into())],
                );
                Ok(UnloadReport {
                    attempts: done.attempts,
                    backoffs: done.backoffs,
                })
            }
            Err(exhausted) => {
                self.log.error(
                    COMPONENT,
                    "config store unload exhausted",
                    [
                        ("alias", alias.into()),
                        ("attempts", exhausted.attempts.into()),
                        ("error", exhausted.last.to_string().into()),
                    ],
                );
                Err(exhausted.last.fatal())
            }
        }
    }

    /// Unload every handle attached to `session`, logging failures.
    /// Returns the aliases that could not be unloaded.
    ///
    /// Handles left `UnloadPending` by an exhausted unload are not retried
    /// again and are reported as stuck.
    pub fn unload_all_best_effort(&mut self, session: &mut MountSession) -> Vec<String> {
        let mut stuck = Vec::new();
        let mut aliases = Vec::new();
        for handle in self.handles.values().filter(|h| h.session_id == session.id()) {
            if handle.state == HandleState::UnloadPending {
                stuck.push(handle.alias.clone());
            } else {
                aliases.push(handle.alias.clone());
            }
        }
        if !stuck.is_empty() {
            self.log.warn(
                COMPONENT,
                "skipping handles whose unload already exhausted",
                [("aliases", stuck.join(",").into())],
            );
        }
        for alias in aliases {
            if let Err(err) = self.unload(session, &alias) {
                self.log.warn(
                    COMPONENT,
                    "best-effort unload failed",
                    [("alias", alias.as_str().into()), ("error", err.to_string().into())],
                );
                stuck.push(alias);
            }
        }
        stuck
    }

    /// Load, export and unload under the usual unload discipline. An alias
    /// that is already loaded is exported as is and left loaded.
    ///
    /// Besides live sessions this also reads from a session whose commit
    /// failed, as long as its mounted tree is still there.
    pub fn export_with_retry(
        &mut self,
        session: &mut MountSession,
        alias: &str,
        backing_rel: &str,
        dest: &Path,
    ) -> Result<()> {
        if self.handles.contains_key(alias) {
            return self.export(alias, dest);
        }
        let readable = match session.state() {
            SessionState::Mounted | SessionState::Modified => true,
            SessionState::Failed => session.mount_path().is_dir(),
            _ => false,
        };
        if !readable {
            return Err(BuildError::invalid_state(
                "Mounted, Modified or Failed with its tree",
                session.state(),
            ));
        }
        self.load_unchecked(session, alias, backing_rel)?;
        let exported = self.export(alias, dest);
        let unloaded = self.unload(session, alias);
        exported?;
        unloaded.map(|_| ())
    }

    fn require_loaded(&self, alias: &str) -> Result<()> {
        match self.handles.get(alias) {
            Some(handle) if handle.state == HandleState::Loaded => Ok(()),
            _ => Err(BuildError::NotLoaded(alias.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogContext;
    use crate::retry::RecordingSleeper;
    use crate::session::MountSession;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Wraps the hive backend and reports busy for the first `busy_unloads`
    /// unload calls.
    struct StickyBackend {
        inner: HiveFileBackend,
        busy_unloads: u32,
        unload_calls: Arc<AtomicU32>,
        finalize_calls: Arc<AtomicU32>,
        fail_finalize: bool,
    }

    impl ConfigStoreBackend for StickyBackend {
        fn load(&mut self, alias: &str, backing_file: &Path) -> Result<()> {
            self.inner.load(alias, backing_file)
        }
        fn get(&self, alias: &str, key: &str) -> Result<Option<ConfigValue>> {
            self.inner.get(alias, key)
        }
        fn set(&mut self, alias: &str, key: &str, value: ConfigValue) -> Result<()> {
            self.inner.set(alias, key, value)
        }
        fn export(&self, alias: &str, dest: &Path) -> Result<()> {
            self.inner.export(alias, dest)
        }
        fn unload(&mut self, alias: &str) -> Result<()> {
            let call = self.unload_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.busy_unloads {
                return Err(BuildError::Busy(format!("{alias} has open keys")));
            }
            self.inner.unload(alias)
        }
        fn finalize(&mut self) -> Vec<(String, BuildError)> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            let mut failed = self.inner.finalize();
            if self.fail_finalize {
                failed.push(("OFFLINE".to_string(), BuildError::Busy("hive in use".into())));
            }
            failed
        }
    }

    struct Fixture {
        _tmp: TempDir,
        session: MountSession,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mount = tmp.path().join("mount");
        fs::create_dir_all(mount.join("Windows/System32/config")).unwrap();
        HiveFileBackend::create_file(
            &mount.join("Windows/System32/config/SOFTWARE"),
            &BTreeMap::new(),
        )
        .unwrap();
        let session = MountSession::detached_for_tests(tmp.path(), &mount);
        Fixture { _tmp: tmp, session }
    }

    fn patcher(busy_unloads: u32, sleeper: Arc<RecordingSleeper>) -> (ConfigStorePatcher, Arc<AtomicU32>, Arc<AtomicU32>) {
        let unload_calls = Arc::new(AtomicU32::new(0));
        let finalize_calls = Arc::new(AtomicU32::new(0));
        let backend = StickyBackend {
            inner: HiveFileBackend::new(),
            busy_unloads,
            unload_calls: Arc::clone(&unload_calls),
            finalize_calls: Arc::clone(&finalize_calls),
            fail_finalize: false,
        };
        let (log, _sink) = LogContext::in_memory();
        let patcher = ConfigStorePatcher::new(
            Box::new(backend),
            UnloadRetry::default(),
            sleeper,
            log,
        );
        (patcher, unload_calls, finalize_calls)
    }

    const HIVE: &str = "Windows/System32/config/SOFTWARE";

    #[test]
    fn unload_without_load_is_not_loaded() {
        let mut fx = fixture();
        let (mut patcher, _, _) = patcher(0, Arc::new(RecordingSleeper::new()));
        let err = patcher.unload(&mut fx.session, "OFFLINE").unwrap_err();
        assert!(matches!(err, BuildError::NotLoaded(_)));
    }

    #[test]
    fn double_load_is_already_loaded() {
        let mut fx = fixture();
        let (mut patcher, _, _) = patcher(0, Arc::new(RecordingSleeper::new()));
        patcher.load(&mut fx.session, "OFFLINE", HIVE).unwrap();
        let err = patcher.load(&mut fx.session, "OFFLINE", HIVE).unwrap_err();
        assert!(matches!(err, BuildError::AlreadyLoaded(_)));
        assert_eq!(fx.session.attached_aliases(), vec!["OFFLINE".to_string()]);
    }

    #[test]
    fn set_then_get_and_unload_persists() {
        let mut fx = fixture();
        let (mut patcher, _, _) = patcher(0, Arc::new(RecordingSleeper::new()));
        patcher.load(&mut fx.session, "OFFLINE", HIVE).unwrap();
        patcher
            .set(
                "OFFLINE",
                "Policies\\System\\EnableLUA",
                ConfigValue::Numeric(0),
            )
            .unwrap();
        assert_eq!(
            patcher.get("OFFLINE", "Policies\\System\\EnableLUA").unwrap(),
            Some(ConfigValue::Numeric(0))
        );
        let report = patcher.unload(&mut fx.session, "OFFLINE").unwrap();
        assert_eq!(report.attempts, 1);
        assert!(fx.session.attached_aliases().is_empty());

        let stored = HiveFileBackend::read_file(&fx.session.resolve(HIVE).unwrap()).unwrap();
        assert_eq!(
            stored.get("Policies\\System\\EnableLUA"),
            Some(&ConfigValue::Numeric(0))
        );
    }

    #[test]
    fn unload_retries_k_times_with_growing_backoff() {
        let mut fx = fixture();
        let sleeper = Arc::new(RecordingSleeper::new());
        let (mut patcher, unload_calls, finalize_calls) = patcher(4, Arc::clone(&sleeper));
        patcher.load(&mut fx.session, "OFFLINE", HIVE).unwrap();

        let report = patcher.unload(&mut fx.session, "OFFLINE").unwrap();
        assert_eq!(report.attempts, 5);
        assert_eq!(unload_calls.load(Ordering::SeqCst), 5);
        assert_eq!(finalize_calls.load(Ordering::SeqCst), 5);
        assert!(report.backoffs.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(report.backoffs.len(), 4);
        assert_eq!(report.backoffs[0], Duration::from_millis(500));
        assert_eq!(report.backoffs[3], Duration::from_millis(2000));
        // Finalization pauses and backoffs both go through the sleeper.
        assert_eq!(sleeper.recorded().len(), 5 + 4);
    }

    #[test]
    fn unload_exhaustion_is_fatal_and_keeps_handle_pending() {
        let mut fx = fixture();
        let (mut patcher, _, _) = patcher(u32::MAX, Arc::new(RecordingSleeper::new()));
        patcher.load(&mut fx.session, "OFFLINE", HIVE).unwrap();

        let err = patcher.unload(&mut fx.session, "OFFLINE").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            patcher.handle("OFFLINE").map(|h| h.state),
            Some(HandleState::UnloadPending)
        );
        assert_eq!(fx.session.attached_aliases(), vec!["OFFLINE".to_string()]);
        assert!(matches!(
            patcher.set("OFFLINE", "a", ConfigValue::Numeric(1)),
            Err(BuildError::NotLoaded(_))
        ));
    }

    #[test]
    fn best_effort_unload_skips_handles_already_exhausted() {
        let mut fx = fixture();
        let sleeper = Arc::new(RecordingSleeper::new());
        let (mut patcher, unload_calls, _) = patcher(u32::MAX, Arc::clone(&sleeper));
        patcher.load(&mut fx.session, "OFFLINE", HIVE).unwrap();
        assert!(patcher.unload(&mut fx.session, "OFFLINE").is_err());
        let calls = unload_calls.load(Ordering::SeqCst);
        let sleeps = sleeper.recorded().len();

        let stuck = patcher.unload_all_best_effort(&mut fx.session);
        assert_eq!(stuck, vec!["OFFLINE".to_string()]);
        assert_eq!(unload_calls.load(Ordering::SeqCst), calls);
        assert_eq!(sleeper.recorded().len(), sleeps);
    }

    #[test]
    fn finalization_failures_reach_the_build_log() {
        let mut fx = fixture();
        let (log, sink) = LogContext::in_memory();
        let backend = StickyBackend {
            inner: HiveFileBackend::new(),
            busy_unloads: 0,
            unload_calls: Arc::new(AtomicU32::new(0)),
            finalize_calls: Arc::new(AtomicU32::new(0)),
            fail_finalize: true,
        };
        let mut patcher = ConfigStorePatcher::new(
            Box::new(backend),
            UnloadRetry::default(),
            Arc::new(RecordingSleeper::new()),
            log.clone(),
        );
        patcher.load(&mut fx.session, "OFFLINE", HIVE).unwrap();
        patcher.unload(&mut fx.session, "OFFLINE").unwrap();
        log.flush().unwrap();

        let events = sink.events();
        let event = events
            .iter()
            .find(|e| e.message == "config store finalization failed")
            .expect("finalization event");
        assert_eq!(event.component, COMPONENT);
        assert_eq!(event.fields["alias"], serde_json::Value::from("OFFLINE"));
    }

    #[test]
    fn export_reads_a_failed_session_with_its_tree() {
        let mut fx = fixture();
        let (mut patcher, _, _) = patcher(0, Arc::new(RecordingSleeper::new()));
        fx.session.set_state_for_tests(SessionState::Failed);
        let dest = fx.session.work_dir().join("export/OFFLINE.json");
        patcher
            .export_with_retry(&mut fx.session, "OFFLINE", HIVE, &dest)
            .unwrap();
        assert!(dest.is_file());
        assert!(patcher.handle("OFFLINE").is_none());
        assert!(fx.session.attached_aliases().is_empty());

        fx.session.set_state_for_tests(SessionState::Discarded);
        let err = patcher
            .export_with_retry(&mut fx.session, "OFFLINE", HIVE, &dest)
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidState { .. }));
    }

    #[test]
    fn load_requires_existing_backing_file() {
        let mut fx = fixture();
        let (mut patcher, _, _) = patcher(0, Arc::new(RecordingSleeper::new()));
        let err = patcher
            .load(&mut fx.session, "OFFLINE", "Windows/System32/config/SYSTEM")
            .unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
        let err = patcher
            .load(&mut fx.session, "OFFLINE", "../outside")
            .unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }

    #[test]
    fn export_with_retry_leaves_nothing_loaded() {
        let mut fx = fixture();
        let (mut patcher, _, _) = patcher(1, Arc::new(RecordingSleeper::new()));
        let dest = fx.session.work_dir().join("export/SOFTWARE.json");
        patcher
            .export_with_retry(&mut fx.session, "DIAG", HIVE, &dest)
            .unwrap();
        assert!(dest.is_file());
        assert!(patcher.handle("DIAG").is_none());
        assert!(fx.session.attached_aliases().is_empty());
    }
}
