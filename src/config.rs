//! Build configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is a valid
//! configuration.
//!
//! ```toml
//! work_root = "/var/tmp/image-builder"
//!
//! [timeouts.large]
//! commit_secs = 10800
//!
//! [unload_retry]
//! max_attempts = 5
//! base_backoff_ms = 500
//!
//! [toolkit]
//! kind = "command"
//! mount = ["imgtool", "mount", "{image}", "--index", "{index}", "{mount}"]
//! commit = ["imgtool", "unmount", "{mount}", "--commit"]
//! discard = ["imgtool", "unmount", "{mount}", "--discard"]
//! optimize = ["imgtool", "export", "{path}", "{options}"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::installer::{IntegrityPolicy, RepositoryCommands};
use crate::retry::RetryPolicy;
use crate::toolkit::ToolkitCommands;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Root for session working areas, locks, checkpoints and logs.
    pub work_root: PathBuf,
    pub checkpoint_dir: Option<PathBuf>,
    pub diagnostics_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
    /// Free space required on the work root, as a multiple of artifact size.
    pub space_factor: f64,
    pub timeouts: TimeoutProfiles,
    pub mount_retry: FixedRetry,
    pub step_retry: FixedRetry,
    pub unload_retry: UnloadRetry,
    pub installer: InstallerSettings,
    pub diagnostics: DiagnosticsSettings,
    pub toolkit: ToolkitConfig,
    pub repository: Option<RepositoryCommands>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            checkpoint_dir: None,
            diagnostics_root: None,
            log_dir: None,
            lock_dir: None,
            space_factor: 2.5,
            timeouts: TimeoutProfiles::default(),
            mount_retry: FixedRetry {
                retries: 2,
                delay_ms: 5_000,
            },
            step_retry: FixedRetry {
                retries: 1,
                delay_ms: 1_000,
            },
            unload_retry: UnloadRetry::default(),
            installer: InstallerSettings::default(),
            diagnostics: DiagnosticsSettings::default(),
            toolkit: ToolkitConfig::default(),
            repository: None,
        }
    }
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("parsing build config '{}'", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: BuildConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `work_root`, used by tests and embedders.
    pub fn with_work_root(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.space_factor.is_finite() && self.space_factor >= 1.0) {
            anyhow::bail!("space_factor must be >= 1.0, got {}", self.space_factor);
        }
        if self.installer.throttle == 0 {
            anyhow::bail!("installer.throttle must be at least 1");
        }
        if self.unload_retry.max_attempts == 0 {
            anyhow::bail!("unload_retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.work_root.join("checkpoints"))
    }

    pub fn diagnostics_root(&self) -> PathBuf {
        self.diagnostics_root
            .clone()
            .unwrap_or_else(|| self.work_root.join("diagnostics"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.work_root.join("logs"))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.work_root.join("locks"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.work_root.join("sessions")
    }
}

fn default_work_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("image-builder")
}

/// Timeouts selected by artifact size class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutProfiles {
    /// Artifacts at least this large use the `large` profile.
    pub large_artifact_bytes: u64,
    pub small: TimeoutProfile,
    pub large: TimeoutProfile,
}

impl Default for TimeoutProfiles {
    fn default() -> Self {
        Self {
            large_artifact_bytes: 8 * GIB,
            small: TimeoutProfile {
                mount_secs: 600,
                commit_secs: 1_800,
                optimize_secs: 1_800,
                package_secs: 1_800,
                install_secs: 600,
            },
            large: TimeoutProfile {
                mount_secs: 1_800,
                commit_secs: 7_200,
                optimize_secs: 7_200,
                package_secs: 7_200,
                install_secs: 600,
            },
        }
    }
}

impl TimeoutProfiles {
    pub fn for_artifact_size(&self, size_bytes: u64) -> &TimeoutProfile {
        if size_bytes >= self.large_artifact_bytes {
            &self.large
        } else {
            &self.small
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutProfile {
    pub mount_secs: u64,
    pub commit_secs: u64,
    pub optimize_secs: u64,
    pub package_secs: u64,
    pub install_secs: u64,
}

impl TimeoutProfile {
    pub fn mount(&self) -> Duration {
        Duration::from_secs(self.mount_secs)
    }

    pub fn commit(&self) -> Duration {
        Duration::from_secs(self.commit_secs)
    }

    pub fn optimize(&self) -> Duration {
        Duration::from_secs(self.optimize_secs)
    }

    pub fn package(&self) -> Duration {
        Duration::from_secs(self.package_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }
}

/// `retries` additional attempts after the first, `delay_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedRetry {
    pub retries: u32,
    pub delay_ms: u64,
}

impl FixedRetry {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retries + 1, Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnloadRetry {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    /// Pause after the forced finalization pass preceding each attempt.
    pub finalize_pause_ms: u64,
}

impl Default for UnloadRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 500,
            finalize_pause_ms: 100,
        }
    }
}

impl UnloadRetry {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_millis(self.base_backoff_ms))
    }

    pub fn finalize_pause(&self) -> Duration {
        Duration::from_millis(self.finalize_pause_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerSettings {
    pub throttle: usize,
    pub batch_timeout_secs: u64,
    pub integrity: IntegrityPolicy,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            throttle: 4,
            batch_timeout_secs: 1_800,
            integrity: IntegrityPolicy::Enforce,
        }
    }
}

impl InstallerSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

/// What a diagnostics bundle collects from the mounted tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsSettings {
    /// Mount-relative log files or directories.
    pub log_paths: Vec<String>,
    /// Mount-relative configuration files.
    pub config_paths: Vec<String>,
    pub store_exports: Vec<StoreExport>,
    pub max_file_bytes: u64,
    pub max_listing_entries: usize,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            log_paths: vec![
                "Windows/Logs/DISM".to_string(),
                "Windows/Logs/CBS".to_string(),
                "Windows/Panther".to_string(),
                "var/log".to_string(),
            ],
            config_paths: vec![
                "Windows/Panther/unattend.xml".to_string(),
                "Windows/System32/Sysprep/unattend.xml".to_string(),
                "etc/fstab".to_string(),
            ],
            store_exports: Vec::new(),
            max_file_bytes: 16 * 1024 * 1024,
            max_listing_entries: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreExport {
    pub alias: String,
    pub backing_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolkitConfig {
    /// Images are `tar.zst` archives handled in-process.
    #[default]
    Archive,
    /// Images are handled by an external tool described by argv templates.
    Command(ToolkitCommands),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = BuildConfig::from_toml_str("work_root = \"/tmp/ib\"").unwrap();
        assert_eq!(config.mount_retry.policy().max_attempts, 3);
        assert_eq!(config.unload_retry.max_attempts, 5);
        assert_eq!(config.installer.throttle, 4);
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/tmp/ib/checkpoints"));
        assert!(matches!(config.toolkit, ToolkitConfig::Archive));
    }

    #[test]
    fn profile_selected_by_size() {
        let profiles = TimeoutProfiles::default();
        assert_eq!(profiles.for_artifact_size(1024).commit_secs, 1_800);
        assert_eq!(profiles.for_artifact_size(9 * GIB).commit_secs, 7_200);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(BuildConfig::from_toml_str("no_such_field = 1").is_err());
    }

    #[test]
    fn zero_throttle_is_rejected() {
        assert!(BuildConfig::from_toml_str("[installer]\nthrottle = 0").is_err());
    }

    #[test]
    fn command_toolkit_parses() {
        let config = BuildConfig::from_toml_str(
            r#"
            [toolkit]
            kind = "command"
            mount = ["imgtool", "mount", "{image}", "{index}", "{mount}"]
            commit = ["imgtool", "unmount", "{mount}", "--commit"]
            discard = ["imgtool", "unmount", "{mount}", "--discard"]
            optimize = ["imgtool", "export", "{path}", "{options}"]
            busy_exit_codes = [5]
            "#,
        )
        .unwrap();
        match config.toolkit {
            ToolkitConfig::Command(commands) => {
                assert_eq!(commands.mount[0], "imgtool");
                assert_eq!(commands.busy_exit_codes, vec![5]);
            }
            ToolkitConfig::Archive => panic!("expected command toolkit"),
        }
    }
}
