//! Preflight checks run before any mutation.
//!
//! Validates the artifact, the host tools the configured toolkit and
//! repository shell out to, and the work root (writable, enough space).
//!
//! # Example
//!
//! ```rust
//! use image_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("tar") {
//!     println!("tar not installed");
//! }
//!
//! let tools = vec!["definitely_not_a_real_command_12345".to_string()];
//! assert!(check_required_tools(&tools).is_err());
//! ```

use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Check if a command exists on PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that every tool is resolvable on PATH.
pub fn check_required_tools(tools: &[String]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .map(String::as_str)
        .filter(|tool| !command_exists(tool))
        .collect();
    if !missing.is_empty() {
        return Err(BuildError::MissingPrerequisite(format!(
            "missing required host tools: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Returns the artifact size on success.
pub fn validate_artifact(path: &Path, image_index: u32) -> Result<u64> {
    if image_index == 0 {
        return Err(BuildError::Validation(
            "image index must be 1 or greater".to_string(),
        ));
    }
    let meta = fs::metadata(path).map_err(|err| {
        BuildError::Validation(format!("artifact '{}': {err}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(BuildError::Validation(format!(
            "artifact '{}' is not a regular file",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(BuildError::Validation(format!(
            "artifact '{}' is empty",
            path.display()
        )));
    }
    Ok(meta.len())
}

/// Creates the work root if needed and proves it writable with a probe file.
pub fn check_work_root_writable(work_root: &Path) -> Result<()> {
    let denied = |err: std::io::Error| {
        BuildError::PermissionDenied(format!(
            "work root '{}' is not writable: {err}",
            work_root.display()
        ))
    };
    fs::create_dir_all(work_root).map_err(denied)?;
    let probe = work_root.join(format!(".preflight-{}", std::process::id()));
    let result = fs::File::create(&probe).and_then(|mut f| f.write_all(b"ok"));
    let _ = fs::remove_file(&probe);
    result.map_err(denied)
}

/// Needs `artifact_size * factor` bytes free on the filesystem holding `work_root`.
pub fn check_free_space(work_root: &Path, artifact_size: u64, factor: f64) -> Result<u64> {
    let needed = (artifact_size as f64 * factor).ceil() as u64;
    let available = fs2::available_space(work_root)
        .map_err(|err| BuildError::io(format!("querying free space on '{}'", work_root.display()), err))?;
    if available < needed {
        return Err(BuildError::ResourceExhaustion {
            path: work_root.to_path_buf(),
            needed,
            available,
        });
    }
    Ok(available)
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub artifact: PathBuf,
    pub artifact_size: u64,
    pub tools_checked: Vec<String>,
    pub space_needed: u64,
    pub space_available: u64,
}

/// Runs every check in order, stopping at the first failure.
pub fn run_preflight(
    artifact: &Path,
    image_index: u32,
    tools: &[String],
    work_root: &Path,
    space_factor: f64,
) -> Result<PreflightReport> {
    let artifact_size = validate_artifact(artifact, image_index)?;
    check_required_tools(tools)?;
    check_work_root_writable(work_root)?;
    let space_available = check_free_space(work_root, artifact_size, space_factor)?;
    let report = PreflightReport {
        artifact: artifact.to_path_buf(),
        artifact_size,
        tools_checked: tools.to_vec(),
        space_needed: (artifact_size as f64 * space_factor).ceil() as u64,
        space_available,
    };
    tracing::info!(
        artifact = %artifact.display(),
        size = artifact_size,
        tools = tools.len(),
        "preflight passed"
    );
    Ok(report)
}
