//! Mutation steps applied to a mounted session.
//!
//! Steps are written declaratively in a build plan as [`StepSpec`] values
//! and turned into [`MutationStep`] objects with [`build_step`]. All targets
//! are mount-relative; host-side sources are absolute after plan loading.

use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config_store::{ConfigStorePatcher, ConfigValue};
use crate::error::{BuildError, IoContext, Result};
use crate::fsutil::copy_dir_recursive;
use crate::logging::LogContext;
use crate::session::MountSession;

pub struct StepContext<'a> {
    pub session: &'a mut MountSession,
    pub store: &'a mut ConfigStorePatcher,
    pub log: &'a LogContext,
}

pub trait MutationStep: Send + Sync {
    fn name(&self) -> &str;

    /// Re-applying an idempotent step after a partial attempt yields the
    /// same tree, so it may be retried on a busy report.
    fn idempotent(&self) -> bool;

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    InjectFile {
        source: PathBuf,
        dest: String,
        #[serde(default)]
        mode: Option<u32>,
    },
    InjectTree {
        source: PathBuf,
        dest: String,
    },
    WriteFile {
        dest: String,
        content: String,
        #[serde(default)]
        mode: Option<u32>,
    },
    RemovePath {
        path: String,
    },
    RewriteStartupScript {
        path: String,
        marker: String,
        lines: Vec<String>,
        #[serde(default = "default_comment")]
        comment: String,
    },
    ConfigSet {
        alias: String,
        backing_file: String,
        entries: Vec<ConfigEntry>,
    },
}

fn default_comment() -> String {
    "#".to_string()
}

impl StepSpec {
    /// Resolve host-side source paths against `base`.
    pub fn resolve_sources(&mut self, base: &Path) {
        match self {
            StepSpec::InjectFile { source, .. } | StepSpec::InjectTree { source, .. } => {
                if source.is_relative() {
                    *source = base.join(&*source);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    ExpandString,
    Numeric,
    Numeric64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryValue {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigEntry {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    pub value: EntryValue,
}

impl ConfigEntry {
    pub fn to_value(&self) -> Result<ConfigValue> {
        let invalid = |what: &str| {
            BuildError::Validation(format!("config entry '{}': {what}", self.key))
        };
        let number = || -> Result<u64> {
            match &self.value {
                EntryValue::Number(n) => Ok(*n),
                EntryValue::Text(s) => s
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| invalid("value is not a number")),
            }
        };
        let text = || match &self.value {
            EntryValue::Text(s) => s.clone(),
            EntryValue::Number(n) => n.to_string(),
        };
        Ok(match self.kind {
            ValueKind::String => ConfigValue::String(text()),
            ValueKind::ExpandString => ConfigValue::ExpandString(text()),
            ValueKind::Numeric => ConfigValue::Numeric(
                u32::try_from(number()?).map_err(|_| invalid("value does not fit in 32 bits"))?,
            ),
            ValueKind::Numeric64 => ConfigValue::Numeric64(number()?),
        })
    }
}

/// Build the executable step for `spec`. Config entries are validated here,
/// before anything is mounted.
pub fn build_step(spec: &StepSpec) -> Result<Box<dyn MutationStep>> {
    Ok(match spec {
        StepSpec::InjectFile { source, dest, mode } => Box::new(InjectFile {
            name: format!("inject_file {dest}"),
            source: source.clone(),
            dest: dest.clone(),
            mode: *mode,
        }),
        StepSpec::InjectTree { source, dest } => Box::new(InjectTree {
            name: format!("inject_tree {dest}"),
            source: source.clone(),
            dest: dest.clone(),
        }),
        StepSpec::WriteFile {
            dest,
            content,
            mode,
        } => Box::new(WriteFile {
            name: format!("write_file {dest}"),
            dest: dest.clone(),
            content: content.clone(),
            mode: *mode,
        }),
        StepSpec::RemovePath { path } => Box::new(RemovePath {
            name: format!("remove_path {path}"),
            path: path.clone(),
        }),
        StepSpec::RewriteStartupScript {
            path,
            marker,
            lines,
            comment,
        } => {
            if marker.trim().is_empty() {
                return Err(BuildError::Validation(format!(
                    "startup script '{path}' needs a non-empty marker"
                )));
            }
            Box::new(RewriteStartupScript {
                name: format!("rewrite_startup_script {path}"),
                path: path.clone(),
                marker: marker.clone(),
                lines: lines.clone(),
                comment: comment.clone(),
            })
        }
        StepSpec::ConfigSet {
            alias,
            backing_file,
            entries,
        } => {
            let values = entries
                .iter()
                .map(|e| Ok((e.key.clone(), e.to_value()?)))
                .collect::<Result<Vec<_>>>()?;
            Box::new(ConfigSet {
                name: format!("config_set {alias}"),
                alias: alias.clone(),
                backing_file: backing_file.clone(),
                values,
            })
        }
    })
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating '{}'", parent.display()))?;
    }
    Ok(())
}

/// A link at the destination is replaced, never written through.
fn unlink_if_symlink(path: &Path) -> Result<()> {
    if path.is_symlink() {
        fs::remove_file(path).io_context(|| format!("removing '{}'", path.display()))?;
    }
    Ok(())
}

fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .io_context(|| format!("setting mode {mode:o} on '{}'", path.display()))?;
    }
    Ok(())
}

pub struct InjectFile {
    name: String,
    source: PathBuf,
    dest: String,
    mode: Option<u32>,
}

impl MutationStep for InjectFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        if !self.source.is_file() {
            return Err(BuildError::Validation(format!(
                "source file not found: {}",
                self.source.display()
            )));
        }
        let dst = ctx.session.resolve(&self.dest)?;
        ensure_parent(&dst)?;
        unlink_if_symlink(&dst)?;
        fs::copy(&self.source, &dst).io_context(|| {
            format!("copying '{}' to '{}'", self.source.display(), dst.display())
        })?;
        set_mode(&dst, self.mode)
    }
}

pub struct InjectTree {
    name: String,
    source: PathBuf,
    dest: String,
}

impl MutationStep for InjectTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        if !self.source.is_dir() {
            return Err(BuildError::Validation(format!(
                "source directory not found: {}",
                self.source.display()
            )));
        }
        let dst = ctx.session.resolve(&self.dest)?;
        if dst.is_symlink() {
            return Err(BuildError::Validation(format!(
                "destination '{}' is a symbolic link",
                self.dest
            )));
        }
        copy_dir_recursive(&self.source, &dst)
    }
}

pub struct WriteFile {
    name: String,
    dest: String,
    content: String,
    mode: Option<u32>,
}

impl MutationStep for WriteFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let dst = ctx.session.resolve(&self.dest)?;
        ensure_parent(&dst)?;
        unlink_if_symlink(&dst)?;
        fs::write(&dst, &self.content).io_context(|| format!("writing '{}'", dst.display()))?;
        set_mode(&dst, self.mode)
    }
}

pub struct RemovePath {
    name: String,
    path: String,
}

impl MutationStep for RemovePath {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let target = ctx.session.resolve(&self.path)?;
        let md = match fs::symlink_metadata(&target) {
            Ok(md) => md,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(BuildError::io(format!("stat '{}'", target.display()), err)),
        };
        if md.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        }
        .io_context(|| format!("removing '{}'", target.display()))
    }
}

pub struct RewriteStartupScript {
    name: String,
    path: String,
    marker: String,
    lines: Vec<String>,
    comment: String,
}

impl RewriteStartupScript {
    /// Replace the marker block in `existing`, or append one.
    fn rewrite(&self, existing: &str) -> String {
        let eol = if existing.contains("\r\n") { "\r\n" } else { "\n" };
        let begin = format!("{} BEGIN {}", self.comment, self.marker);
        let end = format!("{} END {}", self.comment, self.marker);

        let mut block = vec![begin.clone()];
        block.extend(self.lines.iter().cloned());
        block.push(end.clone());

        let lines: Vec<&str> = existing.lines().collect();
        let start = lines.iter().position(|l| l.trim_end() == begin);
        let stop = start.and_then(|s| {
            lines[s..]
                .iter()
                .position(|l| l.trim_end() == end)
                .map(|offset| s + offset)
        });

        let mut out: Vec<String> = Vec::with_capacity(lines.len() + block.len());
        match (start, stop) {
            (Some(s), Some(e)) => {
                out.extend(lines[..s].iter().map(|l| l.to_string()));
                out.extend(block);
                out.extend(lines[e + 1..].iter().map(|l| l.to_string()));
            }
            _ => {
                out.extend(lines.iter().map(|l| l.to_string()));
                out.extend(block);
            }
        }
        let mut text = out.join(eol);
        text.push_str(eol);
        text
    }
}

impl MutationStep for RewriteStartupScript {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let script = ctx.session.resolve_file(&self.path)?;
        let existing = match fs::read_to_string(&script) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(BuildError::io(format!("reading '{}'", script.display()), err))
            }
        };
        ensure_parent(&script)?;
        fs::write(&script, self.rewrite(&existing))
            .io_context(|| format!("writing '{}'", script.display()))
    }
}

pub struct ConfigSet {
    name: String,
    alias: String,
    backing_file: String,
    values: Vec<(String, ConfigValue)>,
}

impl MutationStep for ConfigSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        ctx.store.load(ctx.session, &self.alias, &self.backing_file)?;

        let written = self
            .values
            .iter()
            .try_for_each(|(key, value)| ctx.store.set(&self.alias, key, value.clone()));

        // Unload even when a write failed; an unload failure is already fatal.
        let unloaded = ctx.store.unload(ctx.session, &self.alias);
        match (written, unloaded) {
            (Err(err), Err(unload_err)) => {
                ctx.log.error(
                    "steps",
                    "config store left loaded after failed write",
                    [
                        ("alias", self.alias.as_str().into()),
                        ("error", unload_err.to_string().into()),
                    ],
                );
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
            (Ok(()), Err(unload_err)) => Err(unload_err),
            (Ok(()), Ok(_)) => Ok(()),
        }
    }
}
