//! Parallel dependency installation.
//!
//! Each [`DependencySpec`] is resolved against a [`DependencyRepository`] on
//! a bounded worker pool. Per-item failures are recorded and never retried;
//! items still running or queued at the batch deadline come back
//! [`ResolvedState::Incomplete`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BuildError, Result};
use crate::fsutil::sha256_file;
use crate::logging::LogContext;
use crate::pool::{run_bounded, WorkFn, WorkerContext};
use crate::process::{ExternalCommand, OperationRunner};

const COMPONENT: &str = "installer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySpec {
    pub name: String,
    /// Exact version wanted; any installed version satisfies `None`.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub optional: bool,
    /// Expected sha256 of the installed payload.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl DependencySpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            optional: false,
            sha256: None,
        }
    }
}

/// Validated dependency list: names are non-empty and unique, digests are
/// 64 hex characters (stored lowercase).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    specs: Vec<DependencySpec>,
}

impl DependencySet {
    pub fn new(specs: Vec<DependencySpec>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut validated = Vec::with_capacity(specs.len());
        for mut spec in specs {
            let name = spec.name.trim();
            if name.is_empty() {
                return Err(BuildError::Validation("dependency with empty name".to_string()));
            }
            if !seen.insert(name.to_string()) {
                return Err(BuildError::Validation(format!(
                    "dependency '{name}' is listed more than once"
                )));
            }
            spec.name = name.to_string();
            if let Some(digest) = &spec.sha256 {
                let digest = digest.trim().to_ascii_lowercase();
                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(BuildError::Validation(format!(
                        "dependency '{}' has a malformed sha256 '{digest}'",
                        spec.name
                    )));
                }
                spec.sha256 = Some(digest);
            }
            if matches!(spec.version.as_deref(), Some(v) if v.trim().is_empty()) {
                spec.version = None;
            }
            validated.push(spec);
        }
        Ok(Self { specs: validated })
    }

    pub fn specs(&self) -> &[DependencySpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityPolicy {
    /// A digest mismatch fails the item.
    #[default]
    Enforce,
    /// A digest mismatch is reported but the item keeps its state.
    WarnOnly,
    /// Digests are not checked.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolvedState {
    AlreadyPresent,
    Installed,
    Updated,
    Failed,
    Incomplete,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyOutcome {
    pub name: String,
    pub state: ResolvedState,
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    /// One outcome per requested dependency, in input order.
    pub outcomes: Vec<DependencyOutcome>,
}

impl InstallReport {
    pub fn count(&self, state: ResolvedState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    /// Required dependencies that did not end up present.
    pub fn required_failures(&self) -> Vec<&DependencyOutcome> {
        self.outcomes
            .iter()
            .filter(|o| {
                !o.optional && matches!(o.state, ResolvedState::Failed | ResolvedState::Incomplete)
            })
            .collect()
    }
}

/// What the repository reports after an install or update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallResult {
    pub version: Option<String>,
    /// Installed payload, checked against [`DependencySpec::sha256`].
    pub payload: Option<PathBuf>,
}

pub trait DependencyRepository: Send + Sync {
    /// `None` when the dependency is not installed.
    fn installed_version(&self, name: &str, ctx: &WorkerContext) -> Result<Option<String>>;
    fn install(&self, spec: &DependencySpec, ctx: &WorkerContext) -> Result<InstallResult>;
    fn update(&self, spec: &DependencySpec, ctx: &WorkerContext) -> Result<InstallResult>;

    /// Host programs this repository runs.
    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Used when no repository is configured; every lookup fails.
#[derive(Debug, Default)]
pub struct NoRepository;

impl DependencyRepository for NoRepository {
    fn installed_version(&self, name: &str, _ctx: &WorkerContext) -> Result<Option<String>> {
        Err(BuildError::MissingPrerequisite(format!(
            "no dependency repository configured to resolve '{name}'"
        )))
    }

    fn install(&self, spec: &DependencySpec, ctx: &WorkerContext) -> Result<InstallResult> {
        self.installed_version(&spec.name, ctx).map(|_| InstallResult::default())
    }

    fn update(&self, spec: &DependencySpec, ctx: &WorkerContext) -> Result<InstallResult> {
        self.install(spec, ctx)
    }
}

/// Argv templates for a package manager. `{name}` and `{version}` are
/// substituted; `{version}` is empty when no version is pinned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryCommands {
    /// Prints the installed version and exits 0, or exits with one of
    /// `not_installed_exit_codes`.
    pub query: Vec<String>,
    pub install: Vec<String>,
    /// Falls back to `install` when empty.
    pub update: Vec<String>,
    /// Prints the path of the installed payload.
    pub payload: Vec<String>,
    pub not_installed_exit_codes: Vec<i32>,
}

impl Default for RepositoryCommands {
    fn default() -> Self {
        Self {
            query: Vec::new(),
            install: Vec::new(),
            update: Vec::new(),
            payload: Vec::new(),
            not_installed_exit_codes: vec![1],
        }
    }
}

impl RepositoryCommands {
    pub fn required_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = [&self.query, &self.install, &self.update, &self.payload]
            .into_iter()
            .filter_map(|t| t.first().cloned())
            .collect();
        tools.sort();
        tools.dedup();
        tools
    }
}

pub struct CommandRepository {
    runner: Arc<dyn OperationRunner>,
    commands: RepositoryCommands,
    item_timeout: Duration,
}

impl CommandRepository {
    pub fn new(
        runner: Arc<dyn OperationRunner>,
        commands: RepositoryCommands,
        item_timeout: Duration,
    ) -> Result<Self> {
        if commands.query.is_empty() || commands.install.is_empty() {
            return Err(BuildError::Validation(
                "repository needs both 'query' and 'install' commands".to_string(),
            ));
        }
        Ok(Self {
            runner,
            commands,
            item_timeout,
        })
    }

    fn render(template: &[String], name: &str, version: Option<&str>) -> Result<ExternalCommand> {
        let argv: Vec<String> = template
            .iter()
            .map(|arg| {
                arg.replace("{name}", name)
                    .replace("{version}", version.unwrap_or(""))
            })
            .collect();
        ExternalCommand::from_argv(&argv)
    }

    /// The per-item timeout, cut short by the batch deadline.
    fn timeout(&self, operation: &str, ctx: &WorkerContext) -> Result<Duration> {
        let remaining = ctx.remaining();
        if ctx.should_stop() || remaining.is_zero() {
            return Err(BuildError::Timeout {
                operation: format!("dependency {operation}"),
                timeout: Duration::ZERO,
            });
        }
        Ok(self.item_timeout.min(remaining))
    }

    fn run_install(
        &self,
        template: &[String],
        spec: &DependencySpec,
        ctx: &WorkerContext,
    ) -> Result<InstallResult> {
        let command = Self::render(template, &spec.name, spec.version.as_deref())?;
        self.runner.run_checked(&command, self.timeout("install", ctx)?)?;

        let payload = if self.commands.payload.is_empty() {
            None
        } else {
            let command = Self::render(&self.commands.payload, &spec.name, spec.version.as_deref())?;
            let out = self.runner.run_checked(&command, self.timeout("payload", ctx)?)?;
            let path = out.stdout.trim();
            (!path.is_empty()).then(|| PathBuf::from(path))
        };
        Ok(InstallResult {
            version: spec.version.clone(),
            payload,
        })
    }
}

impl DependencyRepository for CommandRepository {
    fn required_tools(&self) -> Vec<String> {
        self.commands.required_tools()
    }

    fn installed_version(&self, name: &str, ctx: &WorkerContext) -> Result<Option<String>> {
        let command = Self::render(&self.commands.query, name, None)?;
        let timeout = self.timeout("query", ctx)?;
        let out = self.runner.run(&command, timeout)?;
        if out.timed_out {
            return Err(BuildError::Timeout {
                operation: format!("dependency query '{name}'"),
                timeout,
            });
        }
        match out.exit_code {
            Some(0) => Ok(Some(out.stdout.trim().to_string())),
            Some(code) if self.commands.not_installed_exit_codes.contains(&code) => Ok(None),
            code => Err(BuildError::External {
                program: command.program,
                code,
                stderr: out.stderr.trim().to_string(),
            }),
        }
    }

    fn install(&self, spec: &DependencySpec, ctx: &WorkerContext) -> Result<InstallResult> {
        self.run_install(&self.commands.install, spec, ctx)
    }

    fn update(&self, spec: &DependencySpec, ctx: &WorkerContext) -> Result<InstallResult> {
        if self.commands.update.is_empty() {
            self.run_install(&self.commands.install, spec, ctx)
        } else {
            self.run_install(&self.commands.update, spec, ctx)
        }
    }
}

pub struct DependencyInstaller {
    repository: Arc<dyn DependencyRepository>,
    throttle: usize,
    batch_timeout: Duration,
    integrity: IntegrityPolicy,
    log: LogContext,
}

impl DependencyInstaller {
    pub fn new(
        repository: Arc<dyn DependencyRepository>,
        throttle: usize,
        batch_timeout: Duration,
        integrity: IntegrityPolicy,
        log: LogContext,
    ) -> Self {
        Self {
            repository,
            throttle: throttle.max(1),
            batch_timeout,
            integrity,
            log,
        }
    }

    pub fn install_all(&self, set: &DependencySet) -> InstallReport {
        let specs = set.specs().to_vec();
        let names: Vec<(String, bool)> = specs.iter().map(|s| (s.name.clone(), s.optional)).collect();

        let repository = Arc::clone(&self.repository);
        let integrity = self.integrity;
        let log = self.log.clone();
        let work: WorkFn<DependencySpec, DependencyOutcome> =
            Arc::new(move |_, spec, ctx| resolve_one(repository.as_ref(), &spec, integrity, ctx, &log));

        let start = Instant::now();
        let results = run_bounded(specs, self.throttle, self.batch_timeout, work);
        let outcomes: Vec<DependencyOutcome> = results
            .into_iter()
            .zip(names)
            .map(|(result, (name, optional))| {
                result.unwrap_or_else(|| DependencyOutcome {
                    name,
                    state: ResolvedState::Incomplete,
                    optional,
                    version: None,
                    reason: Some(format!(
                        "not finished within the {}s batch timeout",
                        self.batch_timeout.as_secs_f64()
                    )),
                    elapsed: start.elapsed(),
                })
            })
            .collect();

        let report = InstallReport { outcomes };
        self.log.info(
            COMPONENT,
            "dependency batch finished",
            [
                ("total", report.outcomes.len().into()),
                ("already_present", report.count(ResolvedState::AlreadyPresent).into()),
                ("installed", report.count(ResolvedState::Installed).into()),
                ("updated", report.count(ResolvedState::Updated).into()),
                ("failed", report.count(ResolvedState::Failed).into()),
                ("incomplete", report.count(ResolvedState::Incomplete).into()),
                ("elapsed_ms", (start.elapsed().as_millis() as u64).into()),
            ],
        );
        report
    }
}

fn resolve_one(
    repository: &dyn DependencyRepository,
    spec: &DependencySpec,
    integrity: IntegrityPolicy,
    ctx: &WorkerContext,
    log: &LogContext,
) -> DependencyOutcome {
    let start = Instant::now();
    let outcome = |state, version: Option<String>, reason: Option<String>| DependencyOutcome {
        name: spec.name.clone(),
        state,
        optional: spec.optional,
        version,
        reason,
        elapsed: start.elapsed(),
    };

    let resolved = (|| -> Result<(ResolvedState, Option<String>, Option<String>)> {
        let installed = repository.installed_version(&spec.name, ctx)?;
        let (state, result) = match (installed, spec.version.as_deref()) {
            (Some(have), None) => return Ok((ResolvedState::AlreadyPresent, Some(have), None)),
            (Some(have), Some(want)) if have == want => {
                return Ok((ResolvedState::AlreadyPresent, Some(have), None))
            }
            (Some(_), Some(_)) => (ResolvedState::Updated, repository.update(spec, ctx)?),
            (None, _) => (ResolvedState::Installed, repository.install(spec, ctx)?),
        };
        let note = verify_integrity(spec, &result, integrity)?;
        Ok((state, result.version.or_else(|| spec.version.clone()), note))
    })();

    match resolved {
        Ok((state, version, note)) => {
            if let Some(note) = &note {
                log.warn(
                    COMPONENT,
                    "dependency integrity warning",
                    [("name", spec.name.as_str().into()), ("detail", note.as_str().into())],
                );
            }
            outcome(state, version, note)
        }
        Err(err) => {
            log.warn(
                COMPONENT,
                "dependency failed",
                [
                    ("name", spec.name.as_str().into()),
                    ("kind", err.kind().as_str().into()),
                    ("error", err.to_string().into()),
                ],
            );
            outcome(ResolvedState::Failed, None, Some(err.to_string()))
        }
    }
}

/// `Ok(Some(note))` is a non-fatal finding to report with the outcome.
fn verify_integrity(
    spec: &DependencySpec,
    result: &InstallResult,
    policy: IntegrityPolicy,
) -> Result<Option<String>> {
    let Some(expected) = &spec.sha256 else {
        return Ok(None);
    };
    if policy == IntegrityPolicy::Skip {
        return Ok(None);
    }
    let Some(payload) = &result.payload else {
        return Ok(Some("no payload reported; digest not verified".to_string()));
    };
    let (actual, _) = sha256_file(payload)?;
    if &actual == expected {
        return Ok(None);
    }
    let mismatch = BuildError::IntegrityMismatch {
        name: spec.name.clone(),
        expected: expected.clone(),
        actual,
    };
    match policy {
        IntegrityPolicy::Enforce => Err(mismatch),
        _ => Ok(Some(mismatch.to_string())),
    }
}
