//! Build orchestration.
//!
//! Runs the stages of a [`BuildPlan`] in order, appending a checkpoint after
//! each completed stage. A failure while a session is live always ends with
//! a diagnostics bundle followed by a discard, whichever stage failed.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checkpoint::{BuildStage, CheckpointStore};
use crate::config::{BuildConfig, ToolkitConfig};
use crate::config_store::{ConfigStoreBackend, ConfigStorePatcher, HiveFileBackend};
use crate::diagnostics::{DiagnosticsBundle, DiagnosticsCollector, FailureContext};
use crate::error::{BuildError, Result};
use crate::installer::{
    CommandRepository, DependencyInstaller, DependencyRepository, InstallReport, NoRepository,
};
use crate::logging::LogContext;
use crate::pipeline::{Pipeline, PipelineEnv, PipelineReport};
use crate::plan::BuildPlan;
use crate::preflight::{run_preflight, PreflightReport};
use crate::process::BoundedRunner;
use crate::retry::{Sleeper, ThreadSleeper};
use crate::session::{MountSession, SessionManager, SessionState};
use crate::timestamp::generate_build_id;
use crate::toolkit::{ArchiveToolkit, CommandToolkit, ImagingToolkit};

const COMPONENT: &str = "orchestrator";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Generated when absent. Required for `resume`.
    pub build_id: Option<String>,
    pub resume: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageStatus {
    Completed,
    /// Recorded by an earlier attempt.
    Skipped,
    /// Nothing to do (no packaging requested).
    NotRequested,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: BuildStage,
    pub status: StageStatus,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_id: String,
    pub attempt: u32,
    pub stages: Vec<StageTiming>,
    pub preflight: Option<PreflightReport>,
    pub dependencies: Option<InstallReport>,
    pub steps: Option<PipelineReport>,
    pub diagnostics: Option<DiagnosticsBundle>,
    pub elapsed: Duration,
}

impl BuildReport {
    fn new(build_id: String) -> Self {
        Self {
            build_id,
            attempt: 0,
            stages: Vec::new(),
            preflight: None,
            dependencies: None,
            steps: None,
            diagnostics: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn stage(&self, stage: BuildStage) -> Option<&StageTiming> {
        self.stages.iter().find(|t| t.stage == stage)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("build {} failed at {stage}: {error}", report.build_id)]
pub struct BuildFailure {
    #[source]
    pub error: BuildError,
    pub stage: BuildStage,
    pub report: BuildReport,
}

impl BuildFailure {
    pub fn diagnostics(&self) -> Option<&DiagnosticsBundle> {
        self.report.diagnostics.as_ref()
    }

    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

/// Per-run state threaded through the stages.
struct Attempt {
    started: Instant,
    attempt: u32,
    completed: BTreeSet<BuildStage>,
    checkpoints: Option<CheckpointStore>,
    session: Option<MountSession>,
    artifact_size: u64,
    report: BuildReport,
}

type StageResult<T> = std::result::Result<T, (BuildStage, BuildError)>;

pub struct Orchestrator {
    config: BuildConfig,
    sessions: SessionManager,
    store: ConfigStorePatcher,
    diagnostics: DiagnosticsCollector,
    repository: Arc<dyn DependencyRepository>,
    sleeper: Arc<dyn Sleeper>,
    log: LogContext,
}

impl Orchestrator {
    pub fn new(
        config: BuildConfig,
        toolkit: Arc<dyn ImagingToolkit>,
        backend: Box<dyn ConfigStoreBackend>,
        repository: Arc<dyn DependencyRepository>,
        log: LogContext,
    ) -> Self {
        Self::with_sleeper(config, toolkit, backend, repository, Arc::new(ThreadSleeper), log)
    }

    pub fn with_sleeper(
        config: BuildConfig,
        toolkit: Arc<dyn ImagingToolkit>,
        backend: Box<dyn ConfigStoreBackend>,
        repository: Arc<dyn DependencyRepository>,
        sleeper: Arc<dyn Sleeper>,
        log: LogContext,
    ) -> Self {
        let sessions = SessionManager::new(&config, toolkit, Arc::clone(&sleeper), log.clone());
        let store = ConfigStorePatcher::new(
            backend,
            config.unload_retry,
            Arc::clone(&sleeper),
            log.clone(),
        );
        let snapshot = toml::to_string_pretty(&config).ok();
        let diagnostics = DiagnosticsCollector::new(
            config.diagnostics_root(),
            config.diagnostics.clone(),
            snapshot,
            log.clone(),
        );
        Self {
            config,
            sessions,
            store,
            diagnostics,
            repository,
            sleeper,
            log,
        }
    }

    /// Wires the toolkit and repository named in `config`, with hive files
    /// as the config-store backend.
    pub fn from_config(config: BuildConfig, log: LogContext) -> Result<Self> {
        let runner = Arc::new(BoundedRunner::new());
        let toolkit: Arc<dyn ImagingToolkit> = match &config.toolkit {
            ToolkitConfig::Archive => Arc::new(ArchiveToolkit::new()),
            ToolkitConfig::Command(commands) => {
                Arc::new(CommandToolkit::new(runner.clone(), commands.clone(), log.clone())?)
            }
        };
        let repository: Arc<dyn DependencyRepository> = match &config.repository {
            Some(commands) => Arc::new(CommandRepository::new(
                runner,
                commands.clone(),
                config.timeouts.small.install(),
            )?),
            None => Arc::new(NoRepository),
        };
        Ok(Self::new(
            config,
            toolkit,
            Box::new(HiveFileBackend::new()),
            repository,
            log,
        ))
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The checks the Preflight stage runs, without starting a build.
    pub fn preflight(&self, plan: &BuildPlan) -> Result<PreflightReport> {
        let mut tools = self.sessions.toolkit().required_tools();
        if !plan.dependencies.is_empty() {
            tools.extend(self.repository.required_tools());
        }
        tools.sort();
        tools.dedup();
        run_preflight(
            &plan.artifact,
            plan.image_index,
            &tools,
            &self.config.work_root,
            self.config.space_factor,
        )
    }

    pub fn run(
        &mut self,
        plan: &BuildPlan,
        options: RunOptions,
    ) -> std::result::Result<BuildReport, BuildFailure> {
        let build_id = options.build_id.clone().unwrap_or_else(generate_build_id);
        let mut attempt = Attempt {
            started: Instant::now(),
            attempt: 1,
            completed: BTreeSet::new(),
            checkpoints: None,
            session: None,
            artifact_size: 0,
            report: BuildReport::new(build_id.clone()),
        };

        self.log.info(
            COMPONENT,
            "build started",
            [
                ("build_id", build_id.as_str().into()),
                ("artifact", plan.artifact.display().to_string().into()),
                ("resume", options.resume.into()),
            ],
        );

        let outcome = self
            .open_checkpoints(&build_id, options.resume, &mut attempt)
            .and_then(|()| self.run_stages(plan, &mut attempt));
        match outcome {
            Ok(()) => {
                attempt.report.elapsed = attempt.started.elapsed();
                self.log.info(
                    COMPONENT,
                    "build finished",
                    [
                        ("build_id", build_id.as_str().into()),
                        ("attempt", attempt.attempt.into()),
                        ("elapsed_ms", millis(attempt.report.elapsed).into()),
                    ],
                );
                self.flush_log();
                Ok(attempt.report)
            }
            Err((stage, error)) => Err(self.fail(attempt, stage, error)),
        }
    }

    fn open_checkpoints(&self, build_id: &str, resume: bool, att: &mut Attempt) -> StageResult<()> {
        let fail = |e| (BuildStage::Preflight, e);
        let store = CheckpointStore::open(&self.config.checkpoint_dir(), build_id).map_err(fail)?;
        match (resume, store.records().is_empty()) {
            (true, true) => {
                return Err(fail(BuildError::Validation(format!(
                    "no checkpoints recorded for build '{build_id}'"
                ))))
            }
            (false, false) => {
                return Err(fail(BuildError::Validation(format!(
                    "build '{build_id}' already has checkpoints; resume it instead"
                ))))
            }
            _ => {}
        }
        att.attempt = store.next_attempt();
        att.report.attempt = att.attempt;
        if resume {
            att.completed = store.completed_stages();
        }
        att.checkpoints = Some(store);
        Ok(())
    }

    fn run_stages(&mut self, plan: &BuildPlan, att: &mut Attempt) -> StageResult<()> {
        // Preflight always runs, resumed or not.
        let stage = BuildStage::Preflight;
        let started = self.begin(stage);
        let pipeline = Pipeline::from_specs(
            &plan.steps,
            self.config.step_retry.policy(),
            Arc::clone(&self.sleeper),
        )
        .map_err(|e| (stage, e))?;
        let preflight = self.preflight(plan).map_err(|e| (stage, e))?;
        let artifact_size = preflight.artifact_size;
        att.artifact_size = artifact_size;
        att.report.preflight = Some(preflight);
        self.complete(att, stage, started, [("artifact_size", artifact_size.into())])?;

        let stage = BuildStage::Dependencies;
        if att.completed.contains(&stage) {
            self.skip(att, stage);
        } else {
            let started = self.begin(stage);
            let set = plan.dependency_set().map_err(|e| (stage, e))?;
            let installer = DependencyInstaller::new(
                Arc::clone(&self.repository),
                self.config.installer.throttle,
                self.config.installer.batch_timeout(),
                self.config.installer.integrity,
                self.log.clone(),
            );
            let report = installer.install_all(&set);
            let missing: Vec<String> = report
                .required_failures()
                .iter()
                .map(|o| match &o.reason {
                    Some(reason) => format!("{} ({reason})", o.name),
                    None => o.name.clone(),
                })
                .collect();
            let installed = report.outcomes.len() - report.required_failures().len();
            att.report.dependencies = Some(report);
            if !missing.is_empty() {
                return Err((
                    stage,
                    BuildError::MissingPrerequisite(format!(
                        "required dependencies not resolved: {}",
                        missing.join("; ")
                    )),
                ));
            }
            self.complete(att, stage, started, [("resolved", installed.into())])?;
        }

        // The session stages only count as done once the commit landed.
        if att.completed.contains(&BuildStage::Commit) {
            for stage in [BuildStage::Mount, BuildStage::Mutations, BuildStage::Commit] {
                self.skip(att, stage);
            }
        } else {
            self.run_session_stages(plan, &pipeline, att)?;
        }

        let stage = BuildStage::Package;
        match &plan.package {
            None => att.report.stages.push(StageTiming {
                stage,
                status: StageStatus::NotRequested,
                elapsed: Duration::ZERO,
            }),
            Some(_) if att.completed.contains(&stage) => self.skip(att, stage),
            Some(package) => {
                let started = self.begin(stage);
                let timeout = self.sessions.profile_for(att.artifact_size).package();
                self.sessions
                    .toolkit()
                    .optimize(&plan.artifact, &package.options, timeout)
                    .map_err(|e| (stage, e))?;
                self.complete(
                    att,
                    stage,
                    started,
                    [("options", package.options.join(" ").into())],
                )?;
            }
        }
        Ok(())
    }

    fn run_session_stages(
        &mut self,
        plan: &BuildPlan,
        pipeline: &Pipeline,
        att: &mut Attempt,
    ) -> StageResult<()> {
        let stage = BuildStage::Mount;
        let started = self.begin(stage);
        let session = self
            .sessions
            .acquire(&plan.artifact, plan.image_index)
            .map_err(|e| (stage, e))?;
        let session_id = session.id().to_string();
        att.session = Some(session);
        self.complete(att, stage, started, [("session_id", session_id.into())])?;

        let stage = BuildStage::Mutations;
        let started = self.begin(stage);
        let Some(session) = att.session.as_mut() else {
            return Err((stage, BuildError::invalid_state("mounted session", "none")));
        };
        let env = PipelineEnv {
            build_id: &att.report.build_id,
            sessions: &self.sessions,
            diagnostics: &self.diagnostics,
            log: &self.log,
        };
        match pipeline.apply(session, &mut self.store, &env) {
            Ok(report) => {
                let succeeded = report.succeeded();
                att.report.steps = Some(report);
                self.complete(att, stage, started, [("steps", succeeded.into())])?;
            }
            Err(failure) => {
                att.report.steps = Some(failure.report);
                att.report.diagnostics = failure.diagnostics;
                return Err((stage, failure.error));
            }
        }

        let stage = BuildStage::Commit;
        let started = self.begin(stage);
        let Some(session) = att.session.as_mut() else {
            return Err((stage, BuildError::invalid_state("mounted session", "none")));
        };
        self.sessions.release(session, true).map_err(|e| (stage, e))?;
        att.session = None;
        self.complete(att, stage, started, [])
    }

    fn begin(&self, stage: BuildStage) -> Instant {
        self.log
            .info(COMPONENT, "stage started", [("stage", stage.as_str().into())]);
        Instant::now()
    }

    fn skip(&self, att: &mut Attempt, stage: BuildStage) {
        self.log.info(
            COMPONENT,
            "stage skipped; recorded by an earlier attempt",
            [("stage", stage.as_str().into())],
        );
        att.report.stages.push(StageTiming {
            stage,
            status: StageStatus::Skipped,
            elapsed: Duration::ZERO,
        });
    }

    fn complete(
        &self,
        att: &mut Attempt,
        stage: BuildStage,
        started: Instant,
        state: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> StageResult<()> {
        let elapsed = started.elapsed();
        let state: BTreeMap<String, Value> = state
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .chain([("elapsed_ms".to_string(), Value::from(millis(elapsed)))])
            .collect();
        if let Some(checkpoints) = att.checkpoints.as_mut() {
            checkpoints
                .append(att.attempt, stage, state)
                .map_err(|e| (stage, e))?;
        }
        att.report.stages.push(StageTiming {
            stage,
            status: StageStatus::Completed,
            elapsed,
        });
        self.log.info(
            COMPONENT,
            "stage completed",
            [
                ("stage", stage.as_str().into()),
                ("elapsed_ms", millis(elapsed).into()),
            ],
        );
        Ok(())
    }

    fn fail(&mut self, mut att: Attempt, stage: BuildStage, error: BuildError) -> BuildFailure {
        if att.report.diagnostics.is_none() && stage >= BuildStage::Mount {
            let context = FailureContext {
                build_id: &att.report.build_id,
                stage: stage.as_str(),
                error: &error,
            };
            // A session whose commit failed keeps its tree for inspection.
            let live = att.session.as_mut().filter(|s| {
                s.state().is_live()
                    || (s.state() == SessionState::Failed && s.mount_path().is_dir())
            });
            let bundle = match live {
                Some(session) => self
                    .diagnostics
                    .collect(&context, Some((session, &mut self.store))),
                None => self.diagnostics.collect(&context, None),
            };
            match bundle {
                Ok(bundle) => att.report.diagnostics = Some(bundle),
                Err(err) => self.log.warn(
                    COMPONENT,
                    "diagnostics bundle could not be created",
                    [("error", err.to_string().into())],
                ),
            }
        }

        if let Some(session) = att.session.as_mut().filter(|s| s.state().is_live()) {
            let stuck = self.store.unload_all_best_effort(session);
            if !stuck.is_empty() {
                self.log.warn(
                    COMPONENT,
                    "config store handles left loaded before discard",
                    [("aliases", stuck.join(",").into())],
                );
            }
            if let Err(err) = self.sessions.release(session, false) {
                self.log.warn(
                    COMPONENT,
                    "discard after failure reported an error",
                    [("error", err.to_string().into())],
                );
            }
        }

        att.report.elapsed = att.started.elapsed();
        self.log.error(
            COMPONENT,
            "build failed",
            [
                ("build_id", att.report.build_id.as_str().into()),
                ("stage", stage.as_str().into()),
                ("kind", error.kind().as_str().into()),
                ("error", error.to_string().into()),
                ("elapsed_ms", millis(att.report.elapsed).into()),
                (
                    "diagnostics",
                    att.report
                        .diagnostics
                        .as_ref()
                        .map(|b| Value::from(b.path.display().to_string()))
                        .unwrap_or(Value::Null),
                ),
            ],
        );
        self.flush_log();
        BuildFailure {
            error,
            stage,
            report: att.report,
        }
    }

    fn flush_log(&self) {
        if let Err(err) = self.log.flush() {
            tracing::warn!(error = %err, "flushing build event log failed");
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
