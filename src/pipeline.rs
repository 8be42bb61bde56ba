//! Ordered application of mutation steps to a mounted session.
//!
//! Steps run exactly in declared order. A busy report from an idempotent
//! step is retried under the step policy; any other failure stops the
//! pipeline, after which diagnostics are collected from the still-mounted
//! tree, outstanding config store handles are unloaded and the session is
//! discarded.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config_store::ConfigStorePatcher;
use crate::diagnostics::{DiagnosticsBundle, DiagnosticsCollector, FailureContext};
use crate::error::{BuildError, ErrorKind};
use crate::logging::LogContext;
use crate::retry::{retry_with_backoff, RetryPolicy, Sleeper};
use crate::session::{MountSession, SessionManager};
use crate::steps::{build_step, MutationStep, StepContext, StepSpec};

const COMPONENT: &str = "pipeline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub steps: Vec<StepRecord>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count()
    }
}

#[derive(Debug)]
pub struct PipelineFailure {
    pub error: BuildError,
    pub report: PipelineReport,
    pub diagnostics: Option<DiagnosticsBundle>,
}

/// What the pipeline needs to clean up after a failed step.
pub struct PipelineEnv<'a> {
    pub build_id: &'a str,
    pub sessions: &'a SessionManager,
    pub diagnostics: &'a DiagnosticsCollector,
    pub log: &'a LogContext,
}

pub struct Pipeline {
    steps: Vec<Box<dyn MutationStep>>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn MutationStep>>, retry: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            steps,
            retry,
            sleeper,
        }
    }

    pub fn from_specs(
        specs: &[StepSpec],
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> crate::error::Result<Self> {
        let steps = specs
            .iter()
            .map(build_step)
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok(Self::new(steps, retry, sleeper))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping at the first failure. No cleanup.
    pub fn run_steps(
        &self,
        ctx: &mut StepContext<'_>,
    ) -> std::result::Result<PipelineReport, (BuildError, PipelineReport)> {
        let mut report = PipelineReport::default();
        let mut failure = None;

        for (index, step) in self.steps.iter().enumerate() {
            if failure.is_some() {
                report.steps.push(StepRecord {
                    index,
                    name: step.name().to_string(),
                    status: StepStatus::NotRun,
                    attempts: 0,
                    elapsed: Duration::ZERO,
                    error_kind: None,
                    error: None,
                });
                continue;
            }

            let log = ctx.log.clone();
            log.info(
                COMPONENT,
                "step started",
                [("step", step.name().into()), ("index", index.into())],
            );
            let policy = if step.idempotent() {
                self.retry
            } else {
                RetryPolicy::once()
            };
            let start = Instant::now();
            let outcome = retry_with_backoff(
                &policy,
                self.sleeper.as_ref(),
                |_| step.apply(ctx),
                |attempt, err, delay| {
                    log.warn(
                        COMPONENT,
                        "step busy, retrying",
                        [
                            ("step", step.name().into()),
                            ("attempt", attempt.into()),
                            ("backoff_ms", (delay.as_millis() as u64).into()),
                            ("error", err.to_string().into()),
                        ],
                    );
                },
            );
            let elapsed = start.elapsed();

            match outcome {
                Ok(done) => {
                    ctx.session.mark_modified();
                    log.info(
                        COMPONENT,
                        "step succeeded",
                        [
                            ("step", step.name().into()),
                            ("attempts", done.attempts.into()),
                            ("elapsed_ms", (elapsed.as_millis() as u64).into()),
                        ],
                    );
                    report.steps.push(StepRecord {
                        index,
                        name: step.name().to_string(),
                        status: StepStatus::Succeeded,
                        attempts: done.attempts,
                        elapsed,
                        error_kind: None,
                        error: None,
                    });
                }
                Err(exhausted) => {
                    let err = BuildError::step(step.name(), exhausted.last);
                    log.error(
                        COMPONENT,
                        "step failed",
                        [
                            ("step", step.name().into()),
                            ("attempts", exhausted.attempts.into()),
                            ("elapsed_ms", (elapsed.as_millis() as u64).into()),
                            ("kind", err.kind().as_str().into()),
                            ("error", err.to_string().into()),
                        ],
                    );
                    report.steps.push(StepRecord {
                        index,
                        name: step.name().to_string(),
                        status: StepStatus::Failed,
                        attempts: exhausted.attempts,
                        elapsed,
                        error_kind: Some(err.kind()),
                        error: Some(err.to_string()),
                    });
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => Err((err, report)),
            None => Ok(report),
        }
    }

    /// Run the steps against `session`. On failure the session is left
    /// Discarded and the returned failure carries the diagnostics bundle.
    pub fn apply(
        &self,
        session: &mut MountSession,
        store: &mut ConfigStorePatcher,
        env: &PipelineEnv<'_>,
    ) -> std::result::Result<PipelineReport, PipelineFailure> {
        if !session.state().is_live() {
            return Err(PipelineFailure {
                error: BuildError::invalid_state("Mounted or Modified", session.state()),
                report: PipelineReport::default(),
                diagnostics: None,
            });
        }

        let outcome = {
            let mut ctx = StepContext {
                session: &mut *session,
                store: &mut *store,
                log: env.log,
            };
            self.run_steps(&mut ctx)
        };

        let (error, report) = match outcome {
            Ok(report) => return Ok(report),
            Err(failed) => failed,
        };

        let failure = FailureContext {
            build_id: env.build_id,
            stage: "Mutations",
            error: &error,
        };
        let diagnostics = match env.diagnostics.collect(&failure, Some((&mut *session, &mut *store))) {
            Ok(bundle) => Some(bundle),
            Err(err) => {
                env.log.warn(
                    COMPONENT,
                    "diagnostics bundle could not be created",
                    [("error", err.to_string().into())],
                );
                None
            }
        };

        let stuck = store.unload_all_best_effort(session);
        if !stuck.is_empty() {
            env.log.warn(
                COMPONENT,
                "config store handles left loaded before discard",
                [("aliases", stuck.join(",").into())],
            );
        }
        if let Err(err) = env.sessions.release(session, false) {
            env.log.warn(
                COMPONENT,
                "discard after failed step reported an error",
                [("error", err.to_string().into())],
            );
        }

        Err(PipelineFailure {
            error,
            report,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, UnloadRetry};
    use crate::config_store::HiveFileBackend;
    use crate::error::Result;
    use crate::retry::RecordingSleeper;
    use crate::session::SessionState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recording {
        name: String,
        order: Arc<Mutex<Vec<String>>>,
        idempotent: bool,
        busy_first: u32,
        calls: AtomicU32,
        fail: bool,
    }

    impl Recording {
        fn new(name: &str, order: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                order: Arc::clone(order),
                idempotent: true,
                busy_first: 0,
                calls: AtomicU32::new(0),
                fail: false,
            }
        }
    }

    impl MutationStep for Recording {
        fn name(&self) -> &str {
            &self.name
        }
        fn idempotent(&self) -> bool {
            self.idempotent
        }
        fn apply(&self, _ctx: &mut StepContext<'_>) -> Result<()> {
            self.order.lock().unwrap().push(self.name.clone());
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.busy_first {
                return Err(BuildError::Busy("file in use".into()));
            }
            if self.fail {
                return Err(BuildError::Validation("broken step".into()));
            }
            Ok(())
        }
    }

    fn run(steps: Vec<Box<dyn MutationStep>>) -> (std::result::Result<PipelineReport, (BuildError, PipelineReport)>, SessionState) {
        let tmp = TempDir::new().unwrap();
        let mut session = MountSession::detached_for_tests(tmp.path(), &tmp.path().join("mount"));
        let (log, _) = LogContext::in_memory();
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut store = ConfigStorePatcher::new(
            Box::new(HiveFileBackend::new()),
            UnloadRetry::default(),
            sleeper.clone(),
            log.clone(),
        );
        let pipeline = Pipeline::new(
            steps,
            BuildConfig::default().step_retry.policy(),
            sleeper,
        );
        let mut ctx = StepContext {
            session: &mut session,
            store: &mut store,
            log: &log,
        };
        let out = pipeline.run_steps(&mut ctx);
        let state = session.state();
        session.set_state_for_tests(SessionState::Discarded);
        (out, state)
    }

    #[test]
    fn steps_run_in_declared_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let names = ["inject", "startup", "config", "cleanup"];
        let steps = names
            .iter()
            .map(|n| Box::new(Recording::new(n, &order)) as Box<dyn MutationStep>)
            .collect();
        let (out, state) = run(steps);
        let report = out.unwrap();
        assert_eq!(*order.lock().unwrap(), names.map(String::from).to_vec());
        assert_eq!(report.succeeded(), 4);
        assert_eq!(state, SessionState::Modified);
    }

    #[test]
    fn idempotent_step_retried_on_busy() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut step = Recording::new("flaky", &order);
        step.busy_first = 1;
        let (out, _) = run(vec![Box::new(step)]);
        let report = out.unwrap();
        assert_eq!(report.steps[0].attempts, 2);
    }

    #[test]
    fn non_idempotent_step_is_not_retried() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut step = Recording::new("once", &order);
        step.busy_first = 1;
        step.idempotent = false;
        let (out, state) = run(vec![Box::new(step)]);
        let (err, report) = out.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientResourceBusy);
        assert_eq!(report.steps[0].attempts, 1);
        assert_eq!(state, SessionState::Mounted);
    }

    #[test]
    fn failure_stops_remaining_steps() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut broken = Recording::new("second", &order);
        broken.fail = true;
        let steps: Vec<Box<dyn MutationStep>> = vec![
            Box::new(Recording::new("first", &order)),
            Box::new(broken),
            Box::new(Recording::new("third", &order)),
        ];
        let (out, _) = run(steps);
        let (err, report) = out.unwrap_err();
        assert!(matches!(err, BuildError::Step { ref step, .. } if step == "second"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(report.steps[2].status, StepStatus::NotRun);
    }
}
