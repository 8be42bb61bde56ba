//! Offline customisation of disk images.
//!
//! Takes a base image artifact, mounts a working copy of it, installs
//! dependencies, applies an ordered list of mutation steps (file injection,
//! startup-script rewrites, config-store patches), then commits or discards
//! the result. Builds are checkpointed per stage and can be resumed.
//!
//! - **Sessions** - exclusive, lock-guarded mount sessions over a working copy
//! - **Config stores** - load/set/unload of hierarchical key-value files
//! - **Steps and pipeline** - ordered, retried, stop-on-first-failure mutations
//! - **Installer** - bounded parallel dependency resolution
//! - **Diagnostics** - failure bundles collected before cleanup
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!     │
//!     ├── preflight ── artifact, host tools, work root, free space
//!     ├── installer ── DependencyRepository on the worker pool
//!     ├── session ──── ImagingToolkit (CommandToolkit | ArchiveToolkit)
//!     │     └── pipeline ── MutationStep* ── ConfigStorePatcher
//!     ├── diagnostics
//!     └── checkpoint
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use image_builder::{BuildConfig, BuildPlan, LogContext, Orchestrator, RunOptions};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = BuildConfig::load(Path::new("image-builder.toml"))?;
//! let plan = BuildPlan::load(Path::new("plan.toml"))?;
//! let (log, _events) = LogContext::in_memory();
//! let mut orchestrator = Orchestrator::from_config(config, log)?;
//! match orchestrator.run(&plan, RunOptions::default()) {
//!     Ok(report) => println!("built {}", report.build_id),
//!     Err(failure) => eprintln!("{failure}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod config_store;
pub mod diagnostics;
pub mod error;
pub mod fsutil;
pub mod installer;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod pool;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod session;
pub mod steps;
pub mod timestamp;
pub mod toolkit;

pub use checkpoint::{BuildStage, CheckpointRecord, CheckpointStore};
pub use config::BuildConfig;
pub use config_store::{ConfigStoreBackend, ConfigStorePatcher, ConfigValue, HiveFileBackend};
pub use error::{BuildError, ErrorKind, Result};
pub use logging::{JsonLinesSink, LogContext, MemorySink};
pub use orchestrator::{BuildFailure, BuildReport, Orchestrator, RunOptions};
pub use plan::BuildPlan;
pub use session::{MountSession, SessionManager, SessionState};
pub use toolkit::{ArchiveToolkit, CommandToolkit, ImagingToolkit};
