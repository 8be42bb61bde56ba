//! Build plans.
//!
//! A plan names the artifact to customise, the dependencies to resolve, the
//! mutation steps, and an optional packaging pass:
//!
//! ```toml
//! artifact = "images/base.img"
//! image_index = 1
//!
//! [[dependencies]]
//! name = "vcredist"
//! version = "14.38"
//!
//! [[steps]]
//! kind = "inject_file"
//! source = "files/agent.conf"
//! dest = "etc/agent.conf"
//!
//! [package]
//! options = ["--level=19"]
//! ```
//!
//! Relative host paths resolve against the plan file's directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::installer::{DependencySet, DependencySpec};
use crate::steps::StepSpec;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPlan {
    pub artifact: PathBuf,
    #[serde(default = "default_index")]
    pub image_index: u32,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub package: Option<PackageSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_index() -> u32 {
    1
}

impl BuildPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading build plan '{}'", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&contents, base)
            .with_context(|| format!("parsing build plan '{}'", path.display()))
    }

    pub fn from_toml_str(contents: &str, base: &Path) -> Result<Self> {
        let mut plan: BuildPlan = toml::from_str(contents)?;
        if plan.image_index == 0 {
            bail!("image_index must be 1 or greater");
        }
        if plan.artifact.is_relative() {
            plan.artifact = base.join(&plan.artifact);
        }
        for step in &mut plan.steps {
            step.resolve_sources(base);
        }
        // Surface duplicate names and malformed digests at load time.
        plan.dependency_set()?;
        Ok(plan)
    }

    pub fn dependency_set(&self) -> crate::error::Result<DependencySet> {
        DependencySet::new(self.dependencies.clone())
    }
}
