//! Append-only build checkpoints.
//!
//! One JSON-lines file per build id. Records are never rewritten; each
//! append is fsynced before returning.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, IoContext, Result};
use crate::timestamp::now_utc_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildStage {
    Preflight = 1,
    Dependencies = 2,
    Mount = 3,
    Mutations = 4,
    Commit = 5,
    Package = 6,
}

impl BuildStage {
    pub const ALL: [BuildStage; 6] = [
        BuildStage::Preflight,
        BuildStage::Dependencies,
        BuildStage::Mount,
        BuildStage::Mutations,
        BuildStage::Commit,
        BuildStage::Package,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStage::Preflight => "Preflight",
            BuildStage::Dependencies => "Dependencies",
            BuildStage::Mount => "Mount",
            BuildStage::Mutations => "Mutations",
            BuildStage::Commit => "Commit",
            BuildStage::Package => "Package",
        }
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub build_id: String,
    pub attempt: u32,
    /// 1-based position in the file.
    pub sequence: u64,
    pub stage: BuildStage,
    pub timestamp_utc: String,
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
}

/// Reads every record in `path`. A missing file has no records.
pub fn read_records(path: &Path) -> Result<Vec<CheckpointRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BuildError::io(format!("opening '{}'", path.display()), err)),
    };
    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.io_context(|| format!("reading '{}'", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CheckpointRecord = serde_json::from_str(&line).map_err(|err| {
            BuildError::Validation(format!(
                "checkpoint '{}' line {}: {err}",
                path.display(),
                line_no + 1
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    build_id: String,
    records: Vec<CheckpointRecord>,
}

impl CheckpointStore {
    /// Opens (or prepares) `<dir>/<build_id>.jsonl` and loads existing records.
    pub fn open(dir: &Path, build_id: &str) -> Result<Self> {
        if build_id.is_empty()
            || !build_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || build_id.starts_with('.')
        {
            return Err(BuildError::Validation(format!("invalid build id '{build_id}'")));
        }
        fs::create_dir_all(dir).io_context(|| format!("creating '{}'", dir.display()))?;
        let path = dir.join(format!("{build_id}.jsonl"));
        let records = read_records(&path)?;
        if let Some(other) = records.iter().find(|r| r.build_id != build_id) {
            return Err(BuildError::Validation(format!(
                "checkpoint '{}' contains a record for build '{}'",
                path.display(),
                other.build_id
            )));
        }
        Ok(Self {
            path,
            build_id: build_id.to_string(),
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&CheckpointRecord> {
        self.records.last()
    }

    pub fn next_attempt(&self) -> u32 {
        self.latest().map(|r| r.attempt + 1).unwrap_or(1)
    }

    /// Stages recorded in any attempt.
    pub fn completed_stages(&self) -> BTreeSet<BuildStage> {
        self.records.iter().map(|r| r.stage).collect()
    }

    pub fn append(
        &mut self,
        attempt: u32,
        stage: BuildStage,
        state: BTreeMap<String, Value>,
    ) -> Result<&CheckpointRecord> {
        if let Some(last) = self.latest() {
            if (attempt, stage) <= (last.attempt, last.stage) {
                return Err(BuildError::invalid_state(
                    format!("checkpoint after attempt {} stage {}", last.attempt, last.stage),
                    format!("attempt {attempt} stage {stage}"),
                ));
            }
        }
        let record = CheckpointRecord {
            build_id: self.build_id.clone(),
            attempt,
            sequence: self.records.len() as u64 + 1,
            stage,
            timestamp_utc: now_utc_rfc3339(),
            state,
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|err| BuildError::Validation(format!("serializing checkpoint: {err}")))?;
        line.push('\n');

        let ctx = || format!("appending to '{}'", self.path.display());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .io_context(ctx)?;
        file.write_all(line.as_bytes()).io_context(ctx)?;
        file.sync_all().io_context(ctx)?;

        tracing::debug!(
            build_id = %record.build_id,
            attempt,
            stage = %stage,
            sequence = record.sequence,
            "checkpoint appended"
        );
        self.records.push(record);
        Ok(&self.records[self.records.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(tmp.path(), "20261014T120000Z-ab12").unwrap();
        assert_eq!(store.next_attempt(), 1);
        store.append(1, BuildStage::Preflight, BTreeMap::new()).unwrap();
        let mut state = BTreeMap::new();
        state.insert("installed".to_string(), Value::from(3));
        store.append(1, BuildStage::Dependencies, state).unwrap();

        let reopened = CheckpointStore::open(tmp.path(), "20261014T120000Z-ab12").unwrap();
        assert_eq!(reopened.records().len(), 2);
        let latest = reopened.latest().unwrap();
        assert_eq!(latest.stage, BuildStage::Dependencies);
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.state["installed"], Value::from(3));
        assert_eq!(reopened.next_attempt(), 2);
        assert_eq!(
            read_records(reopened.path()).unwrap(),
            reopened.records().to_vec()
        );
    }

    #[test]
    fn rejects_non_increasing_attempt_stage() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(tmp.path(), "b1").unwrap();
        store.append(1, BuildStage::Mount, BTreeMap::new()).unwrap();
        let err = store.append(1, BuildStage::Mount, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidState { .. }));
        assert!(store.append(1, BuildStage::Preflight, BTreeMap::new()).is_err());
        // A new attempt may start again from the first stage.
        store.append(2, BuildStage::Preflight, BTreeMap::new()).unwrap();
        assert_eq!(read_records(store.path()).unwrap().len(), 2);
    }

    #[test]
    fn completed_stages_span_attempts() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(tmp.path(), "b2").unwrap();
        store.append(1, BuildStage::Preflight, BTreeMap::new()).unwrap();
        store.append(1, BuildStage::Dependencies, BTreeMap::new()).unwrap();
        store.append(2, BuildStage::Preflight, BTreeMap::new()).unwrap();
        let done = store.completed_stages();
        assert!(done.contains(&BuildStage::Dependencies));
        assert!(!done.contains(&BuildStage::Commit));
    }

    #[test]
    fn invalid_build_ids_and_corrupt_files() {
        let tmp = TempDir::new().unwrap();
        assert!(CheckpointStore::open(tmp.path(), "../escape").is_err());
        assert!(CheckpointStore::open(tmp.path(), "").is_err());

        fs::write(tmp.path().join("bad.jsonl"), "{not json}\n").unwrap();
        let err = CheckpointStore::open(tmp.path(), "bad").unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
        assert!(read_records(&tmp.path().join("missing.jsonl")).unwrap().is_empty());
    }
}
