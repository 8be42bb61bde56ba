//! Imaging toolkit seam.
//!
//! The session manager only talks to [`ImagingToolkit`]. Two implementations
//! ship with the crate: [`CommandToolkit`] drives an external imaging CLI
//! through argv templates, and [`ArchiveToolkit`] treats an image as a
//! `tar.zst` archive of a filesystem tree.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive;
use crate::error::{BuildError, IoContext, Result};
use crate::fsutil::sibling_path;
use crate::logging::LogContext;
use crate::process::{ExternalCommand, OperationRunner};
use crate::timestamp::deadline_after;

const COMPONENT: &str = "toolkit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismountMode {
    Commit,
    Discard,
}

impl DismountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DismountMode::Commit => "commit",
            DismountMode::Discard => "discard",
        }
    }
}

pub trait ImagingToolkit: Send + Sync {
    fn name(&self) -> &str;

    /// Mount image `index` of `image` at the empty directory `mount_dir`.
    fn mount(&self, image: &Path, index: u32, mount_dir: &Path, timeout: Duration) -> Result<()>;

    /// Unmount `mount_dir`, writing changes back into `image` on commit.
    fn dismount(
        &self,
        image: &Path,
        mount_dir: &Path,
        mode: DismountMode,
        timeout: Duration,
    ) -> Result<()>;

    /// Post-commit compaction or export of a finished image.
    fn optimize(&self, image: &Path, options: &[String], timeout: Duration) -> Result<()>;

    /// Host programs this toolkit shells out to.
    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Argv templates for an external imaging tool.
///
/// Placeholders: `{image}`, `{index}`, `{mount}`, `{path}`. An argument that
/// is exactly `{options}` expands to the caller's option list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitCommands {
    pub mount: Vec<String>,
    pub commit: Vec<String>,
    pub discard: Vec<String>,
    pub optimize: Vec<String>,
    /// Exit codes that mean "resource busy, try again".
    pub busy_exit_codes: Vec<i32>,
    /// Case-insensitive stderr substrings that mean the same.
    pub busy_markers: Vec<String>,
}

#[derive(Default)]
struct Placeholders<'a> {
    image: Option<&'a Path>,
    index: Option<u32>,
    mount: Option<&'a Path>,
    options: &'a [String],
}

fn render(template: &[String], values: &Placeholders<'_>) -> Result<ExternalCommand> {
    let mut argv = Vec::with_capacity(template.len());
    for arg in template {
        if arg == "{options}" {
            argv.extend(values.options.iter().cloned());
            continue;
        }
        let mut out = arg.clone();
        if let Some(image) = values.image {
            let image = image.display().to_string();
            out = out.replace("{image}", &image).replace("{path}", &image);
        }
        if let Some(index) = values.index {
            out = out.replace("{index}", &index.to_string());
        }
        if let Some(mount) = values.mount {
            out = out.replace("{mount}", &mount.display().to_string());
        }
        argv.push(out);
    }
    ExternalCommand::from_argv(&argv)
}

pub struct CommandToolkit {
    runner: Arc<dyn OperationRunner>,
    commands: ToolkitCommands,
    log: LogContext,
}

impl CommandToolkit {
    pub fn new(
        runner: Arc<dyn OperationRunner>,
        commands: ToolkitCommands,
        log: LogContext,
    ) -> Result<Self> {
        for (name, template) in [
            ("mount", &commands.mount),
            ("commit", &commands.commit),
            ("discard", &commands.discard),
        ] {
            if template.is_empty() {
                return Err(BuildError::Validation(format!(
                    "toolkit command '{name}' is not configured"
                )));
            }
        }
        Ok(Self {
            runner,
            commands,
            log,
        })
    }

    fn execute(&self, operation: &str, command: ExternalCommand, timeout: Duration) -> Result<()> {
        self.log.debug(
            COMPONENT,
            "toolkit operation",
            [
                ("operation", operation.into()),
                ("command", command.display().to_string().into()),
            ],
        );
        let result = self.runner.run(&command, timeout)?;
        if result.timed_out {
            return Err(BuildError::Timeout {
                operation: format!("toolkit {operation}"),
                timeout,
            });
        }
        if result.success() {
            return Ok(());
        }
        let busy_code = result
            .exit_code
            .is_some_and(|code| self.commands.busy_exit_codes.contains(&code));
        let stderr = result.stderr.to_lowercase();
        let busy_marker = self
            .commands
            .busy_markers
            .iter()
            .any(|marker| stderr.contains(&marker.to_lowercase()));
        if busy_code || busy_marker {
            return Err(BuildError::Busy(format!(
                "toolkit {operation}: {}",
                result.stderr.trim()
            )));
        }
        Err(BuildError::External {
            program: command.program,
            code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        })
    }
}

impl ImagingToolkit for CommandToolkit {
    fn name(&self) -> &str {
        "command"
    }

    fn mount(&self, image: &Path, index: u32, mount_dir: &Path, timeout: Duration) -> Result<()> {
        let command = render(
            &self.commands.mount,
            &Placeholders {
                image: Some(image),
                index: Some(index),
                mount: Some(mount_dir),
                ..Default::default()
            },
        )?;
        self.execute("mount", command, timeout)
    }

    fn dismount(
        &self,
        image: &Path,
        mount_dir: &Path,
        mode: DismountMode,
        timeout: Duration,
    ) -> Result<()> {
        let template = match mode {
            DismountMode::Commit => &self.commands.commit,
            DismountMode::Discard => &self.commands.discard,
        };
        let command = render(
            template,
            &Placeholders {
                image: Some(image),
                mount: Some(mount_dir),
                ..Default::default()
            },
        )?;
        self.execute(mode.as_str(), command, timeout)
    }

    fn optimize(&self, image: &Path, options: &[String], timeout: Duration) -> Result<()> {
        if self.commands.optimize.is_empty() {
            return Err(BuildError::Validation(
                "toolkit command 'optimize' is not configured".to_string(),
            ));
        }
        let command = render(
            &self.commands.optimize,
            &Placeholders {
                image: Some(image),
                options,
                ..Default::default()
            },
        )?;
        self.execute("optimize", command, timeout)
    }

    fn required_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = [
            &self.commands.mount,
            &self.commands.commit,
            &self.commands.discard,
            &self.commands.optimize,
        ]
        .into_iter()
        .filter_map(|template| template.first().cloned())
        .collect();
        tools.sort();
        tools.dedup();
        tools
    }
}

/// Images held as `tar.zst` archives of a filesystem tree.
///
/// Archives contain a single image, so only index 1 is valid. Timeouts are
/// enforced between archive entries.
#[derive(Debug, Clone)]
pub struct ArchiveToolkit {
    level: i32,
}

impl Default for ArchiveToolkit {
    fn default() -> Self {
        Self {
            level: archive::DEFAULT_LEVEL,
        }
    }
}

impl ArchiveToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pack `src_dir` into a new archive image at `out`.
    pub fn create_image(src_dir: &Path, out: &Path) -> Result<()> {
        archive::pack_tree(src_dir, out, archive::DEFAULT_LEVEL, None)
    }

    /// Unpack `image` into the existing directory `dest`.
    pub fn extract_image(image: &Path, dest: &Path) -> Result<()> {
        archive::unpack_tree(image, dest, None)
    }
}

impl ImagingToolkit for ArchiveToolkit {
    fn name(&self) -> &str {
        "archive"
    }

    fn mount(&self, image: &Path, index: u32, mount_dir: &Path, timeout: Duration) -> Result<()> {
        if index != 1 {
            return Err(BuildError::Validation(format!(
                "archive image '{}' has no index {index}",
                image.display()
            )));
        }
        if !dir_is_empty(mount_dir)? {
            return Err(BuildError::Busy(format!(
                "mount directory '{}' is in use",
                mount_dir.display()
            )));
        }
        let deadline = Some((deadline_after(Instant::now(), timeout), timeout));
        if let Err(err) = archive::unpack_tree(image, mount_dir, deadline) {
            let _ = clear_dir(mount_dir);
            return Err(err);
        }
        Ok(())
    }

    fn dismount(
        &self,
        image: &Path,
        mount_dir: &Path,
        mode: DismountMode,
        timeout: Duration,
    ) -> Result<()> {
        if mode == DismountMode::Commit {
            let deadline = Some((deadline_after(Instant::now(), timeout), timeout));
            let staged = sibling_path(image, "commit");
            if let Err(err) = archive::pack_tree(mount_dir, &staged, self.level, deadline) {
                let _ = fs::remove_file(&staged);
                return Err(err);
            }
            fs::rename(&staged, image)
                .io_context(|| format!("replacing '{}'", image.display()))?;
        }
        clear_dir(mount_dir)
    }

    fn optimize(&self, image: &Path, options: &[String], timeout: Duration) -> Result<()> {
        let level = parse_level(options)?.unwrap_or(19);
        let deadline = Some((deadline_after(Instant::now(), timeout), timeout));
        let scratch = sibling_path(image, "optimize.d");
        let staged = sibling_path(image, "optimize");
        if scratch.exists() {
            fs::remove_dir_all(&scratch)
                .io_context(|| format!("removing stale '{}'", scratch.display()))?;
        }
        fs::create_dir_all(&scratch)
            .io_context(|| format!("creating '{}'", scratch.display()))?;

        let result = archive::unpack_tree(image, &scratch, deadline)
            .and_then(|()| archive::pack_tree(&scratch, &staged, level, deadline))
            .and_then(|()| {
                fs::rename(&staged, image)
                    .io_context(|| format!("replacing '{}'", image.display()))
            });
        let _ = fs::remove_dir_all(&scratch);
        if result.is_err() {
            let _ = fs::remove_file(&staged);
        }
        result
    }
}

fn parse_level(options: &[String]) -> Result<Option<i32>> {
    for option in options {
        if let Some(value) = option.strip_prefix("--level=") {
            let level = value.parse::<i32>().map_err(|_| {
                BuildError::Validation(format!("invalid compression level '{value}'"))
            })?;
            return Ok(Some(level));
        }
    }
    Ok(None)
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(dir).io_context(|| format!("reading mount dir '{}'", dir.display()))?;
    Ok(entries.next().is_none())
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).io_context(|| format!("reading '{}'", dir.display()))? {
        let entry = entry.io_context(|| format!("reading '{}'", dir.display()))?;
        let path = entry.path();
        let ft = entry
            .file_type()
            .io_context(|| format!("stat '{}'", path.display()))?;
        if ft.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .io_context(|| format!("removing '{}'", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ExternalOperationResult;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedRunner {
        exit_code: Option<i32>,
        stderr: &'static str,
        timed_out: bool,
        seen: Mutex<Vec<ExternalCommand>>,
    }

    impl ScriptedRunner {
        fn exiting(code: i32, stderr: &'static str) -> Self {
            Self {
                exit_code: Some(code),
                stderr,
                timed_out: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl OperationRunner for ScriptedRunner {
        fn run(
            &self,
            command: &ExternalCommand,
            _timeout: Duration,
        ) -> Result<ExternalOperationResult> {
            self.seen.lock().unwrap().push(command.clone());
            Ok(ExternalOperationResult {
                exit_code: self.exit_code,
                stdout: String::new(),
                stderr: self.stderr.to_string(),
                timed_out: self.timed_out,
                elapsed: Duration::ZERO,
                pid: 1,
            })
        }
    }

    fn quiet_log() -> LogContext {
        LogContext::in_memory().0
    }

    fn commands() -> ToolkitCommands {
        ToolkitCommands {
            mount: ["imgtool", "mount", "{image}", "--index={index}", "{mount}"]
                .map(String::from)
                .to_vec(),
            commit: ["imgtool", "unmount", "{mount}", "--commit"]
                .map(String::from)
                .to_vec(),
            discard: ["imgtool", "unmount", "{mount}", "--discard"]
                .map(String::from)
                .to_vec(),
            optimize: ["imgtool", "export", "{path}", "{options}"]
                .map(String::from)
                .to_vec(),
            busy_exit_codes: vec![5],
            busy_markers: vec!["being used by another process".to_string()],
        }
    }

    #[test]
    fn renders_placeholders_and_options() {
        let runner = Arc::new(ScriptedRunner::exiting(0, ""));
        let toolkit = CommandToolkit::new(runner.clone(), commands(), quiet_log()).unwrap();
        toolkit
            .mount(
                Path::new("/w/image.wim"),
                2,
                Path::new("/w/mount"),
                Duration::from_secs(1),
            )
            .unwrap();
        toolkit
            .optimize(
                Path::new("/w/image.wim"),
                &["--compress=max".to_string(), "--check".to_string()],
                Duration::from_secs(1),
            )
            .unwrap();

        let seen = runner.seen.lock().unwrap();
        assert_eq!(
            seen[0].display(),
            "imgtool mount /w/image.wim --index=2 /w/mount"
        );
        assert_eq!(
            seen[1].display(),
            "imgtool export /w/image.wim --compress=max --check"
        );
    }

    #[test]
    fn busy_exit_code_and_marker_classify_as_busy() {
        let toolkit = CommandToolkit::new(
            Arc::new(ScriptedRunner::exiting(5, "")),
            commands(),
            quiet_log(),
        )
        .unwrap();
        let err = toolkit
            .mount(Path::new("/i"), 1, Path::new("/m"), Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_retryable());

        let toolkit = CommandToolkit::new(
            Arc::new(ScriptedRunner::exiting(
                1,
                "The file is being used by another process.",
            )),
            commands(),
            quiet_log(),
        )
        .unwrap();
        let err = toolkit
            .mount(Path::new("/i"), 1, Path::new("/m"), Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_retryable());

        let toolkit = CommandToolkit::new(
            Arc::new(ScriptedRunner::exiting(2, "bad image")),
            commands(),
            quiet_log(),
        )
        .unwrap();
        let err = toolkit
            .mount(Path::new("/i"), 1, Path::new("/m"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BuildError::External { code: Some(2), .. }));
    }

    #[test]
    fn runner_timeout_is_a_timeout_error() {
        let runner = ScriptedRunner {
            exit_code: None,
            stderr: "",
            timed_out: true,
            seen: Mutex::new(Vec::new()),
        };
        let toolkit = CommandToolkit::new(Arc::new(runner), commands(), quiet_log()).unwrap();
        let err = toolkit
            .dismount(
                Path::new("/i"),
                Path::new("/m"),
                DismountMode::Commit,
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { .. }));
    }

    #[test]
    fn missing_templates_are_rejected() {
        let mut partial = commands();
        partial.commit.clear();
        assert!(
            CommandToolkit::new(Arc::new(ScriptedRunner::exiting(0, "")), partial, quiet_log())
                .is_err()
        );
    }

    #[test]
    fn required_tools_are_deduplicated() {
        let toolkit = CommandToolkit::new(
            Arc::new(ScriptedRunner::exiting(0, "")),
            commands(),
            quiet_log(),
        )
        .unwrap();
        assert_eq!(toolkit.required_tools(), vec!["imgtool".to_string()]);
    }

    #[test]
    fn operations_are_recorded_in_the_build_log() {
        let (log, _) = LogContext::in_memory();
        let toolkit = CommandToolkit::new(
            Arc::new(ScriptedRunner::exiting(0, "")),
            commands(),
            log.clone(),
        )
        .unwrap();
        toolkit
            .dismount(
                Path::new("/i"),
                Path::new("/m"),
                DismountMode::Discard,
                Duration::from_secs(1),
            )
            .unwrap();
        let events = log.recent();
        let event = events
            .iter()
            .find(|e| e.message == "toolkit operation")
            .expect("toolkit event");
        assert_eq!(event.component, "toolkit");
        assert_eq!(event.fields["operation"], serde_json::Value::from("discard"));
    }

    #[test]
    fn archive_commit_writes_changes_back() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/hostname"), "old\n").unwrap();
        let image = tmp.path().join("image.tar.zst");
        ArchiveToolkit::create_image(&tree, &image).unwrap();

        let mount = tmp.path().join("mount");
        fs::create_dir_all(&mount).unwrap();
        let toolkit = ArchiveToolkit::new();
        toolkit
            .mount(&image, 1, &mount, Duration::from_secs(30))
            .unwrap();
        assert_eq!(fs::read_to_string(mount.join("etc/hostname")).unwrap(), "old\n");

        fs::write(mount.join("etc/hostname"), "new\n").unwrap();
        toolkit
            .dismount(&image, &mount, DismountMode::Commit, Duration::from_secs(30))
            .unwrap();
        assert!(dir_is_empty(&mount).unwrap());

        let check = tmp.path().join("check");
        fs::create_dir_all(&check).unwrap();
        ArchiveToolkit::extract_image(&image, &check).unwrap();
        assert_eq!(fs::read_to_string(check.join("etc/hostname")).unwrap(), "new\n");
    }

    #[test]
    fn archive_discard_leaves_image_untouched() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("file"), "x").unwrap();
        let image = tmp.path().join("image.tar.zst");
        ArchiveToolkit::create_image(&tree, &image).unwrap();
        let before = fs::read(&image).unwrap();

        let mount = tmp.path().join("mount");
        fs::create_dir_all(&mount).unwrap();
        let toolkit = ArchiveToolkit::new();
        toolkit.mount(&image, 1, &mount, Duration::from_secs(30)).unwrap();
        fs::write(mount.join("file"), "changed").unwrap();
        toolkit
            .dismount(&image, &mount, DismountMode::Discard, Duration::from_secs(30))
            .unwrap();

        assert_eq!(fs::read(&image).unwrap(), before);
    }

    #[test]
    fn archive_mount_rejects_busy_dir_and_bad_index() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        let image = tmp.path().join("image.tar.zst");
        ArchiveToolkit::create_image(&tree, &image).unwrap();

        let mount = tmp.path().join("mount");
        fs::create_dir_all(&mount).unwrap();
        let toolkit = ArchiveToolkit::new();
        let err = toolkit
            .mount(&image, 2, &mount, Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));

        fs::write(mount.join("leftover"), "").unwrap();
        let err = toolkit
            .mount(&image, 1, &mount, Duration::from_secs(30))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn archive_optimize_keeps_content() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("data"), "a".repeat(4096)).unwrap();
        let image = tmp.path().join("image.tar.zst");
        ArchiveToolkit::create_image(&tree, &image).unwrap();

        ArchiveToolkit::new()
            .optimize(&image, &["--level=10".to_string()], Duration::from_secs(30))
            .unwrap();

        let check = tmp.path().join("check");
        fs::create_dir_all(&check).unwrap();
        ArchiveToolkit::extract_image(&image, &check).unwrap();
        assert_eq!(fs::read_to_string(check.join("data")).unwrap(), "a".repeat(4096));
        assert!(!tmp.path().join("image.tar.zst.optimize.d").exists());
    }
}
