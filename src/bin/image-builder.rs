use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use image_builder::checkpoint::read_records;
use image_builder::error::{EXIT_FAILURE, EXIT_VALIDATION};
use image_builder::timestamp::generate_build_id;
use image_builder::{
    BuildConfig, BuildError, BuildPlan, JsonLinesSink, LogContext, Orchestrator, RunOptions,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage() -> &'static str {
    "Usage:\n  image-builder build <plan.toml> [--config <config.toml>] [--resume <build-id>]\n  image-builder preflight <plan.toml> [--config <config.toml>]\n  image-builder checkpoints <file.jsonl>"
}

#[derive(Default)]
struct Flags {
    config: Option<PathBuf>,
    resume: Option<String>,
}

fn main() -> ExitCode {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = match args.as_slice() {
        [cmd, plan, rest @ ..] if cmd == "build" => {
            parse_flags(rest, true).and_then(|flags| build(Path::new(plan), flags))
        }
        [cmd, plan, rest @ ..] if cmd == "preflight" => {
            parse_flags(rest, false).and_then(|flags| preflight(Path::new(plan), flags))
        }
        [cmd, file] if cmd == "checkpoints" => checkpoints(Path::new(file)),
        _ => {
            eprintln!("{}", usage());
            Ok(EXIT_VALIDATION)
        }
    };
    match outcome {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code(classify(&err))
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_env("IMAGE_BUILDER_LOG")
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn parse_flags(mut rest: &[String], allow_resume: bool) -> Result<Flags> {
    let mut flags = Flags::default();
    loop {
        match rest {
            [] => return Ok(flags),
            [flag, value, tail @ ..] if flag == "--config" => {
                flags.config = Some(PathBuf::from(value));
                rest = tail;
            }
            [flag, value, tail @ ..] if flag == "--resume" && allow_resume => {
                flags.resume = Some(value.clone());
                rest = tail;
            }
            [other, ..] => bail!("unexpected argument '{other}'\n{}", usage()),
        }
    }
}

fn load_config(flags: &Flags) -> Result<BuildConfig> {
    match &flags.config {
        Some(path) => BuildConfig::load(path),
        None => Ok(BuildConfig::default()),
    }
}

fn build(plan_path: &Path, flags: Flags) -> Result<i32> {
    let config = load_config(&flags)?;
    let plan = BuildPlan::load(plan_path)?;
    let build_id = flags.resume.clone().unwrap_or_else(generate_build_id);
    let log_path = config.log_dir().join(format!("{build_id}.jsonl"));
    let log = LogContext::new(Box::new(JsonLinesSink::new(&log_path)));
    let mut orchestrator =
        Orchestrator::from_config(config, log).context("setting up the build")?;

    let options = RunOptions {
        build_id: Some(build_id),
        resume: flags.resume.is_some(),
    };
    match orchestrator.run(&plan, options) {
        Ok(report) => {
            let json = serde_json::to_string_pretty(&report).context("serializing build report")?;
            println!("{json}");
            eprintln!("build {} finished; events in {}", report.build_id, log_path.display());
            Ok(0)
        }
        Err(failure) => {
            eprintln!("error: {failure}");
            if let Some(bundle) = failure.diagnostics() {
                eprintln!("diagnostics: {}", bundle.path.display());
            }
            eprintln!("events: {}", log_path.display());
            Ok(failure.exit_code())
        }
    }
}

fn preflight(plan_path: &Path, flags: Flags) -> Result<i32> {
    let config = load_config(&flags)?;
    let plan = BuildPlan::load(plan_path)?;
    let (log, _) = LogContext::in_memory();
    let orchestrator = Orchestrator::from_config(config, log).context("setting up preflight")?;
    let report = orchestrator.preflight(&plan)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing preflight report")?
    );
    Ok(0)
}

fn checkpoints(file: &Path) -> Result<i32> {
    let records = read_records(file)
        .with_context(|| format!("reading checkpoints '{}'", file.display()))?;
    if records.is_empty() {
        bail!("no checkpoint records in '{}'", file.display());
    }
    for record in records {
        println!(
            "{:>4}  attempt {:<3} {:<13} {}",
            record.sequence, record.attempt, record.stage, record.timestamp_utc
        );
    }
    Ok(0)
}

fn classify(err: &anyhow::Error) -> i32 {
    if let Some(build) = err.chain().find_map(|e| e.downcast_ref::<BuildError>()) {
        return build.exit_code();
    }
    if err.chain().any(|e| e.is::<toml::de::Error>()) {
        return EXIT_VALIDATION;
    }
    EXIT_FAILURE
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_parse_in_any_order() {
        let flags = parse_flags(&args(&["--resume", "b1", "--config", "c.toml"]), true).unwrap();
        assert_eq!(flags.config, Some(PathBuf::from("c.toml")));
        assert_eq!(flags.resume.as_deref(), Some("b1"));
        assert!(parse_flags(&args(&["--resume", "b1"]), false).is_err());
        assert!(parse_flags(&args(&["--config"]), true).is_err());
    }

    #[test]
    fn classify_maps_build_errors() {
        let err = anyhow::Error::new(BuildError::MissingPrerequisite("tar".into()));
        assert_eq!(classify(&err), 3);
        let err = anyhow::anyhow!("plain");
        assert_eq!(classify(&err), EXIT_FAILURE);
    }
}
