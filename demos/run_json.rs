//! `Pipeline::build` driven from a JSON pipeline-spec file. Thin CLI
//! wrapper: config file formats and logging initialization live here,
//! not in the core, since this binary is the external collaborator that
//! exercises them.

use camflow::context::{CameraManager, Context, ModelManager};
use camflow::{OperatorFactory, Pipeline, PipelineSpec, Runtime};
use std::path::PathBuf;
use std::time::Duration;

struct Args {
    config_dir: Option<PathBuf>,
    spec_path: PathBuf,
    run_for: Duration,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_dir = None;
    let mut spec_path = None;
    let mut run_for = Duration::from_secs(10);
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-dir" => {
                config_dir = Some(PathBuf::from(
                    args.next().ok_or_else(|| anyhow::anyhow!("--config-dir needs a value"))?,
                ));
            }
            "--pipeline" => {
                spec_path = Some(PathBuf::from(
                    args.next().ok_or_else(|| anyhow::anyhow!("--pipeline needs a value"))?,
                ));
            }
            "--run-seconds" => {
                let secs: u64 = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--run-seconds needs a value"))?
                    .parse()?;
                run_for = Duration::from_secs(secs);
            }
            "--camera" | "--display" | "--device" => {
                args.next();
            }
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }
    Ok(Args {
        config_dir,
        spec_path: spec_path.ok_or_else(|| anyhow::anyhow!("--pipeline <file.json> is required"))?,
        run_for,
    })
}

fn load_runtime(config_dir: &Option<PathBuf>) -> anyhow::Result<Runtime> {
    let mut context = Context::new();
    let mut cameras = CameraManager::default();
    let mut models = ModelManager::default();

    if let Some(dir) = config_dir {
        if let Ok(contents) = std::fs::read_to_string(dir.join("cameras.toml")) {
            cameras = CameraManager::from_toml(&contents)?;
        }
        if let Ok(contents) = std::fs::read_to_string(dir.join("models.toml")) {
            models = ModelManager::from_toml(&contents)?;
        }
        if let Ok(contents) = std::fs::read_to_string(dir.join("saf.toml")) {
            context = Context::from_toml(&contents)?;
        }
    }

    Ok(Runtime::new(context, cameras, models))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(err) => {
            eprintln!("argument error: {err}");
            std::process::exit(1);
        }
    };

    let spec_json = std::fs::read_to_string(&args.spec_path)?;
    let spec: PipelineSpec = serde_json::from_str(&spec_json)?;
    let runtime = load_runtime(&args.config_dir)?;
    let factory = OperatorFactory::with_builtin_operators();

    let pipeline = match Pipeline::build(&spec, &factory, &runtime) {
        Ok(p) => p,
        Err(err) => {
            eprintln!("failed to build pipeline: {err}");
            std::process::exit(1);
        }
    };

    match pipeline.start() {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("pipeline failed to start");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("failed to start pipeline: {err}");
            std::process::exit(1);
        }
    }

    std::thread::sleep(args.run_for);
    let clean = pipeline.stop();
    std::process::exit(if clean { 0 } else { 1 });
}
