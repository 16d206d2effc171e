//! Appose CLI
//!
//! Resolves an environment, starts a worker and runs a script in it.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use appose::config::CONFIG_FILE;
use appose::{
    ApposeConfig, EnvironmentResolver, EnvironmentSpec, ExistingInterpreter, Inputs, NdArray, Task,
    Value,
};

/// Environment used when none is given: the image rotation demo
const DEFAULT_ENVIRONMENT: &str = "\
name: image-rotation
channels:
  - conda-forge
dependencies:
  - python=3.10
  - pip
  - scikit-image
  - pip:
    - numpy
    - appose
";

const ROTATE_SCRIPT: &str = "\
# 'image' is bound from the task inputs
rotated = rot90(image)
output rotated
";

/// Run scripts in worker processes, sharing arrays through shared memory
#[derive(Parser, Debug)]
#[command(name = "appose")]
#[command(about = "Cross-process task execution with shared-memory arrays", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Worker program, overriding the configuration
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rotate an N x N ramp image by 90 degrees in a worker
    Rotate {
        /// Environment document (YAML)
        #[arg(long)]
        env: Option<PathBuf>,

        /// Side length of the image
        #[arg(long, default_value_t = 4)]
        size: usize,
    },

    /// Run a script with inline inputs and print its outputs as JSON
    Run {
        /// Environment document (YAML)
        #[arg(long)]
        env: Option<PathBuf>,

        /// Script file
        #[arg(long)]
        script: PathBuf,

        /// Input binding `name=value`; values are parsed as JSON when possible
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("appose=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = ApposeConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(worker) = args.worker {
        config.worker.program = Some(worker);
    }

    match args.command {
        Command::Rotate { env, size } => rotate(&config, env.as_deref(), size).await,
        Command::Run {
            env,
            script,
            inputs,
            timeout,
        } => run(&config, env.as_deref(), &script, inputs, timeout.map(Duration::from_secs)).await,
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn rotate(config: &ApposeConfig, env: Option<&Path>, size: usize) -> Result<()> {
    if size == 0 {
        bail!("--size must be at least 1");
    }
    let resolver = resolver(config);
    let spec = load_spec(env)?;
    let environment = resolver.resolve(&spec).await?;
    let service = environment.service().await?;

    let ramp: Vec<f64> = (0..size * size).map(|i| i as f64).collect();
    let image = NdArray::from_slice(vec![size, size], &ramp)?;
    print_matrix("image", &image)?;

    let task = service.task(ROTATE_SCRIPT, Inputs::new().array("image", image))?;
    log_progress(&task);

    info!("Starting task {}", task.id());
    let started = Instant::now();
    task.start().await?;
    task.wait_for(None).await?;
    info!("Task finished in {:.3} s", started.elapsed().as_secs_f64());

    let rotated = task.outputs()?.array("rotated")?;
    print_matrix("rotated", &rotated)?;

    environment.close().await;
    Ok(())
}

async fn run(
    config: &ApposeConfig,
    env: Option<&Path>,
    script: &Path,
    inputs: Vec<(String, Value)>,
    timeout: Option<Duration>,
) -> Result<()> {
    let code = std::fs::read_to_string(script)
        .with_context(|| format!("reading {}", script.display()))?;
    let resolver = resolver(config);
    let environment = resolver.resolve(&load_spec(env)?).await?;
    let service = environment.service().await?;

    let task = service.task_with_values(code, inputs)?;
    log_progress(&task);
    task.start().await?;
    let outcome = task.wait_for(timeout).await;
    let printed = match outcome {
        Ok(_) => task.outputs().map(|outputs| {
            let json: serde_json::Map<String, serde_json::Value> = outputs
                .values()
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect();
            serde_json::Value::Object(json)
        }),
        Err(e) => Err(e),
    };

    environment.close().await;
    match printed {
        Ok(json) => {
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn resolver(config: &ApposeConfig) -> EnvironmentResolver<ExistingInterpreter> {
    EnvironmentResolver::from_config(config, ExistingInterpreter::new(config.worker_command()))
}

fn load_spec(env: Option<&Path>) -> Result<EnvironmentSpec> {
    Ok(match env {
        Some(path) => EnvironmentSpec::from_file(path)?,
        None => EnvironmentSpec::from_yaml(DEFAULT_ENVIRONMENT)?,
    })
}

fn log_progress(task: &Task) {
    task.on_event(|event| {
        if let Some(message) = &event.message {
            info!(
                "[{}] {:?} {} ({}/{})",
                event.task, event.kind, message, event.current, event.maximum
            );
        }
    });
}

fn parse_input(arg: &str) -> Result<(String, Value), String> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {arg:?}"))?;
    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::try_from(json)?,
        Err(_) => Value::String(raw.to_string()),
    };
    Ok((name.to_string(), value))
}

fn print_matrix(label: &str, array: &NdArray) -> Result<()> {
    println!("{label} {:?} {}:", array.shape(), array.dtype());
    let (rows, cols) = match array.shape() {
        [rows, cols] => (*rows, *cols),
        [len] => (1, *len),
        _ => (1, array.len()),
    };
    for row in 0..rows {
        let cells = (0..cols)
            .map(|col| array.get_f64(row * cols + col).map(|v| format!("{v:6.1}")))
            .collect::<Result<Vec<_>, _>>()?;
        println!("  {}", cells.join(" "));
    }
    Ok(())
}
