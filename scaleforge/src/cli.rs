use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use scaleforge_core::hash;
use scaleforge_pipeline::{
    BackendChoice, JobQueue, JobStore, PlanItem, collect_images, select, select_backend,
};
use scaleforge_runtime::{Manifest, ModelStore};

use crate::config::Config;

const DEFAULT_MODEL: &str = "realesrgan-x4plus";

#[derive(Parser)]
#[command(
    name = "scaleforge",
    version,
    about = "AI-powered image upscaler using Real-ESRGAN"
)]
pub struct Cli {
    /// Path to the config file (defaults to ./scaleforge.toml).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upscale images through the persistent job queue.
    Run(RunArgs),
    /// Manage model weights.
    #[command(subcommand)]
    Model(ModelCommand),
    /// Show the selected backend and GPU capabilities.
    DetectBackend {
        /// Force fresh detection instead of the cached result.
        #[arg(long)]
        probe: bool,
        /// Machine-readable output.
        #[arg(long)]
        json: bool,
    },
    /// Show configuration and environment information.
    Info,
}

#[derive(Args)]
struct RunArgs {
    /// Input file(s) or directory(ies) to process.
    #[arg(short, long = "input", value_name = "PATH")]
    inputs: Vec<PathBuf>,

    /// Inputs may also be given positionally.
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Output directory for processed files.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Model to use (see `scaleforge model list`).
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Upscale factor.
    #[arg(long, default_value_t = 2)]
    scale: u32,

    /// Number of parallel workers (default: CPU cores).
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Tile side length for memory-bounded inference.
    #[arg(long)]
    tile: Option<usize>,

    /// Resume a previous interrupted run without enqueueing new jobs.
    #[arg(long)]
    resume: bool,

    /// Force a specific backend (esrgan, ncnn, resize).
    #[arg(long, value_name = "BACKEND")]
    force_backend: Option<String>,

    /// Force CPU inference even when a GPU is available.
    #[arg(long)]
    cpu: bool,

    /// Reset the job tracking database before enqueueing.
    #[arg(long)]
    reset_db: bool,

    /// Print the planned operations as JSON and exit.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum ModelCommand {
    /// List registry models and their download state.
    List,
    /// Download and verify a model.
    Install { name: String },
    /// Compute the SHA-256 of a local file.
    Hash { path: PathBuf },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => cmd_run(config, args).await,
        Command::Model(command) => cmd_model(config, command).await,
        Command::DetectBackend { probe, json } => cmd_detect_backend(config, probe, json).await,
        Command::Info => cmd_info(config).await,
    }
}

fn load_manifest(config: &Config) -> anyhow::Result<Manifest> {
    let builtin = Manifest::builtin();
    if !config.registry_path.is_file() {
        return Ok(builtin);
    }
    let text = std::fs::read_to_string(&config.registry_path)
        .with_context(|| format!("failed to read {}", config.registry_path.display()))?;
    let user = Manifest::parse(&text)
        .with_context(|| format!("invalid registry {}", config.registry_path.display()))?;
    Ok(builtin.merged_with(user))
}

fn parse_force(raw: Option<&str>) -> anyhow::Result<Option<BackendChoice>> {
    raw.map(|value| {
        BackendChoice::from_str(value)
            .map_err(|_| anyhow::anyhow!("unknown backend {value} (use esrgan, ncnn, or resize)"))
    })
    .transpose()
}

async fn cmd_run(config: Config, args: RunArgs) -> anyhow::Result<()> {
    if args.scale != 2 && args.scale != 4 {
        bail!("--scale must be 2 or 4");
    }

    let mut inputs = args.inputs.clone();
    inputs.extend(args.paths.iter().cloned());
    if inputs.is_empty() {
        bail!("no input files provided (try `scaleforge run photos/ -o upscaled/`)");
    }

    let missing: Vec<String> = inputs
        .iter()
        .filter(|path| !path.exists())
        .map(|path| path.display().to_string())
        .collect();
    if !missing.is_empty() {
        bail!("input files not found: {}", missing.join(", "));
    }

    let out_dir = args.output.clone().unwrap_or_else(|| config.output_dir.clone());
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("cannot create output directory {}", out_dir.display()))?;

    let files = collect_images(&inputs);
    if files.is_empty() {
        bail!("no supported images found in the given inputs");
    }

    let plan: Vec<PlanItem> = files
        .iter()
        .map(|src| PlanItem {
            src: src.clone(),
            dst: src
                .file_name()
                .map(|name| out_dir.join(name))
                .unwrap_or_else(|| out_dir.join("output.png")),
            scale: args.scale,
        })
        .collect();

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let manifest = load_manifest(&config)?;
    manifest
        .get(&args.model)
        .with_context(|| format!("available models: {}", manifest.names().collect::<Vec<_>>().join(", ")))?;
    let store = Arc::new(ModelStore::new(&config.model_dir, manifest));

    let job_store = Arc::new(JobStore::open(&config.database_path)?);
    if args.reset_db {
        job_store.reset()?;
        println!("job database reset");
    }

    let force = parse_force(args.force_backend.as_deref())?;
    let backend = select_backend(&store, &args.model, force, args.cpu).await?;
    tracing::info!(backend = backend.name(), "using {}", backend.description());

    // Fetch weights up front so workers never race the first download.
    if backend.name() == "esrgan" && !store.is_downloaded(&args.model)? {
        println!("downloading model {}", args.model);
        store.ensure_model(&args.model).await?;
    }

    let concurrency = args.concurrency.unwrap_or_else(num_cpus::get);
    let queue = JobQueue::new(
        Arc::clone(&job_store),
        backend,
        concurrency,
        Some(args.model.clone()),
        args.tile,
    );

    if !args.resume {
        let report = queue.enqueue(&plan)?;
        if report.skipped > 0 {
            println!("{} file(s) already processed, skipped", report.skipped);
        }
        println!("{} job(s) queued, {} worker(s)", report.queued, concurrency);
    }

    let summary = queue.run().await?;
    println!(
        "done: {}  failed: {}  pending: {}",
        summary.done, summary.failed, summary.pending
    );
    if !summary.all_done() {
        bail!("{} job(s) did not complete", summary.failed + summary.pending);
    }
    Ok(())
}

async fn cmd_model(config: Config, command: ModelCommand) -> anyhow::Result<()> {
    match command {
        ModelCommand::List => {
            let manifest = load_manifest(&config)?;
            let store = ModelStore::new(&config.model_dir, manifest);
            for entry in &store.manifest().models {
                let state = if store.is_downloaded(&entry.name)? {
                    "installed"
                } else {
                    "not installed"
                };
                println!("{:<28} {}", entry.name, state);
            }
            Ok(())
        }
        ModelCommand::Install { name } => {
            let manifest = load_manifest(&config)?;
            let store = ModelStore::new(&config.model_dir, manifest);
            if store.is_downloaded(&name)? {
                println!("model already downloaded: {name}");
                return Ok(());
            }
            let path = store.ensure_model(&name).await?;
            println!("installed {name} -> {}", path.display());
            Ok(())
        }
        ModelCommand::Hash { path } => {
            let digest = hash::sha256_file(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            println!("{digest}");
            Ok(())
        }
    }
}

async fn cmd_detect_backend(config: Config, probe: bool, json: bool) -> anyhow::Result<()> {
    let manifest = load_manifest(&config)?;
    let store = Arc::new(ModelStore::new(&config.model_dir, manifest));
    let backend = select_backend(&store, DEFAULT_MODEL, None, false).await?;

    let caps = select::detect_caps(&config.app_root, backend.name(), probe);
    if json {
        println!("{}", serde_json::to_string_pretty(&caps)?);
    } else {
        println!(
            "backend={} vendor={} tile={} mpx={:.1} (detected {})",
            caps.backend, caps.vendor, caps.max_tile_size, caps.max_megapixels, caps.detected_at
        );
    }
    Ok(())
}

async fn cmd_info(config: Config) -> anyhow::Result<()> {
    let manifest = load_manifest(&config)?;
    let store = Arc::new(ModelStore::new(&config.model_dir, manifest));
    let backend = select_backend(&store, DEFAULT_MODEL, None, false).await?;

    println!("scaleforge {}", env!("CARGO_PKG_VERSION"));
    println!("backend: {}", backend.description());
    println!("database: {}", config.database_path.display());
    println!("logs: {}", config.log_dir.display());
    println!("models: {}", config.model_dir.display());
    println!("outputs: {}", config.output_dir.display());
    println!("os: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    Ok(())
}
