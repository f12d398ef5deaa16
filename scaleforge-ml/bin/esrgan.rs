use std::path::PathBuf;

use clap::Parser;
use scaleforge_ml::{device, esrgan::Esrgan};

#[derive(Parser)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Safetensors weights file.
    #[arg(short, long, value_name = "FILE")]
    weights: PathBuf,

    #[arg(long, default_value_t = 64)]
    num_feat: usize,

    #[arg(long, default_value_t = 23)]
    num_block: usize,

    /// Process in tiles of this many pixels per side.
    #[arg(long)]
    tile: Option<usize>,

    #[arg(long, default_value_t = false)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    let device = device(cli.cpu)?;
    let model = Esrgan::load(&cli.weights, device, cli.num_feat, cli.num_block, 4)?;
    let image = image::open(&cli.input)?;

    let output = model.inference(&image, cli.tile)?;
    output.save(&cli.output)?;

    Ok(())
}
