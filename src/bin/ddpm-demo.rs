use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use ddpm_rs::pipeline::{DdpmPipeline, GenerateRequest};
use ddpm_rs::utils::device;

/// Minimal DDPM sampling demo: download a pretrained model and generate a
/// single image.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "google/ddpm-cifar10-32")]
    model_id: String,

    #[arg(long, default_value = "outputs/ddpm_sample.png")]
    output: PathBuf,

    #[arg(long, default_value_t = 50)]
    num_steps: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = device(args.cpu)?;
    let pipeline = DdpmPipeline::from_pretrained(&args.model_id, args.cache_dir.as_deref(), &device)?;
    let response = pipeline.handle_generate_request(&GenerateRequest {
        num_inference_steps: args.num_steps,
        batch_size: 1,
        seed: args.seed,
    })?;

    if let Some(parent) = args.output.parent() {
        fs::create_dir_all(parent)?;
    }
    response.images[0].save(&args.output)?;
    println!("Saved DDPM sample to {}", args.output.display());
    Ok(())
}
