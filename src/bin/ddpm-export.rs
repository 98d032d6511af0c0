use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use ddpm_rs::export::{save_grid, save_individual};
use ddpm_rs::images::latent_to_images;
use ddpm_rs::pipeline::DdpmPipeline;
use ddpm_rs::sampler::SampleOptions;
use ddpm_rs::utils::device;

#[derive(Parser)]
#[command(author, version, about = "Export DDPM samples and a grid image", long_about = None)]
struct Args {
    /// The pretrained model to sample from.
    #[arg(long, default_value = "google/ddpm-cifar10-32")]
    model_id: String,

    /// Total number of images to generate.
    #[arg(long, default_value_t = 9)]
    num_images: usize,

    /// Number of reverse-diffusion steps per image; fewer steps are faster
    /// but leave more residual noise.
    #[arg(long, default_value_t = 50)]
    num_steps: usize,

    /// Seed for reproducible sampling.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 3)]
    grid_rows: usize,

    #[arg(long, default_value_t = 3)]
    grid_cols: usize,

    /// Directory receiving the individual samples and the grid image.
    #[arg(long, default_value = "outputs/ddpm_samples")]
    output_dir: PathBuf,

    /// Where model weights are cached; defaults to the hub cache.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn run(args: Args) -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt::init();
        None
    };

    let device = device(args.cpu)?;
    let pipeline = DdpmPipeline::from_pretrained(&args.model_id, args.cache_dir.as_deref(), &device)?;

    let result = pipeline.generate(&SampleOptions {
        batch_size: args.num_images,
        num_inference_steps: args.num_steps,
        seed: args.seed,
    })?;
    let images = latent_to_images(&result.latents)?;

    let paths = save_individual(&images, &args.output_dir)?;
    println!("Saved {} images to {}", paths.len(), args.output_dir.display());

    let grid_path = args.output_dir.join("ddpm_samples_grid.png");
    save_grid(&images, args.grid_rows, args.grid_cols, &grid_path)?;
    println!("Saved grid image to {}", grid_path.display());
    Ok(())
}

fn main() -> Result<()> {
    run(Args::parse())
}
