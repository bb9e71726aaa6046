use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use zero_trainer::config::{GamePreset, PipelineConfig};
use zero_trainer::logging::setup_logging;
use zero_trainer::pipeline::{select_device, Pipeline};
use zero_trainer::Result;

#[derive(Parser, Debug)]
#[command(name = "zero_trainer", version, about = "Resample self-play data and train the next model")]
struct Args {
    /// Iteration whose checkpoint and dataset are used
    #[arg(short = 'i', long, default_value_t = 0)]
    iteration: u32,

    /// Write a fresh model as checkpoint `iteration` and exit
    #[arg(long, default_value_t = false)]
    createnew: bool,

    /// Game preset
    #[arg(long, value_enum, default_value = "shadow")]
    game: GamePreset,

    /// Root directory holding checkpoint/ and dataset/ (ignored with --config)
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Full JSON configuration replacing the preset
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run on the CPU when CUDA is not available
    #[arg(long, default_value_t = false)]
    allow_cpu: bool,

    /// Seed for resampling and batch shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Also write rotating log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::preset(args.game, &args.data_dir),
    };
    if args.seed.is_some() {
        config.seed = args.seed;
    }

    let device = select_device(args.allow_cpu)?;
    let pipeline = Pipeline::new(config, device)?;

    if args.createnew {
        pipeline.create_new(args.iteration)?;
        return Ok(());
    }

    let mut rng = pipeline.rng();
    let report = pipeline.run_iteration(args.iteration, &mut rng)?;
    log::info!(
        "Iteration {:04}: {} resampled samples, window {}..={} ({} samples), {} steps, final loss {:.4}",
        report.iteration,
        report.resample.total(),
        report.window.start(),
        report.window.end(),
        report.window_samples,
        report.training.steps,
        report.training.mean_total_loss(report.value_weight)
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let _logger = match setup_logging(args.log_dir.as_deref()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("failed to initialise logging: {}", e);
            None
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("❌ {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
