use clap::Parser;

use zero_trainer::config::{GamePreset, PipelineConfig};
use zero_trainer::data::window::{hist_size, window_range};

/// Print the replay window size for a span of iterations.
#[derive(Parser, Debug)]
#[command(name = "window_curve")]
struct Args {
    #[arg(long, value_enum, default_value = "shadow")]
    game: GamePreset,

    /// First iteration to print
    #[arg(long, default_value_t = 0)]
    from: u32,

    /// Last iteration to print
    #[arg(long, default_value_t = 40)]
    to: u32,

    /// Override the preset's alpha
    #[arg(long)]
    alpha: Option<f64>,

    /// Override the preset's beta
    #[arg(long)]
    beta: Option<f64>,

    /// Override the preset's scalar
    #[arg(long)]
    scalar: Option<f64>,

    /// Override the preset's lag adjustment
    #[arg(long)]
    lag: Option<u32>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = PipelineConfig::preset(args.game, "data");
    let curve = &mut config.window;
    curve.alpha = args.alpha.unwrap_or(curve.alpha);
    curve.beta = args.beta.unwrap_or(curve.beta);
    curve.scalar = args.scalar.unwrap_or(curve.scalar);
    curve.lag_adjustment = args.lag.unwrap_or(curve.lag_adjustment);
    config.validate()?;

    let curve = config.window;
    println!(
        "📐 {} window: alpha={} beta={} scalar={} lag={}",
        config.game_name, curve.alpha, curve.beta, curve.scalar, curve.lag_adjustment
    );
    println!("{:>9} {:>9}  window", "iteration", "history");

    let mut previous = None;
    for iteration in args.from..=args.to {
        let size = hist_size(iteration, &curve);
        let range = window_range(iteration, &curve);
        let marker = match previous {
            Some(prev) if size > prev => "+",
            _ => "",
        };
        println!(
            "{:>9} {:>9}  {}..={} {}",
            iteration,
            size,
            range.start(),
            range.end(),
            marker
        );
        previous = Some(size);
    }
    Ok(())
}
