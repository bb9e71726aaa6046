use std::path::PathBuf;

use clap::Parser;
use tch::{Kind, Tensor};

use zero_trainer::data::resample::read_marker;
use zero_trainer::data::shard_store::ShardStore;

/// Print the shards, marker and tensor statistics of iteration dataset folders.
#[derive(Parser, Debug)]
#[command(name = "inspect_dataset")]
struct Args {
    /// Dataset folders, e.g. data/dataset/0003 or data/dataset/0003_raw
    #[arg(required = true)]
    folders: Vec<PathBuf>,

    /// Number of samples to preview per folder
    #[arg(long, default_value_t = 3)]
    preview: i64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    // Reading never flushes, the batch size is irrelevant here
    let store = ShardStore::new(1);

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                  Iteration dataset inspection              ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    for folder in &args.folders {
        println!("📁 Folder: {}", folder.display());

        match read_marker(folder) {
            Ok(Some(total)) => println!("  ✅ Resampled: total_out={}", total),
            Ok(None) => println!("  ⏳ No resample marker"),
            Err(err) => println!("  ❌ Marker unreadable: {}", err),
        }

        let dataset = match store.read(folder) {
            Ok(dataset) => dataset,
            Err(err) => {
                println!("  ❌ {}\n", err);
                continue;
            }
        };

        println!("  📦 Shards: {}", dataset.shard_files().len());
        for shard in dataset.shard_files() {
            println!("     #{:04}  {} samples", shard.batch_index, shard.size);
        }
        println!("  📈 Total samples: {}", dataset.total_samples());

        let first = match dataset.shards().next() {
            Some(Ok(batch)) => batch,
            Some(Err(err)) => {
                println!("  ❌ Cannot load first shard: {}\n", err);
                continue;
            }
            None => continue,
        };

        for (label, tensor) in [
            ("context", &first.context),
            ("value", &first.value),
            ("policy", &first.policy),
        ] {
            let (min_val, max_val, mean_val) = sample_stats(tensor);
            println!(
                "  📊 {:<8} shape [{}] {:?}  min={:.4} max={:.4} mean={:.4}",
                label,
                shape_string(tensor),
                tensor.kind(),
                min_val,
                max_val,
                mean_val
            );
        }

        let preview = args.preview.min(first.len() as i64);
        if preview > 0 {
            println!("\n  🔍 First {} samples:", preview);
            for idx in 0..preview {
                let value = first.value.get(idx);
                let policy = first.policy.get(idx);
                let best_move = policy.argmax(0, false).int64_value(&[]);
                println!(
                    "     #{}: value={:?} policy sum={:.4} argmax={}",
                    idx + 1,
                    Vec::<f32>::try_from(&value.to_kind(Kind::Float)).unwrap_or_default(),
                    policy.sum(Kind::Float).double_value(&[]),
                    best_move
                );
            }
        }
        println!();
    }

    Ok(())
}

fn shape_string(tensor: &Tensor) -> String {
    tensor
        .size()
        .into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(" × ")
}

fn sample_stats(tensor: &Tensor) -> (f64, f64, f64) {
    if tensor.numel() == 0 {
        return (0.0, 0.0, 0.0);
    }
    let tensor = tensor.to_kind(Kind::Float);
    let min_val = tensor.min().double_value(&[]);
    let max_val = tensor.max().double_value(&[]);
    let mean_val = tensor.mean(Kind::Float).double_value(&[]);
    (min_val, max_val, mean_val)
}
