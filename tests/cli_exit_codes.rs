//! Exit status of the `zero_trainer` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::tempdir;

use zero_trainer::config::NetArgs;
use zero_trainer::PipelineConfig;

/// Small network written as a `--config` file under `dir`.
fn write_config(dir: &Path) -> (PipelineConfig, PathBuf) {
    let mut config = PipelineConfig::connect4(dir);
    config.game_name = "cli".to_string();
    config.train_batch_size = 8;
    config.net = NetArgs {
        input_shape: (2, 3, 3),
        v_size: 3,
        pi_size: 4,
        num_channels: 4,
        depth: 1,
        lr: 0.01,
        cv: 1.0,
    };
    let path = dir.join("config.json");
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    (config, path)
}

fn trainer(args: &[&str], config: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_zero_trainer"))
        .args(args)
        .arg("--allow-cpu")
        .arg("--config")
        .arg(config)
        .output()
        .expect("Failed to run zero_trainer")
}

#[test]
fn createnew_exits_zero_and_writes_checkpoint() {
    let dir = tempdir().unwrap();
    let (config, path) = write_config(dir.path());

    let output = trainer(&["--createnew", "-i", "0"], &path);
    assert_eq!(output.status.code(), Some(0), "{:?}", output);
    assert!(config.checkpoint_path(0).is_file());
    assert!(!config.dataset_dir().exists());
}

#[test]
fn missing_dataset_exits_one() {
    let dir = tempdir().unwrap();
    let (config, path) = write_config(dir.path());
    assert_eq!(trainer(&["--createnew"], &path).status.code(), Some(0));

    let output = trainer(&["-i", "0"], &path);
    assert_eq!(output.status.code(), Some(1), "{:?}", output);
    assert!(!config.checkpoint_path(1).exists());
}

#[test]
fn missing_checkpoint_exits_one() {
    let dir = tempdir().unwrap();
    let (_, path) = write_config(dir.path());
    assert_eq!(trainer(&["-i", "3"], &path).status.code(), Some(1));
}

#[test]
fn unreadable_config_exits_one() {
    let dir = tempdir().unwrap();
    let output = trainer(&["--createnew"], &dir.path().join("absent.json"));
    assert_eq!(output.status.code(), Some(1));
}
