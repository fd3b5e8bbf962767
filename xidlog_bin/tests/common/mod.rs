#![allow(dead_code)]

use std::path::Path;
use std::process::{Command, Output};

use tempfile::{tempdir, TempDir};
use xidlog::{StoreConfig, TransactionLog};

/// A store in a scratch directory that is removed when the store is
/// dropped.
pub struct TestStore {
    pub log: TransactionLog,
    pub config: StoreConfig,
    pub dir: TempDir,
}

impl TestStore {
    /// Closes the store and opens it again from disk.
    pub fn reopen(self) -> TestStore {
        let TestStore { log, config, dir } = self;
        log.close().unwrap();
        let log = TransactionLog::open(config.clone()).unwrap();
        TestStore { log, config, dir }
    }
}

/// Small blocks (4096 statuses, 128 commit times), two blocks per segment.
pub fn small_config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir)
        .with_block_size(1024)
        .with_buffer_capacity(8)
        .with_blocks_per_segment(2)
}

pub fn setup_store() -> TestStore {
    let dir = tempdir().unwrap();
    let config = small_config(dir.path());
    let log = TransactionLog::open(config.clone()).unwrap();
    TestStore { log, config, dir }
}

pub fn setup_store_with(configure: impl FnOnce(StoreConfig) -> StoreConfig) -> TestStore {
    let dir = tempdir().unwrap();
    let config = configure(small_config(dir.path()));
    let log = TransactionLog::open(config.clone()).unwrap();
    TestStore { log, config, dir }
}

/// Runs the command-line binary against `data_dir`.
pub fn run_cli(data_dir: &Path, args: &[&str]) -> Output {
    run_cli_with_env(data_dir, args, &[])
}

pub fn run_cli_with_env(data_dir: &Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_xidlog_bin"))
        .arg("--data")
        .arg(data_dir)
        .args(args)
        .env("XIDLOG_BLOCK_SIZE", "1024")
        .env("XIDLOG_BLOCKS_PER_SEGMENT", "2")
        .env("RUST_LOG", "warn")
        .envs(env.iter().copied())
        .output()
        .expect("failed to run xidlog_bin")
}

pub fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
