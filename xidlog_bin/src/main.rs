//! Entry point for the xidlog command-line tool.
//!
//! Logging goes to stderr and is filtered by `RUST_LOG` (default `info`);
//! command output goes to stdout.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};
use xidlog_bin::{build_cli, parse, run};

fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let (config, command) = parse(&matches)?;
    let output = run(config, &command)?;
    println!("{}", output);
    Ok(())
}
