//! Command-line front end for an xidlog store.
//!
//! Each invocation opens the store, runs one command, and checkpoints before
//! returning if the command changed anything.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgMatches, Command as Cli};
use tracing::info;
use xidlog::{CommitTime, StoreConfig, TransactionId, TransactionLog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status(TransactionId),
    Commit {
        xid: TransactionId,
        at: Option<CommitTime>,
    },
    Abort(TransactionId),
    CommitTime(TransactionId),
    Extend(TransactionId),
    Checkpoint,
    Truncate(TransactionId),
    Info,
}

impl Command {
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Command::Status(_) | Command::CommitTime(_) | Command::Info
        )
    }
}

fn xid_arg() -> Arg {
    Arg::new("xid")
        .value_name("XID")
        .required(true)
        .value_parser(value_parser!(u32))
        .help("Transaction id")
}

pub fn build_cli() -> Cli {
    Cli::new("xidlog_bin")
        .about("Inspect and update a transaction status log")
        .arg(
            Arg::new("data")
                .long("data")
                .value_name("DIR")
                .help("Data directory (defaults to XIDLOG_DATA_DIR, then ./xidlog_data)"),
        )
        .subcommand_required(true)
        .subcommand(Cli::new("status").about("Print the status of a transaction").arg(xid_arg()))
        .subcommand(
            Cli::new("commit")
                .about("Record a transaction as committed")
                .arg(xid_arg())
                .arg(
                    Arg::new("at")
                        .long("at")
                        .value_name("RFC3339")
                        .help("Commit time (defaults to now)"),
                ),
        )
        .subcommand(Cli::new("abort").about("Record a transaction as aborted").arg(xid_arg()))
        .subcommand(Cli::new("commit-time").about("Print the commit time of a transaction").arg(xid_arg()))
        .subcommand(
            Cli::new("extend")
                .about("Make room for transactions up to XID")
                .arg(xid_arg()),
        )
        .subcommand(Cli::new("checkpoint").about("Write every dirty block to disk"))
        .subcommand(
            Cli::new("truncate")
                .about("Discard segments holding only transactions older than XID")
                .arg(xid_arg()),
        )
        .subcommand(Cli::new("info").about("Print store geometry and size"))
}

fn xid_of(matches: &ArgMatches) -> TransactionId {
    TransactionId(matches.get_one::<u32>("xid").copied().unwrap_or_default())
}

fn parse_time(raw: &str) -> Result<CommitTime> {
    let at = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid commit time {:?}", raw))?;
    Ok(CommitTime::from_datetime(at.with_timezone(&Utc)))
}

/// Reads the store configuration (environment first, then `--data`) and
/// the command from parsed arguments.
pub fn parse(matches: &ArgMatches) -> Result<(StoreConfig, Command)> {
    let mut config = StoreConfig::from_env().context("reading configuration from the environment")?;
    if let Some(dir) = matches.get_one::<String>("data") {
        config.data_dir = dir.into();
    }

    let command = match matches.subcommand() {
        Some(("status", sub)) => Command::Status(xid_of(sub)),
        Some(("commit", sub)) => Command::Commit {
            xid: xid_of(sub),
            at: sub.get_one::<String>("at").map(|raw| parse_time(raw)).transpose()?,
        },
        Some(("abort", sub)) => Command::Abort(xid_of(sub)),
        Some(("commit-time", sub)) => Command::CommitTime(xid_of(sub)),
        Some(("extend", sub)) => Command::Extend(xid_of(sub)),
        Some(("checkpoint", _)) => Command::Checkpoint,
        Some(("truncate", sub)) => Command::Truncate(xid_of(sub)),
        Some(("info", _)) => Command::Info,
        Some((other, _)) => anyhow::bail!("unknown command {:?}", other),
        None => anyhow::bail!("no command given"),
    };
    Ok((config, command))
}

/// Runs one command against the store and returns what to print.
pub fn run(config: StoreConfig, command: &Command) -> Result<String> {
    let log = TransactionLog::open(config.clone())
        .with_context(|| format!("opening store at {}", config.data_dir.display()))?;

    let output = match command {
        Command::Status(xid) => format!("{}: {}", xid, log.get_status(*xid)?),
        Command::Commit { xid, at } => {
            let time = at.unwrap_or_else(CommitTime::now);
            log.record_commit(*xid, time)?;
            format!("{}: committed at {}", xid, time)
        }
        Command::Abort(xid) => {
            log.record_abort(*xid)?;
            format!("{}: aborted", xid)
        }
        Command::CommitTime(xid) => format!("{}: {}", xid, log.get_commit_time(*xid)?),
        Command::Extend(xid) => {
            log.extend(*xid)?;
            format!("extended through {}", xid)
        }
        Command::Checkpoint => format!("wrote {} blocks", log.checkpoint()?),
        Command::Truncate(xid) => {
            let summary = log.truncate(*xid)?;
            format!(
                "removed {} status and {} commit time segments; horizon is now {}",
                summary.status_segments.len(),
                summary.time_segments.len(),
                summary.horizon
            )
        }
        Command::Info => info_report(&log),
    };

    if command.is_mutating() {
        log.close()?;
    }
    info!(?command, "command complete");
    Ok(output)
}

fn info_report(log: &TransactionLog) -> String {
    use xidlog::StoreKind;

    let config = log.config();
    let geometry = log.geometry();
    let status = log.relation(StoreKind::Status);
    let time = log.relation(StoreKind::Time);
    let stats = log.buffers().stats();
    [
        format!("data directory:      {}", config.data_dir.display()),
        format!("block size:          {}", geometry.block_size()),
        format!("blocks per segment:  {}", config.blocks_per_segment),
        format!(
            "status blocks:       {} ({} per block)",
            status.nblocks() - status.first_block(),
            geometry.items_per_block(StoreKind::Status)
        ),
        format!(
            "commit time blocks:  {} ({} per block)",
            time.nblocks() - time.first_block(),
            geometry.items_per_block(StoreKind::Time)
        ),
        format!("oldest transaction:  {}", log.horizon()),
        format!("buffer frames:       {}", log.buffers().capacity()),
        format!("cache hits/misses:   {}/{}", stats.hits, stats.misses),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(args: &[&str]) -> Command {
        let matches = build_cli().try_get_matches_from(args).unwrap();
        parse(&matches).unwrap().1
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_args(&["xidlog_bin", "--data", "d", "status", "5000"]),
            Command::Status(TransactionId(5000))
        );
        assert_eq!(
            parse_args(&["xidlog_bin", "--data", "d", "commit", "7", "--at", "2024-05-01T00:00:00Z"]),
            Command::Commit {
                xid: TransactionId(7),
                at: Some(CommitTime(1_714_521_600_000_000)),
            }
        );
        assert_eq!(parse_args(&["xidlog_bin", "--data", "d", "info"]), Command::Info);
    }

    #[test]
    fn test_bad_arguments_rejected() {
        assert!(build_cli().try_get_matches_from(["xidlog_bin", "status", "-1"]).is_err());
        assert!(build_cli().try_get_matches_from(["xidlog_bin", "--data", "d"]).is_err());

        let matches = build_cli()
            .try_get_matches_from(["xidlog_bin", "--data", "d", "commit", "7", "--at", "yesterday"])
            .unwrap();
        assert!(parse(&matches).is_err());
    }

    #[test]
    fn test_mutating_commands() {
        assert!(Command::Abort(TransactionId(3)).is_mutating());
        assert!(Command::Checkpoint.is_mutating());
        assert!(!Command::Info.is_mutating());
        assert!(!Command::Status(TransactionId(3)).is_mutating());
    }
}
