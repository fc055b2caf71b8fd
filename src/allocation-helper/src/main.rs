// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::{read_to_string, write};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use static_allocator::allocation::Allocation;
use static_allocator::board::Board;
use static_allocator::config::AllocatorConfig;
use static_allocator::scenario::Scenario;
use static_allocator::verify::{VerifyError, verify};
use static_allocator::{AllocationError, ErrorKind};

mod logger;

use crate::logger::{LOGGER, LevelFilter, LoggerConfig, LoggerUpdateError};

const EXIT_CODE_ERROR: i32 = 1;
const EXIT_CODE_CONFLICT: i32 = 2;
const EXIT_CODE_EXHAUSTED: i32 = 3;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Failed to operate file {0}: {1}")]
    FileIo(PathBuf, std::io::Error),
    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("Failed to serialize allocation: {0}")]
    Serialize(serde_json::Error),
    #[error("Failed to configure logger: {0}")]
    Logger(#[from] LoggerUpdateError),
    #[error("Failed to allocate resources: {0}")]
    Allocate(#[from] AllocationError),
    #[error("Allocation check failed: {0}")]
    Verify(#[from] VerifyError),
}

impl Error {
    fn exit_code(&self) -> i32 {
        let kind = match self {
            Error::Allocate(err) => err.kind(),
            Error::Verify(_) => ErrorKind::ConflictDetected,
            _ => return EXIT_CODE_ERROR,
        };
        match kind {
            ErrorKind::ConflictDetected => EXIT_CODE_CONFLICT,
            ErrorKind::ResourceExhausted => EXIT_CODE_EXHAUSTED,
            ErrorKind::InvalidInput | ErrorKind::Strict => EXIT_CODE_ERROR,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    #[command(flatten)]
    log: LogArgs,
}

#[derive(Args)]
struct LogArgs {
    /// Maximum level of the messages logged.
    #[arg(long, global = true, value_name = "LEVEL")]
    level: Option<LevelFilter>,
    /// Path of the file the logs are appended to.
    #[arg(long, global = true, value_name = "PATH")]
    log_path: Option<PathBuf>,
    /// Prefix every message with its level.
    #[arg(long, global = true)]
    show_level: bool,
    /// Prefix every message with its source file and line.
    #[arg(long, global = true)]
    show_log_origin: bool,
}

impl From<LogArgs> for LoggerConfig {
    fn from(args: LogArgs) -> Self {
        LoggerConfig {
            log_path: args.log_path,
            level: args.level,
            show_level: Some(args.show_level),
            show_log_origin: Some(args.show_log_origin),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Allocate the static resources of a scenario.
    Allocate {
        /// Path of the board description.
        #[arg(short, long, value_name = "PATH")]
        board: PathBuf,
        /// Path of the scenario description.
        #[arg(short, long, value_name = "PATH")]
        scenario: PathBuf,
        /// Path of an allocation document whose entries are kept.
        #[arg(short, long, value_name = "PATH")]
        allocation: Option<PathBuf>,
        /// Path of output file.
        #[arg(short, long, value_name = "PATH", default_value = "allocation.json")]
        output: PathBuf,
        /// Path of the allocator configuration file.
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Fail on the first warning.
        #[arg(long)]
        strict: bool,
    },
    /// Check the consistency of an allocation document.
    Verify {
        /// Path of the board description.
        #[arg(short, long, value_name = "PATH")]
        board: PathBuf,
        /// Path of the scenario description.
        #[arg(short, long, value_name = "PATH")]
        scenario: PathBuf,
        /// Path of the allocation document.
        #[arg(short, long, value_name = "PATH")]
        allocation: PathBuf,
    },
}

fn read(path: &Path) -> Result<String> {
    read_to_string(path).map_err(|err| Error::FileIo(path.to_path_buf(), err))
}

fn parse<T>(path: &Path, parser: fn(&str) -> serde_json::Result<T>) -> Result<T> {
    parser(&read(path)?).map_err(|err| Error::Parse(path.to_path_buf(), err))
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Allocate {
            board,
            scenario,
            allocation,
            output,
            config,
            strict,
        } => {
            let board = parse(&board, Board::from_json)?;
            let scenario = parse(&scenario, Scenario::from_json)?;
            let mut allocation = match allocation {
                Some(path) => parse(&path, Allocation::from_json)?,
                None => Allocation::default(),
            };
            let mut config = match config {
                Some(path) => parse(&path, AllocatorConfig::from_json)?,
                None => AllocatorConfig::default(),
            };
            config.strict |= strict;

            let report = static_allocator::allocate(&board, &scenario, &mut allocation, &config)?;
            let json = allocation.to_json().map_err(Error::Serialize)?;
            write(&output, json).map_err(|err| Error::FileIo(output.clone(), err))?;
            log::info!(
                "Wrote {} with {} warning(s)",
                output.display(),
                report.warnings().len()
            );
        }
        Command::Verify {
            board,
            scenario,
            allocation,
        } => {
            let board = parse(&board, Board::from_json)?;
            let scenario = parse(&scenario, Scenario::from_json)?;
            let allocation = parse(&allocation, Allocation::from_json)?;
            verify(&board, &scenario, &allocation)?;
            log::info!("Allocation is consistent");
        }
    };

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = LOGGER.init() {
        eprintln!("Error: Failed to initialize logger: {err}");
        std::process::exit(EXIT_CODE_ERROR);
    }
    let result = LOGGER
        .update(LoggerConfig::from(cli.log))
        .map_err(Error::from)
        .and_then(|()| run(cli.command));

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}
