// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use log::{Log, Metadata, Record};

/// Default level filter of the logger.
pub const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Warn;
/// Tag printed in front of every message.
const LOG_TAG: &str = "allocation-helper";

/// The logger.
pub static LOGGER: Logger = Logger(Mutex::new(LoggerConfiguration {
    target: None,
    format: LogFormat {
        show_level: false,
        show_log_origin: false,
    },
}));

/// Error type for [`Logger::init`].
pub type LoggerInitError = log::SetLoggerError;

/// Error type for [`Logger::update`].
#[derive(Debug, thiserror::Error)]
#[error("Failed to open log file: {0}")]
pub struct LoggerUpdateError(pub std::io::Error);

impl Logger {
    /// Installs the logger as the `log` backend.
    pub fn init(&'static self) -> Result<(), LoggerInitError> {
        log::set_logger(self)?;
        log::set_max_level(DEFAULT_LEVEL);
        Ok(())
    }

    /// Applies the given logger configuration to the logger.
    pub fn update(&self, config: LoggerConfig) -> Result<(), LoggerUpdateError> {
        log::set_max_level(
            config
                .level
                .map(log::LevelFilter::from)
                .unwrap_or(DEFAULT_LEVEL),
        );

        let target = match config.log_path {
            Some(path) => Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(LoggerUpdateError)?,
            ),
            None => None,
        };

        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if target.is_some() {
            guard.target = target;
        }
        if let Some(show_level) = config.show_level {
            guard.format.show_level = show_level;
        }
        if let Some(show_log_origin) = config.show_log_origin {
            guard.format.show_log_origin = show_log_origin;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct LogFormat {
    pub show_level: bool,
    pub show_log_origin: bool,
}

#[derive(Debug)]
pub struct LoggerConfiguration {
    pub target: Option<File>,
    pub format: LogFormat,
}

#[derive(Debug)]
pub struct Logger(pub Mutex<LoggerConfiguration>);

impl Logger {
    fn format(format: &LogFormat, record: &Record) -> String {
        let level = match format.show_level {
            true => format!(":{}", record.level()),
            false => String::new(),
        };
        let origin = match format.show_log_origin {
            true => {
                let file = record.file().unwrap_or("?");
                let line = record
                    .line()
                    .map_or_else(|| String::from("?"), |line| line.to_string());
                format!(":{file}:{line}")
            }
            false => String::new(),
        };
        format!("[{LOG_TAG}{level}{origin}] {}\n", record.args())
    }
}

impl Log for Logger {
    // Filtering is left to `log::max_level`.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let message = Self::format(&guard.format, record);
        // A failed log write has nowhere to be reported.
        let _ = match &mut guard.target {
            Some(file) => file.write_all(message.as_bytes()),
            None => std::io::stderr().write_all(message.as_bytes()),
        };
    }

    fn flush(&self) {}
}

/// Logger settings given on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoggerConfig {
    /// File the logs are appended to, stderr if absent.
    pub log_path: Option<PathBuf>,
    pub level: Option<LevelFilter>,
    pub show_level: Option<bool>,
    pub show_log_origin: Option<bool>,
}

/// Level filter accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelFilter {
    /// [`log::LevelFilter::Off`]
    Off,
    /// [`log::LevelFilter::Trace`]
    Trace,
    /// [`log::LevelFilter::Debug`]
    Debug,
    /// [`log::LevelFilter::Info`]
    Info,
    /// [`log::LevelFilter::Warn`]
    Warn,
    /// [`log::LevelFilter::Error`]
    Error,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(filter: LevelFilter) -> log::LevelFilter {
        match filter {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Trace => log::LevelFilter::Trace,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Error => log::LevelFilter::Error,
        }
    }
}

/// Error type for [`<LevelFilter as FromStr>::from_str`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse string to level filter: {0}")]
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LevelFilterFromStrError(String::from(s))),
        }
    }
}
