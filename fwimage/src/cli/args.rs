/*
 * SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use crate::cli::{completion, image, key, mfg, mmr};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Level and message only.
    #[default]
    Short,
    /// Timestamp, level, module path, and message.
    Long,
}

/// Send log messages to stderr so that they don't mix with command output.
pub fn init_logging(log_level: LogLevel, log_format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(log_level));

    match log_format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Long => builder.init(),
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Completion(completion::CompletionCli),
    Image(image::ImageCli),
    Key(key::KeyCli),
    Mfg(mfg::MfgCli),
    Mmr(mmr::MmrCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", default_value_t, value_enum)]
    pub log_format: LogFormat,
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level, cli.log_format);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Completion(c) => completion::completion_main(&c),
        Command::Image(c) => image::image_main(&c),
        Command::Key(c) => key::key_main(&c),
        Command::Mfg(c) => mfg::mfg_main(&c),
        Command::Mmr(c) => mmr::mmr_main(&c),
    }
}
