// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "nils", version, about = "Session engine daemon for a local AI coding agent")]
pub struct Cli {
    /// Explicit config file, merged on top of the discovered layers.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG / NILS_LOG still win).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API daemon (the default).
    Serve {
        /// Listen address, e.g. 127.0.0.1:4096
        #[arg(long)]
        addr: Option<String>,
        /// Data directory override.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the one-shot legacy JSON import and exit.
    Import {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the merged configuration.
    ShowConfig,
}
