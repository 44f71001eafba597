//! CLI command definitions for taskpilot
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

pub mod operator;
pub mod task;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use task::TaskCommand;

/// Autonomous task controller for an external coding agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Output format: markdown (default) or json
    #[arg(short, long, default_value = "markdown", global = true)]
    pub format: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller and read operator commands from stdin (default)
    Run(RunArgs),

    /// Manage the task pool
    #[command(subcommand)]
    Task(TaskCommand),

    /// List approval requests
    Approvals(ApprovalsArgs),

    /// Show the action log
    History(HistoryArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Start idle instead of activating immediately
    #[arg(long)]
    pub no_activate: bool,

    /// Agent program to run (overrides config)
    #[arg(long)]
    pub program: Option<String>,

    /// Execution timeout in seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ApprovalsArgs {
    /// Include resolved requests
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of most recent entries to show
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,

    /// Only entries for this task (ignores --limit)
    #[arg(long)]
    pub task: Option<String>,
}
