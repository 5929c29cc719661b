use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::styles;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Arguments for the warmbox command
#[derive(Debug, Parser)]
#[command(name = "warmbox", author, version, about, styles = styles::styles())]
pub struct WarmboxArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: WarmboxSubcommand,

    /// Path to the config file. Defaults to `<warmbox home>/warmbox.yaml`
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log more (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum WarmboxSubcommand {
    /// Create a zygote and leaves forked from it, then wait for Ctrl-C
    Run {
        /// Directory with the code the leaves run
        #[arg(long)]
        code_dir: PathBuf,

        /// Number of leaves to fork from the zygote
        #[arg(long, default_value_t = 1)]
        leaves: usize,

        /// Memory limit of each leaf in MiB. Defaults to the pool's default
        #[arg(long)]
        mem_limit_mb: Option<u64>,
    },

    /// Start a pre-warm cache, take sandboxes from it, then wait for Ctrl-C
    Prewarm {
        /// Number of sandboxes to take from the cache
        #[arg(long, default_value_t = 1)]
        take: usize,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WarmboxArgs {
    /// The log level picked by the verbosity flags, or `None` if no flag was given.
    pub fn log_level(&self) -> Option<&'static str> {
        match (self.quiet, self.verbose) {
            (true, _) => Some("error"),
            (false, 0) => None,
            (false, 1) => Some("debug"),
            (false, _) => Some("trace"),
        }
    }

    /// The tracing filter for the warmbox crates at `level`.
    pub fn log_filter(level: &str) -> String {
        format!(
            "warmbox={level},warmbox_core={level},warmbox_cli={level},warmbox_utils={level}",
            level = level
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
