//! CLI argument parsing with clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "appfence")]
#[command(author, version, about = "Usage-driven per-application network firewall")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the daemon in the foreground
    Run,

    /// Show firewall and usage status
    Status {
        /// Print the raw status report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Enable the firewall (allow window first, then block)
    Enable,

    /// Disable the firewall and remove all rules
    Disable,

    /// Block rarely used apps immediately
    Block,

    /// Allow all traffic for one allow duration, then block again
    Allow,

    /// Exempt one app from blocking until its cooldown ends
    Unblock {
        /// Package id to unblock
        package: String,
    },

    /// Switch manual unblock mode
    Manual {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Set the allow duration (e.g. 4d, 12h, 90m)
    Duration {
        /// Interval with suffix s, m, h or d
        value: String,
    },

    /// Switch traffic metrics collection
    Metrics {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Manage apps that are never blocked
    Allowlist {
        #[command(subcommand)]
        action: AllowlistAction,
    },

    /// Re-evaluate app usage now
    Refresh,

    /// Show version
    Version,
}

#[derive(Subcommand)]
pub enum AllowlistAction {
    /// Add a package to the allowlist
    Add {
        /// Package id to add
        package: String,
    },
    /// Remove a package from the allowlist
    Del {
        /// Package id to remove
        package: String,
    },
    /// List allowlisted packages
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn is_on(self) -> bool {
        self == Toggle::On
    }
}
