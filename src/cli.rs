//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::model::Port;

/// portlock - file-based locks and port allocation for process coordination.
#[derive(Parser, Debug)]
#[command(name = "plock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output as JSON for scripting
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// File-based lock operations.
    #[command(subcommand, visible_alias = "l")]
    Lock(LockCommand),

    /// Shared port registry operations.
    #[command(subcommand, visible_alias = "p")]
    Port(PortCommand),
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Take the lock if it is free; fail immediately otherwise.
    #[command(name = "try", visible_alias = "t")]
    Try {
        /// Path of the lock file
        path: PathBuf,

        /// Short label recorded with the lock
        #[arg(long)]
        tag: Option<String>,
    },

    /// Acquire the lock, retrying until the timeout elapses.
    #[command(visible_alias = "a")]
    Acquire {
        /// Path of the lock file
        path: PathBuf,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout: u64,

        /// Short label recorded with the lock
        #[arg(long)]
        tag: Option<String>,
    },

    /// Release a held lock.
    #[command(visible_alias = "r")]
    Release {
        /// Path of the lock file
        path: PathBuf,

        /// Release even if another process holds the lock
        #[arg(long)]
        force: bool,
    },

    /// Show who holds the lock, if anyone.
    #[command(visible_alias = "s")]
    Status {
        /// Path of the lock file
        path: PathBuf,
    },

    /// Remove the lock if stale, plus any orphaned temp files.
    #[command(visible_alias = "c")]
    Clean {
        /// Path of the lock file
        path: PathBuf,
    },
}

/// Flags shared by every port registry command.
#[derive(Args, Debug, Clone)]
pub struct RegistryOpts {
    /// Lowest allocatable port
    #[arg(long)]
    pub min_port: Option<u16>,

    /// Highest allocatable port
    #[arg(long)]
    pub max_port: Option<u16>,

    /// Allow allocation below port 1024
    #[arg(long)]
    pub allow_privileged: bool,

    /// Directory holding the registry and its lock (default: ~/.portlock)
    #[arg(long)]
    pub registry_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum PortCommand {
    /// Allocate one or more free ports to this process.
    #[command(visible_alias = "g")]
    Get {
        /// How many ports to allocate in one batch
        #[arg(long, default_value = "1")]
        count: usize,

        /// Short label recorded with each allocation
        #[arg(long)]
        tag: Option<String>,

        #[command(flatten)]
        opts: RegistryOpts,
    },

    /// Release a port owned by this process.
    #[command(visible_alias = "r")]
    Release {
        /// The allocated port number
        port: Port,

        #[command(flatten)]
        opts: RegistryOpts,
    },

    /// Release every port owned by this process.
    #[command(name = "release-all", visible_alias = "ra")]
    ReleaseAll {
        #[command(flatten)]
        opts: RegistryOpts,
    },

    /// List all registry entries.
    #[command(visible_alias = "ls")]
    List {
        #[command(flatten)]
        opts: RegistryOpts,
    },

    /// Remove stale entries from the registry.
    #[command(visible_alias = "c")]
    Clean {
        #[command(flatten)]
        opts: RegistryOpts,
    },

    /// Show registry counters and the configured range.
    #[command(visible_alias = "s")]
    Status {
        #[command(flatten)]
        opts: RegistryOpts,
    },

    /// Empty the registry entirely, ignoring ownership.
    Clear {
        #[command(flatten)]
        opts: RegistryOpts,
    },
}
