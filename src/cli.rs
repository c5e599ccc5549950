use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sitelog", about = "Turn spoken site notes into worksites, tasks and time entries")]
pub struct Cli {
    /// Config file (default: ~/.sitelog/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a transcript and show the structured command
    Parse {
        #[arg(trailing_var_arg = true, num_args = 1..)]
        transcript: Vec<String>,
    },
    /// Parse a transcript and send it to the server (queued when offline)
    Say {
        #[arg(trailing_var_arg = true, num_args = 1..)]
        transcript: Vec<String>,
        /// Send even when the parse confidence is low
        #[arg(long)]
        yes: bool,
        /// Queue locally without contacting the server
        #[arg(long)]
        offline: bool,
        /// Reuse a matching worksite instead of reporting a conflict
        #[arg(long)]
        existing: bool,
    },
    /// Run the web server
    Serve {
        /// Port to serve on (default from config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect and reconcile the offline queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Sync the offline queue whenever connectivity comes back
    Watch,
    /// List worksites
    Worksites {
        /// Bypass the local cache
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Subcommand)]
pub enum QueueAction {
    /// Show queued entries
    List {
        /// Include entries that were already synced
        #[arg(long)]
        all: bool,
    },
    /// Replay unsynced entries now
    Sync,
    /// Delete synced entries older than N days
    Purge {
        #[arg(long, default_value = "7")]
        days: u32,
    },
    /// Queue a raw write (entry, receipt, material, task, command)
    Add {
        #[arg(value_name = "TYPE")]
        entry_type: String,
        /// JSON payload
        payload: String,
    },
}
