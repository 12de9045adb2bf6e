use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tasklane", about = "Offline-first task manager", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level for diagnostics on stderr (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Task management commands
    Task {
        #[command(subcommand)]
        cmd: TaskCommand,
    },

    /// Sync queue, conflicts and daemon
    Sync {
        #[command(subcommand)]
        cmd: SyncCommand,
    },
}

#[derive(Clone, Subcommand)]
pub enum TaskCommand {
    /// Add a task
    Add {
        /// Task summary
        summary: String,

        /// List the task belongs to
        #[arg(long, default_value = "default")]
        list: String,

        #[arg(long)]
        description: Option<String>,

        /// 1 (highest) to 9 (lowest)
        #[arg(long)]
        priority: Option<u8>,

        /// Due date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        due: Option<String>,
    },

    /// List tasks
    List {
        /// Only tasks in this list
        #[arg(long)]
        list: Option<String>,

        /// Only tasks with this status
        #[arg(long)]
        status: Option<String>,

        /// Include completed and cancelled tasks
        #[arg(long)]
        all: bool,
    },

    /// Show one task
    Show {
        /// Local task id
        id: u64,
    },

    /// Change fields of a task
    Update {
        /// Local task id
        id: u64,

        #[arg(long)]
        summary: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        priority: Option<u8>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        due: Option<String>,
    },

    /// Mark a task completed
    Done {
        /// Local task id
        id: u64,
    },

    /// Delete a task
    Delete {
        /// Local task id
        id: u64,
    },
}

#[derive(Clone, Subcommand)]
pub enum SyncCommand {
    /// Show sync state
    Status {
        /// Include daemon and conflict details
        #[arg(long, short)]
        verbose: bool,
    },

    /// Show or clear pending operations
    Queue {
        #[command(subcommand)]
        cmd: Option<QueueCommand>,
    },

    /// Show or resolve pending conflicts
    Conflicts {
        #[command(subcommand)]
        cmd: Option<ConflictsCommand>,
    },

    /// Background sync daemon
    Daemon {
        #[command(subcommand)]
        cmd: DaemonCommand,
    },

    /// Run one reconciliation pass in the foreground
    Now,
}

#[derive(Clone, Subcommand)]
pub enum QueueCommand {
    /// Discard every pending operation
    Clear,
}

#[derive(Clone, Subcommand)]
pub enum ConflictsCommand {
    /// Resolve the conflict for a task
    Resolve {
        /// Remote uid of the conflicted task
        task_uid: String,

        /// server_wins, local_wins, merge or keep_both
        #[arg(long)]
        strategy: String,
    },
}

#[derive(Clone, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the background
    Start {
        /// Seconds between ticks (default from config.toml)
        #[arg(long)]
        interval: Option<u64>,

        /// Heartbeat only, no remote sync
        #[arg(long)]
        offline: bool,
    },

    /// Stop the daemon, waiting for an in-flight tick
    Stop,

    /// Show daemon status
    Status,
}
