use chrono::{DateTime, Utc};
use libtasklane_core::{SyncOperation, TasklaneError};
use libtasklane_sync::{open_backend, DaemonLock, Reconciler};
use serde::Serialize;

use crate::cli::{Cli, QueueCommand, SyncCommand};
use crate::commands::{conflicts, daemon};
use crate::context::{from_daemon_error, TasklaneContext};
use crate::output::{output_success, print_human, print_table, short_uid};

#[derive(Serialize)]
struct BackendStatus {
    name: String,
    kind: String,
    /// `reachable`, `unreachable` or `skipped`
    connection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    last_sync: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct SyncStatusOutput {
    offline_mode: bool,
    last_sync: Option<DateTime<Utc>>,
    pending_operations: u64,
    backends: Vec<BackendStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_conflicts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    daemon_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    daemon_pid: Option<u32>,
}

pub fn run(cli: &Cli, cmd: SyncCommand) -> Result<(), TasklaneError> {
    match cmd {
        SyncCommand::Status { verbose } => status(cli, verbose),
        SyncCommand::Queue { cmd: None } => show_queue(cli),
        SyncCommand::Queue { cmd: Some(QueueCommand::Clear) } => clear_queue(cli),
        SyncCommand::Conflicts { cmd } => conflicts::run(cli, cmd),
        SyncCommand::Daemon { cmd } => daemon::run(cli, cmd),
        SyncCommand::Now => sync_now(cli),
    }
}

fn status(cli: &Cli, verbose: bool) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    let db = ctx.open_db()?;
    let metadata = db.metadata();

    let mut backends = Vec::new();
    for backend in &ctx.config.backends {
        let (connection, error) = if ctx.config.offline_mode {
            ("skipped".to_string(), None)
        } else {
            match open_backend(backend).and_then(|remote| remote.check_connection()) {
                Ok(()) => ("reachable".to_string(), None),
                Err(e) => ("unreachable".to_string(), Some(e.to_string())),
            }
        };
        backends.push(BackendStatus {
            name: backend.name.clone(),
            kind: format!("{:?}", backend.kind).to_lowercase(),
            connection,
            error,
            last_sync: metadata.last_sync_for(&backend.name)?,
        });
    }

    let mut output = SyncStatusOutput {
        offline_mode: ctx.config.offline_mode,
        last_sync: metadata.last_sync()?,
        pending_operations: db.queue().pending_count()?,
        backends,
        pending_conflicts: None,
        daemon_running: None,
        daemon_pid: None,
    };
    if verbose {
        let marker = DaemonLock::read(&ctx.data_dir).map_err(from_daemon_error)?;
        let live = marker.filter(|lock| !lock.is_stale());
        output.pending_conflicts = Some(db.conflict_store().pending_count());
        output.daemon_running = Some(live.is_some());
        output.daemon_pid = live.map(|lock| lock.pid);
    }

    if cli.json {
        return output_success(cli, &output);
    }

    let mut lines = vec![
        format!("Offline mode:       {}", if output.offline_mode { "yes" } else { "no" }),
        format!("Last sync:          {}", format_last_sync(output.last_sync)),
        format!("Pending operations: {}", output.pending_operations),
    ];
    if output.backends.is_empty() {
        lines.push("Backends:           none configured".to_string());
    } else {
        lines.push("Backends:".to_string());
        for b in &output.backends {
            let mut line = format!("  {} ({}): {}", b.name, b.kind, b.connection);
            if let Some(ref e) = b.error {
                line.push_str(&format!(" ({})", e));
            }
            if verbose {
                line.push_str(&format!(", last sync {}", format_last_sync(b.last_sync)));
            }
            lines.push(line);
        }
    }
    if verbose {
        if let Some(n) = output.pending_conflicts {
            lines.push(format!("Pending conflicts:  {}", n));
        }
        match output.daemon_pid {
            Some(pid) => lines.push(format!("Daemon:             running (PID {})", pid)),
            None => lines.push("Daemon:             not running".to_string()),
        }
    }
    print_human(cli, &lines.join("\n"));
    Ok(())
}

fn show_queue(cli: &Cli) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    let db = ctx.open_db()?;
    let store = db.task_store();
    let ops: Vec<SyncOperation> = db.queue().pending_operations_with(&store)?;

    if cli.json {
        return output_success(cli, serde_json::json!({ "count": ops.len(), "operations": ops }));
    }
    if ops.is_empty() {
        print_human(cli, "No pending operations");
        return Ok(());
    }

    let rows = ops
        .iter()
        .map(|op| {
            vec![
                op.id.to_string(),
                op.operation_type.to_string(),
                if op.task_id == 0 { "-".to_string() } else { op.task_id.to_string() },
                short_uid(&op.task_uid),
                op.task_summary.clone(),
                op.list_id.clone(),
                op.retry_count.to_string(),
                op.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(
        cli,
        &["Op", "Type", "Task", "UID", "Summary", "List", "Retries", "Queued"],
        rows,
    );
    print_human(cli, &format!("{} pending operation(s)", ops.len()));
    Ok(())
}

fn clear_queue(cli: &Cli) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    let db = ctx.open_db()?;
    let removed = db.queue().clear_queue()?;

    if cli.json {
        output_success(cli, serde_json::json!({ "removed": removed }))
    } else {
        print_human(cli, &format!("Cleared {} pending operation(s)", removed));
        Ok(())
    }
}

fn sync_now(cli: &Cli) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    if ctx.config.offline_mode {
        return Err(TasklaneError::InvalidArgs(
            "offline mode is enabled in config.toml".to_string(),
        ));
    }
    let backend_config = ctx.config.primary_backend().ok_or_else(|| {
        TasklaneError::Remote("no remote backend configured in config.toml".to_string())
    })?;
    let backend = open_backend(backend_config)?;

    let db = ctx.open_db()?;
    let report = Reconciler::new(&db, backend.as_ref(), ctx.config.max_retries).run()?;

    if cli.json {
        return output_success(cli, &report);
    }
    print_human(
        cli,
        &format!(
            "Synced with {}: {} pushed, {} pulled, {} conflict(s), {} failed, {} skipped",
            backend.name(),
            report.pushed,
            report.pulled,
            report.conflicts,
            report.failed,
            report.skipped
        ),
    );
    if report.conflicts > 0 {
        print_human(cli, "Run 'tasklane sync conflicts' to review them");
    }
    Ok(())
}

fn format_last_sync(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "never".to_string(),
    }
}
