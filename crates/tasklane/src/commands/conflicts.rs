use libtasklane_core::{SyncConflict, TasklaneError};
use libtasklane_sync::ConflictResolver;
use serde::Serialize;

use crate::cli::{Cli, ConflictsCommand};
use crate::context::TasklaneContext;
use crate::output::{output_success, print_human, print_table};

#[derive(Serialize)]
struct ConflictView<'a> {
    id: u64,
    task_uid: &'a str,
    task_summary: &'a str,
    list_id: &'a str,
    local_modified: String,
    remote_modified: String,
    detected_at: String,
    local_version: serde_json::Value,
    remote_version: serde_json::Value,
}

impl<'a> ConflictView<'a> {
    fn new(c: &'a SyncConflict) -> Self {
        Self {
            id: c.id,
            task_uid: &c.task_uid,
            task_summary: &c.task_summary,
            list_id: &c.list_id,
            local_modified: c.local_modified.to_rfc3339(),
            remote_modified: c.remote_modified.to_rfc3339(),
            detected_at: c.detected_at.to_rfc3339(),
            // Snapshots are stored as JSON text; embed them as objects
            local_version: serde_json::from_str(&c.local_version).unwrap_or(serde_json::Value::Null),
            remote_version: serde_json::from_str(&c.remote_version).unwrap_or(serde_json::Value::Null),
        }
    }
}

pub fn run(cli: &Cli, cmd: Option<ConflictsCommand>) -> Result<(), TasklaneError> {
    match cmd {
        None => list(cli),
        Some(ConflictsCommand::Resolve { task_uid, strategy }) => resolve(cli, &task_uid, &strategy),
    }
}

fn list(cli: &Cli) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    let db = ctx.open_db()?;
    let conflicts = db.conflict_store().conflicts()?;

    if cli.json {
        let views: Vec<ConflictView> = conflicts.iter().map(ConflictView::new).collect();
        return output_success(cli, serde_json::json!({ "count": views.len(), "conflicts": views }));
    }
    if conflicts.is_empty() {
        print_human(cli, "No pending conflicts");
        return Ok(());
    }

    let rows = conflicts
        .iter()
        .map(|c| {
            vec![
                c.task_uid.clone(),
                c.task_summary.clone(),
                c.list_id.clone(),
                c.local_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
                c.remote_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
                c.detected_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(cli, &["UID", "Summary", "List", "Local modified", "Remote modified", "Detected"], rows);
    print_human(
        cli,
        "Resolve with: tasklane sync conflicts resolve <uid> --strategy <server_wins|local_wins|merge|keep_both>",
    );
    Ok(())
}

fn resolve(cli: &Cli, task_uid: &str, strategy: &str) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    let db = ctx.open_db()?;
    let outcome = ConflictResolver::new(&db).resolve(task_uid, strategy)?;

    if cli.json {
        return output_success(cli, &outcome);
    }
    let strategy = outcome
        .conflict
        .resolution
        .map_or(strategy.to_string(), |s| s.to_string());
    let mut msg = format!("Resolved conflict for {} with {}", task_uid, strategy);
    match outcome.task {
        Some(ref task) => msg.push_str(&format!("\n  Task {}: {}", task.id, task.summary)),
        None => msg.push_str("\n  Task deleted locally"),
    }
    if let Some(ref copy) = outcome.copy {
        msg.push_str(&format!("\n  Copy {}: {}", copy.id, copy.summary));
    }
    if outcome.enqueued > 0 {
        msg.push_str(&format!("\n  {} operation(s) queued for the next sync", outcome.enqueued));
    }
    print_human(cli, &msg);
    Ok(())
}
