//! Task commands; every change goes through the sync coordinator so it is queued

use chrono::{DateTime, NaiveDate, Utc};
use libtasklane_core::{Task, TaskFilter, TaskStatus, TaskStore, TasklaneError};

use crate::cli::{Cli, TaskCommand};
use crate::context::TasklaneContext;
use crate::output::{output_success, print_human, print_table, short_uid};

pub fn run(cli: &Cli, cmd: TaskCommand) -> Result<(), TasklaneError> {
    let ctx = TasklaneContext::resolve(cli)?;
    let db = ctx.open_db()?;
    let coord = TasklaneContext::coordinator(&db);

    match cmd {
        TaskCommand::Add { summary, list, description, priority, due } => {
            let mut task = Task::new(list, summary);
            task.description = description;
            if let Some(p) = priority {
                task.priority = check_priority(p)?;
            }
            if let Some(due) = due {
                task.due = Some(parse_due(&due)?);
            }
            let task = coord.create_task(task)?;
            if cli.json {
                output_success(cli, &task)?;
            } else {
                print_human(cli, &format!("Added task {}: {}", task.id, task.summary));
            }
        }
        TaskCommand::List { list, status, all } => {
            let filter = TaskFilter {
                list_id: list,
                status: status.as_deref().map(str::parse::<TaskStatus>).transpose()?,
                include_done: all,
            };
            let tasks = coord.list_tasks(&filter)?;
            if cli.json {
                output_success(cli, serde_json::json!({ "tasks": tasks }))?;
            } else if tasks.is_empty() {
                print_human(cli, "No tasks");
            } else {
                let rows = tasks
                    .iter()
                    .map(|t| {
                        vec![
                            t.id.to_string(),
                            short_uid(&t.uid),
                            t.status.to_string(),
                            if t.priority == 0 { "-".to_string() } else { t.priority.to_string() },
                            t.list_id.clone(),
                            t.summary.clone(),
                        ]
                    })
                    .collect();
                print_table(cli, &["ID", "UID", "Status", "Pri", "List", "Summary"], rows);
            }
        }
        TaskCommand::Show { id } => {
            let task = coord.get_task(id)?.ok_or_else(|| TasklaneError::task_not_found(id))?;
            if cli.json {
                output_success(cli, &task)?;
            } else {
                print_task(cli, &task);
            }
        }
        TaskCommand::Update { id, summary, description, priority, status, due } => {
            if summary.is_none() && description.is_none() && priority.is_none() && status.is_none() && due.is_none() {
                return Err(TasklaneError::InvalidArgs("nothing to update".to_string()));
            }
            let mut task = coord.get_task(id)?.ok_or_else(|| TasklaneError::task_not_found(id))?;
            if let Some(summary) = summary {
                task.summary = summary;
            }
            if let Some(description) = description {
                task.description = if description.is_empty() { None } else { Some(description) };
            }
            if let Some(p) = priority {
                task.priority = check_priority(p)?;
            }
            if let Some(status) = status {
                task.status = status.parse()?;
            }
            if let Some(due) = due {
                task.due = if due.is_empty() { None } else { Some(parse_due(&due)?) };
            }
            let task = coord.update_task(task)?;
            if cli.json {
                output_success(cli, &task)?;
            } else {
                print_human(cli, &format!("Updated task {}", task.id));
            }
        }
        TaskCommand::Done { id } => {
            let mut task = coord.get_task(id)?.ok_or_else(|| TasklaneError::task_not_found(id))?;
            task.status = TaskStatus::Completed;
            let task = coord.update_task(task)?;
            if cli.json {
                output_success(cli, &task)?;
            } else {
                print_human(cli, &format!("Completed task {}: {}", task.id, task.summary));
            }
        }
        TaskCommand::Delete { id } => {
            let task = coord.delete_task(id)?;
            if cli.json {
                output_success(cli, serde_json::json!({ "deleted": task.id, "uid": task.uid }))?;
            } else {
                print_human(cli, &format!("Deleted task {}: {}", task.id, task.summary));
            }
        }
    }
    Ok(())
}

fn print_task(cli: &Cli, task: &Task) {
    let mut lines = vec![
        format!("Task {}: {}", task.id, task.summary),
        format!("  UID:       {}", if task.uid.is_empty() { "(not synced)" } else { task.uid.as_str() }),
        format!("  List:      {}", task.list_id),
        format!("  Status:    {}", task.status),
    ];
    if task.priority > 0 {
        lines.push(format!("  Priority:  {}", task.priority));
    }
    if let Some(due) = task.due {
        lines.push(format!("  Due:       {}", due.format("%Y-%m-%d %H:%M UTC")));
    }
    lines.push(format!("  Created:   {}", task.created.format("%Y-%m-%d %H:%M:%S UTC")));
    lines.push(format!("  Modified:  {}", task.modified.format("%Y-%m-%d %H:%M:%S UTC")));
    if let Some(ref description) = task.description {
        lines.push(String::new());
        lines.push(description.clone());
    }
    print_human(cli, &lines.join("\n"));
}

fn check_priority(priority: u8) -> Result<u8, TasklaneError> {
    if priority > 9 {
        return Err(TasklaneError::InvalidArgs(format!(
            "priority must be between 0 and 9, got {}",
            priority
        )));
    }
    Ok(priority)
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp
fn parse_due(s: &str) -> Result<DateTime<Utc>, TasklaneError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| TasklaneError::InvalidArgs(format!("invalid due date '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_due_formats() {
        let day = parse_due("2026-03-01").unwrap();
        assert_eq!(day.to_rfc3339(), "2026-03-01T00:00:00+00:00");

        let exact = parse_due("2026-03-01T09:30:00+02:00").unwrap();
        assert_eq!(exact.to_rfc3339(), "2026-03-01T07:30:00+00:00");

        assert!(matches!(parse_due("next tuesday"), Err(TasklaneError::InvalidArgs(_))));
    }

    #[test]
    fn test_priority_range() {
        assert_eq!(check_priority(9).unwrap(), 9);
        assert!(check_priority(10).is_err());
    }
}
