use anyhow::{Context, Result};
use rosua_migrations::{MigrationRecord, MigrationStatusEntry, RejectedMigration};
use serde::Serialize;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

pub fn print_status(entries: &[MigrationStatusEntry]) {
    print!("{}", render_status(entries));
}

pub fn print_executed(records: &[MigrationRecord]) {
    print!("{}", render_executed(records));
}

/// Rejected definitions go to stderr so `list --json` stays parseable.
pub fn print_rejected(rejected: &[RejectedMigration]) {
    for r in rejected {
        eprintln!("skipped {}: {}", r.name, r.reason);
    }
}

fn render_status(entries: &[MigrationStatusEntry]) -> String {
    if entries.is_empty() {
        return "No migrations found.\n".to_string();
    }

    let width = entries.iter().map(|e| e.version.len()).max().unwrap_or(0);
    let mut out = String::new();
    for entry in entries {
        let mark = if entry.executed { "x" } else { " " };
        let applied = match (entry.executed, entry.executed_at) {
            (true, Some(at)) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
            (true, None) => "applied".to_string(),
            (false, _) => "pending".to_string(),
        };
        out.push_str(&format!("[{mark}] {:<width$}  {applied}\n", entry.version));
    }

    let pending = entries.iter().filter(|e| !e.executed).count();
    out.push_str(&format!(
        "{} migration{}, {pending} pending\n",
        entries.len(),
        if entries.len() == 1 { "" } else { "s" }
    ));
    out
}

fn render_executed(records: &[MigrationRecord]) -> String {
    if records.is_empty() {
        return "Nothing to migrate.\n".to_string();
    }

    let mut out = String::new();
    for record in records {
        out.push_str(&format!(
            "Applied {} ({}ms)\n",
            record.version,
            record.execution_time.unwrap_or_default()
        ));
    }
    out
}
