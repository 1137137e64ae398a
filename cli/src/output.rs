use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

use migration_console::types::LogEntry;
use migration_console::{BatchItem, BatchItemStatus};

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", text).context("Failed to write to stdout")?;
    Ok(())
}

pub fn print_log(entry: &LogEntry) {
    println!(
        "{} {:<7} {}",
        entry.timestamp,
        entry.level.to_string().to_uppercase(),
        entry.message
    );
}

pub fn print_batch_item(item: &BatchItem) {
    let mark = match item.status {
        BatchItemStatus::Completed => "ok",
        BatchItemStatus::Failed => "FAILED",
        BatchItemStatus::InProgress => "..",
        BatchItemStatus::Pending => "-",
        BatchItemStatus::Cancelled => "skipped",
    };
    let detail = item
        .migration_id
        .as_deref()
        .or(item.error.as_deref())
        .unwrap_or("");
    println!(
        "[{}/{}] {:<8} {} {}",
        item.position, item.total, mark, item.code_id, detail
    );
}

/// Entries of `logs` that arrived after `last_seen`. All of them when
/// `last_seen` was evicted or is unset.
pub fn new_entries<'a>(logs: &'a [LogEntry], last_seen: Option<&LogEntry>) -> &'a [LogEntry] {
    match last_seen.and_then(|seen| logs.iter().rposition(|e| e == seen)) {
        Some(pos) => &logs[pos + 1..],
        None => logs,
    }
}
