use std::fmt::Write;
use std::time::Duration;

use crate::ledger::VersionEntry;
use crate::pipeline::SetupResult;

// Longest commit message shown in `ship versions` before it is cut.
const MAX_MESSAGE: usize = 60;

// What the operator sees when `ship setup` ends.
pub fn setup_summary(result: &SetupResult, took: Duration) -> String {
    match result {
        SetupResult::Success(entry) => format!(
            "Deployed {} ({}) in {}.\n",
            entry.image,
            first_line(&entry.message),
            humanize(took),
        ),
        SetupResult::Aborted(err) if err.is_live() => format!(
            "WARNING: the container is running but was NOT recorded.\n{err}\n\
             Add the entry to the ledger by hand before the next deploy.\n"
        ),
        SetupResult::Aborted(err) => format!(
            "Setup stopped at '{}' after {}.\n{}\n",
            err.step(),
            humanize(took),
            result.reason().unwrap_or_default(),
        ),
    }
}

pub fn versions_table(entries: &[VersionEntry]) -> String {
    if entries.is_empty() {
        return "Nothing deployed yet.\n".to_string();
    }
    let width = entries.iter().map(|e| e.image.len()).max().unwrap_or(0);
    let mut out = String::new();
    for entry in entries {
        // writing to a String can't fail
        let _ = writeln!(
            out,
            "{}  {:width$}  {}",
            entry.date.format("%Y-%m-%d %H:%M:%S"),
            entry.image,
            truncate(first_line(&entry.message), MAX_MESSAGE),
        );
    }
    out
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max - 1).collect();
    format!("{cut}…")
}

fn humanize(took: Duration) -> String {
    let secs = took.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", took.as_secs_f64())
    }
}
