//! Terminal output: the interactive status line and the `--status` report.

use crate::app::App;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use singlebell::LeaseRecord;
use singlebell::lease::Lease;
use std::time::Duration;

/// Key bindings shown on start and with `h`.
pub fn help_text() -> &'static str {
    "u  enable sound (needed once per terminal)\r\n\
     p  start the alert\r\n\
     s  silence the alert everywhere\r\n\
     h  toggle this help\r\n\
     q  quit\r\n"
}

/// One-line summary of this process.
pub fn render_status_line(app: &App) -> String {
    let status = app.coordinator.status();
    let sound = if status.unlocked { "sound on" } else { "sound locked" };
    let holder = match &status.holder {
        Some(_) if status.holds_lease() => "ringing here".to_string(),
        Some(h) => format!("ringing in {}", short_id(h.owner_id.as_str())),
        None => "quiet".to_string(),
    };
    let active = if app.is_active_tab() { " | active" } else { "" };

    let mut line = format!(
        "[{}] {} | {} | {}{}",
        short_id(status.owner.as_str()),
        status.state,
        sound,
        holder,
        active
    );
    if let Some(message) = &app.message {
        line.push_str(" | ");
        line.push_str(message);
    }
    line
}

/// First block of a uuid is plenty to tell processes apart on screen.
fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

/// A lease as shown to humans and scripts.
#[derive(Debug, Serialize)]
pub struct LeaseView {
    pub key: String,
    pub owner_id: String,
    pub acquired_at: String,
    pub age: String,
    pub fresh: bool,
}

impl LeaseView {
    fn from_record(lease: &Lease, record: &LeaseRecord) -> Self {
        let age_ms = record.age_ms(lease.now_ms()).max(0) as u64;
        // Round to whole milliseconds; humantime would otherwise print nanos.
        let age = Duration::from_millis(age_ms);
        Self {
            key: lease.key().to_string(),
            owner_id: record.owner_id.to_string(),
            acquired_at: DateTime::<Utc>::from_timestamp_millis(record.acquired_at)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| record.acquired_at.to_string()),
            age: humantime::format_duration(age).to_string(),
            fresh: lease.is_fresh(record),
        }
    }
}

/// Snapshot of both leases.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub generated_at: String,
    pub playback: Option<LeaseView>,
    pub active_tab: Option<LeaseView>,
}

impl StatusReport {
    pub fn collect(playback: &Lease, active_tab: &Lease) -> Self {
        let view = |lease: &Lease| lease.current().map(|r| LeaseView::from_record(lease, &r));
        Self {
            generated_at: Local::now().to_rfc3339(),
            playback: view(playback),
            active_tab: view(active_tab),
        }
    }
}

/// Render the report for `--status`.
pub fn render_report(report: &StatusReport, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string_pretty(report).context("Failed to serialize status");
    }

    let mut output = String::new();
    output.push_str(&format!(
        "=== SINGLEBELL {} ===\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    output.push_str(&format!(
        "{:<12} {:<38} {:>12} {:>6}\n",
        "LEASE", "OWNER", "AGE", "FRESH"
    ));
    output.push_str(&format!("{}\n", "-".repeat(71)));

    for (label, view) in [("playback", &report.playback), ("active", &report.active_tab)] {
        match view {
            Some(v) => output.push_str(&format!(
                "{:<12} {:<38} {:>12} {:>6}\n",
                label,
                v.owner_id,
                v.age,
                if v.fresh { "yes" } else { "no" }
            )),
            None => output.push_str(&format!("{:<12} {:<38} {:>12} {:>6}\n", label, "-", "-", "-")),
        }
    }

    Ok(output)
}
