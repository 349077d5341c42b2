// Report generation: scan summaries, inventory listings and the subscription feed

use crate::model::NodeRecord;
use crate::scan::ScanSummary;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const HEAVY_RULE: &str =
    "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

/// The subscription body: one link per line with a trailing newline.
pub fn render_subscription(links: &[String]) -> String {
    let mut feed = links.join("\n");
    feed.push('\n');
    feed
}

pub fn generate_scan_report(summary: &ScanSummary) -> String {
    let mut report = String::new();

    report.push_str(HEAVY_RULE);
    report.push_str("                           DOVE SCAN REPORT\n");
    report.push_str(HEAVY_RULE);
    report.push('\n');

    report.push_str(&format!("Run ID:       {}\n", summary.run_id));
    report.push_str(&format!(
        "Status:       {}\n",
        if summary.cancelled { "Cancelled" } else { "Completed" }
    ));
    report.push_str(&format!("Scope:        {}\n", summary.scope));
    report.push_str(&format!("Duration:     {:.1} seconds\n\n", summary.elapsed_secs));

    report.push_str(HEAVY_RULE);
    report.push_str("# Summary:\n");
    report.push_str(&format!("  Links collected:      {}\n", summary.links_collected));
    report.push_str(&format!("  Undecodable:          {}\n", summary.invalid));
    report.push_str(&format!("  Duplicate keys:       {}\n", summary.duplicates));
    report.push_str(&format!("  Probes run:           {}\n", summary.probed));
    report.push_str(&format!("  Already in inventory: {}\n", summary.suppressed));
    report.push('\n');

    if summary.cancelled {
        report.push_str("  Scan was cancelled before commit. Inventory unchanged.\n\n");
    } else {
        report.push_str("# Inventory changes:\n");
        report.push_str(&format!("  [CREATED] {}\n", summary.created));
        report.push_str(&format!("  [UPDATED] {}\n", summary.updated));
        report.push_str(&format!("  [DELETED] {}\n\n", summary.deleted));
    }

    report.push_str(HEAVY_RULE);
    report
}

pub fn generate_scan_report_json(summary: &ScanSummary) -> Result<String, serde_json::Error> {
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "Dove",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": Utc::now().to_rfc3339(),
            },
            "scan": summary,
        }
    });
    serde_json::to_string_pretty(&json_report)
}

pub fn generate_inventory_report(records: &[NodeRecord]) -> String {
    let mut report = String::new();
    let working = records.iter().filter(|r| r.is_working).count();

    report.push_str(HEAVY_RULE);
    report.push_str(&format!(
        "# Inventory: {} nodes, {} working\n",
        records.len(),
        working
    ));
    report.push_str(HEAVY_RULE);
    report.push('\n');

    if records.is_empty() {
        report.push_str("  No nodes stored yet. Run `dove scan` first.\n");
        return report;
    }

    report.push_str(&format!(
        "  {:<7} {:<40} {:>6} {:>8} {:>10}  {}\n",
        "SCHEME", "ENDPOINT", "PING", "KB/S", "CHECKED", "REMARK"
    ));
    for record in records {
        let endpoint = format!("{}:{}", record.key.host, record.key.port);
        let ping = record
            .last_ping_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let speed = record
            .last_speed_kbps
            .map(|kbps| format!("{:.1}", kbps))
            .unwrap_or_else(|| "-".to_string());
        let checked = record
            .last_checked
            .map(format_date)
            .unwrap_or_else(|| "never".to_string());
        let marker = if record.is_working { "✓" } else { "✗" };

        report.push_str(&format!(
            "{} {:<7} {:<40} {:>6} {:>8} {:>10}  {}\n",
            marker,
            record.key.scheme,
            truncate(&endpoint, 40),
            ping,
            speed,
            checked,
            record.remark.as_deref().unwrap_or("")
        ));
    }

    report
}

pub fn generate_inventory_json(records: &[NodeRecord]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(records)
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

fn format_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", head)
}
