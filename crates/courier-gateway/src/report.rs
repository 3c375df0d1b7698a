//! Daily self-check report ledger.
//!
//! `courier selfcheck` writes one `{date}_report.json` per day; on the
//! first user message of a later day the gateway delivers any unreported
//! report to the chat and flips its `reported` flag on disk. Idempotency
//! lives in the file flag, not in session state.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub date: String,
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub checks: serde_json::Value,
    #[serde(default)]
    pub reported: bool,
}

pub struct ReportLedger {
    dir: PathBuf,
}

impl ReportLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}_report.json"))
    }

    /// Write (or overwrite) today's report.
    pub fn write(&self, report: &DailyReport) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&report.date);
        std::fs::write(&path, serde_json::to_vec_pretty(report)?)?;
        debug!(path = %path.display(), "report written");
        Ok(())
    }

    /// The most recent unreported report strictly before `today`, if any.
    pub fn pending_before(&self, today: NaiveDate) -> Option<DailyReport> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let mut candidates: Vec<(NaiveDate, DailyReport)> = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date_str) = name
                .to_str()
                .and_then(|n| n.strip_suffix("_report.json"))
            else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                continue;
            };
            if date >= today {
                continue;
            }
            match read_report(&entry.path()) {
                Ok(report) if !report.reported => candidates.push((date, report)),
                Ok(_) => {}
                Err(e) => warn!(path = %entry.path().display(), err = %e, "unreadable report"),
            }
        }

        candidates.sort_by_key(|(date, _)| *date);
        candidates.pop().map(|(_, report)| report)
    }

    /// Flip the reported flag on disk.
    pub fn mark_reported(&self, date: &str) -> Result<()> {
        let path = self.path_for(date);
        let mut report = read_report(&path)?;
        report.reported = true;
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
        Ok(())
    }

    /// Render a report as chat text.
    pub fn render(report: &DailyReport) -> String {
        let mut out = format!("Daily self-check for {} — {}", report.date, report.status);
        if !report.summary.is_empty() {
            out.push('\n');
            out.push_str(&report.summary);
        }
        out
    }
}

fn read_report(path: &Path) -> Result<DailyReport> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(date: &str, reported: bool) -> DailyReport {
        DailyReport {
            date: date.to_string(),
            status: "healthy".to_string(),
            summary: "all endpoints up".to_string(),
            checks: serde_json::json!({}),
            reported,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn pending_picks_latest_unreported_before_today() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ReportLedger::new(dir.path());
        ledger.write(&report("2026-07-29", false)).expect("write");
        ledger.write(&report("2026-07-30", false)).expect("write");
        ledger.write(&report("2026-07-31", true)).expect("write");

        let pending = ledger.pending_before(date("2026-08-01")).expect("pending");
        assert_eq!(pending.date, "2026-07-30");
    }

    #[test]
    fn todays_report_is_not_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ReportLedger::new(dir.path());
        ledger.write(&report("2026-08-01", false)).expect("write");
        assert!(ledger.pending_before(date("2026-08-01")).is_none());
    }

    #[test]
    fn mark_reported_is_idempotent_delivery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ReportLedger::new(dir.path());
        ledger.write(&report("2026-07-31", false)).expect("write");

        let pending = ledger.pending_before(date("2026-08-01")).expect("pending");
        ledger.mark_reported(&pending.date).expect("mark");

        assert!(ledger.pending_before(date("2026-08-01")).is_none());
    }

    #[test]
    fn missing_dir_means_nothing_pending() {
        let ledger = ReportLedger::new("/definitely/not/a/dir");
        assert!(ledger.pending_before(date("2026-08-01")).is_none());
    }
}
