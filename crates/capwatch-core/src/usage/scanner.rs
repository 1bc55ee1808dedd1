//! Passive rate-limit scanner over append-only session logs.
//!
//! Walks the newest log files under the configured roots, reads only the
//! tail of each one, and decodes lines from newest to oldest until a
//! recognizable rate-limit event turns up. Nothing here returns an error:
//! unreadable files and malformed lines are skipped.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::decoders::{
    decode_rate_limit_event, decode_token_usage, event_timestamp, is_rate_limit_rejection,
};
use super::types::{RateLimitSummary, RateLimitWindowInfo, ScanReport, TokenSample};
use crate::config::ScannerSettings;

/// Scanner limits
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Directories to search recursively
    pub roots: Vec<PathBuf>,
    /// Ignore files not modified within this window
    pub max_age: Duration,
    /// Inspect at most this many files
    pub max_files: usize,
    /// Bytes read from the end of each file
    pub tail_bytes: u64,
    /// Summaries older than this are flagged stale
    pub stale_after: chrono::Duration,
}

impl From<&ScannerSettings> for ScanOptions {
    fn from(settings: &ScannerSettings) -> Self {
        Self {
            roots: settings.effective_roots(),
            max_age: Duration::from_secs(u64::from(settings.max_age_days) * 24 * 60 * 60),
            max_files: settings.max_files,
            tail_bytes: settings.tail_bytes,
            stale_after: chrono::Duration::seconds(settings.stale_after_secs as i64),
        }
    }
}

/// A candidate log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// Path on disk
    pub path: PathBuf,
    /// Last modification time
    pub modified: SystemTime,
}

fn is_log_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|value| value.to_str()),
        Some("jsonl") | Some("ndjson")
    )
}

/// Scans session logs for the newest rate-limit event
#[derive(Debug, Clone)]
pub struct LogScanner {
    options: ScanOptions,
}

impl LogScanner {
    /// Create a scanner with explicit limits
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Create a scanner from settings
    pub fn from_settings(settings: &ScannerSettings) -> Self {
        Self::new(ScanOptions::from(settings))
    }

    /// Configured limits
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Log files modified within the age window, newest first, capped in count
    pub fn candidate_files(&self, now: SystemTime) -> Vec<LogFile> {
        let cutoff = now.checked_sub(self.options.max_age);
        let mut files = Vec::new();

        for root in &self.options.roots {
            if !root.is_dir() {
                debug!("Scanner root missing: {}", root.display());
                continue;
            }
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping unreadable log entry: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !is_log_path(entry.path()) {
                    continue;
                }
                let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                    continue;
                };
                if cutoff.is_some_and(|cutoff| modified < cutoff) {
                    continue;
                }
                files.push(LogFile {
                    path: entry.into_path(),
                    modified,
                });
            }
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified));
        files.truncate(self.options.max_files);
        files
    }

    /// Scan against the current clock
    pub fn scan(&self) -> ScanReport {
        self.scan_at(Utc::now())
    }

    /// Scan, treating `now` as the current time
    pub fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::empty();
        let files = self.candidate_files(SystemTime::from(now));
        debug!("Scanning {} log files", files.len());

        for file in &files {
            let text = match read_tail(&file.path, self.options.tail_bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to read {}: {}", file.path.display(), e);
                    continue;
                }
            };
            let mtime = DateTime::<Utc>::from(file.modified);
            if let Some(summary) = self.walk_lines(&text, file, mtime, now, &mut report) {
                report.summary = summary;
                return report;
            }
        }

        debug!("No rate-limit event found in {} files", files.len());
        report
    }

    fn walk_lines(
        &self,
        text: &str,
        file: &LogFile,
        mtime: DateTime<Utc>,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Option<RateLimitSummary> {
        for line in text.lines().rev() {
            let line = line.trim();
            if !line.starts_with('{') {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let line_ts = event_timestamp(&event);

            if is_rate_limit_rejection(&event) {
                if let Some(ts) = line_ts.filter(|ts| *ts <= now) {
                    report.rejections.push(ts);
                }
            }

            if report.last_turn.is_none() {
                if let Some(usage) = decode_token_usage(&event) {
                    report.last_turn = Some(TokenSample {
                        usage,
                        at: line_ts.filter(|ts| *ts <= now),
                    });
                }
            }

            let Some(decoded) = decode_rate_limit_event(&event) else {
                continue;
            };
            let event_ts = decoded.timestamp.unwrap_or(mtime);
            if event_ts > now {
                debug!(
                    "Skipping future-dated rate-limit event ({}) in {}",
                    event_ts,
                    file.path.display()
                );
                continue;
            }

            debug!(
                "Rate-limit event via {} at {} in {}",
                decoded.decoder,
                event_ts,
                file.path.display()
            );
            return Some(RateLimitSummary {
                five_hour: decoded.five_hour.unwrap_or_else(RateLimitWindowInfo::default),
                weekly: decoded.weekly.unwrap_or_else(RateLimitWindowInfo::default),
                event_timestamp: Some(event_ts),
                stale: now - event_ts > self.options.stale_after,
                source: Some(file.path.clone()),
            });
        }
        None
    }
}

/// Read the last `tail_bytes` of a file, dropping a leading partial line
pub fn read_tail(path: &Path, tail_bytes: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = fs::metadata(path)?.len();
    let start = len.saturating_sub(tail_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf).into_owned();

    if start == 0 {
        return Ok(text);
    }
    Ok(match text.find('\n') {
        Some(idx) => text[idx + 1..].to_string(),
        None => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn options(root: &Path) -> ScanOptions {
        ScanOptions {
            roots: vec![root.to_path_buf()],
            max_age: Duration::from_secs(10 * 24 * 60 * 60),
            max_files: 80,
            tail_bytes: 512 * 1024,
            stale_after: chrono::Duration::minutes(30),
        }
    }

    fn write_log(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    fn token_count_line(created_at: &str, used: u32, week_left: u32) -> String {
        format!(
            r#"{{"created_at":"{created_at}","payload":{{"type":"token_count","info":{{"rate_limits":{{"primary":{{"used_percent":{used}}},"secondary":{{"remaining_percent":{week_left}}}}}}}}}}}"#
        )
    }

    #[test]
    fn test_scan_legacy_event_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let day = tmp.path().join("2026/03/01");
        write_log(
            &day,
            "rollout-a.jsonl",
            &[token_count_line("2026-03-01T11:55:00Z", 85, 40)],
        );

        let report = LogScanner::new(options(tmp.path())).scan_at(now());
        let summary = report.summary;
        assert_eq!(summary.five_hour.remaining_percent, Some(15.0));
        assert_eq!(summary.weekly.remaining_percent, Some(40.0));
        assert!(!summary.stale);
        assert!(summary.source.unwrap().ends_with("rollout-a.jsonl"));
    }

    #[test]
    fn test_future_event_falls_through_to_older() {
        let tmp = TempDir::new().unwrap();
        write_log(
            tmp.path(),
            "rollout.jsonl",
            &[
                token_count_line("2026-03-01T11:00:00Z", 20, 70),
                "not json at all".to_string(),
                r#"{"payload":{"type":"message","text":"hi"}}"#.to_string(),
                token_count_line("2026-03-01T13:00:00Z", 99, 1),
            ],
        );

        let summary = LogScanner::new(options(tmp.path())).scan_at(now()).summary;
        assert_eq!(summary.five_hour.remaining_percent, Some(80.0));
        assert_eq!(
            summary.event_timestamp,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap())
        );
        assert!(summary.stale);
    }

    #[test]
    fn test_newest_line_wins_within_file() {
        let tmp = TempDir::new().unwrap();
        write_log(
            tmp.path(),
            "rollout.jsonl",
            &[
                token_count_line("2026-03-01T11:40:00Z", 10, 90),
                token_count_line("2026-03-01T11:50:00Z", 30, 80),
            ],
        );
        let summary = LogScanner::new(options(tmp.path())).scan_at(now()).summary;
        assert_eq!(summary.five_hour.remaining_percent, Some(70.0));
    }

    #[test]
    fn test_empty_roots_yield_stale_empty_summary() {
        let tmp = TempDir::new().unwrap();
        write_log(tmp.path(), "notes.txt", &[token_count_line("2026-03-01T11:55:00Z", 1, 1)]);
        let report = LogScanner::new(options(&tmp.path().join("missing"))).scan_at(now());
        assert!(report.summary.stale);
        assert!(report.summary.event_timestamp.is_none());

        let report = LogScanner::new(options(tmp.path())).scan_at(now());
        assert!(report.summary.is_empty());
    }

    #[test]
    fn test_token_usage_and_rejections_collected() {
        let tmp = TempDir::new().unwrap();
        write_log(
            tmp.path(),
            "rollout.jsonl",
            &[
                token_count_line("2026-03-01T11:30:00Z", 50, 50),
                r#"{"timestamp":"2026-03-01T11:52:00Z","payload":{"type":"error","message":"429 Too Many Requests"}}"#.to_string(),
                r#"{"timestamp":"2026-03-01T11:54:00Z","type":"turn.completed","usage":{"input_tokens":300,"cached_input_tokens":100,"output_tokens":50}}"#.to_string(),
                r#"{"timestamp":"2026-03-01T11:56:00Z","payload":{"type":"error","message":"rate limit exceeded"}}"#.to_string(),
            ],
        );
        let report = LogScanner::new(options(tmp.path())).scan_at(now());
        assert_eq!(report.rejections.len(), 2);
        let turn = report.last_turn.unwrap();
        assert_eq!(turn.usage.billable(), 250);
        assert_eq!(report.summary.five_hour.remaining_percent, Some(50.0));
    }

    #[test]
    fn test_candidate_files_cap_and_order() {
        let tmp = TempDir::new().unwrap();
        for i in 0..5 {
            write_log(tmp.path(), &format!("log-{i}.jsonl"), &[String::from("{}")]);
        }
        let mut opts = options(tmp.path());
        opts.max_files = 3;
        let scanner = LogScanner::new(opts);
        let files = scanner.candidate_files(SystemTime::now());
        assert_eq!(files.len(), 3);
        assert!(files.windows(2).all(|w| w[0].modified >= w[1].modified));
    }

    #[test]
    fn test_read_tail_drops_partial_line() {
        let tmp = TempDir::new().unwrap();
        let path = write_log(
            tmp.path(),
            "tail.jsonl",
            &["aaaaaaaaaa".to_string(), "bbbb".to_string()],
        );
        assert_eq!(read_tail(&path, 8).unwrap(), "bbbb\n");
        assert_eq!(read_tail(&path, 1024).unwrap(), "aaaaaaaaaa\nbbbb\n");
    }
}
