//! Lock dump feed
//!
//! Decommission mode reads a weekly tab-separated snapshot of the locks held
//! at an endpoint instead of querying the live lock tables. Each line carries
//! `scope, name, rule_id, rse_expression, account, file_size_bytes, state`
//! for one file.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Feed errors
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Source of lock dumps
#[async_trait]
pub trait LockDumpFeed: Send + Sync {
    /// Fetch the dump of `endpoint` published on `date` (`DD-MM-YYYY`).
    ///
    /// Returns `None` when no dump has been published.
    async fn fetch(&self, endpoint: &str, date: &str) -> Result<Option<String>>;
}

/// Publication date of the latest dump: the last Sunday on or before `today`
pub fn dump_date(today: NaiveDate) -> String {
    let since_sunday = today.weekday().num_days_from_sunday() as i64;
    (today - Duration::days(since_sunday))
        .format("%d-%m-%Y")
        .to_string()
}

// =============================================================================
// HTTP FEED
// =============================================================================

/// Dump service reachable over HTTP
pub struct HttpLockDumpFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLockDumpFeed {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn url(&self, endpoint: &str, date: &str) -> String {
        format!(
            "{}GetFileFromHDFS?date={}&rse={}",
            self.base_url, date, endpoint
        )
    }
}

#[async_trait]
impl LockDumpFeed for HttpLockDumpFeed {
    async fn fetch(&self, endpoint: &str, date: &str) -> Result<Option<String>> {
        let url = self.url(endpoint, date);
        debug!(url = %url, "Fetching lock dump");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            warn!(url = %url, status = %response.status(), "Lock dump not available");
            return Ok(None);
        }

        Ok(Some(response.text().await?))
    }
}

// =============================================================================
// FILE FEED
// =============================================================================

/// Dumps mirrored to a local directory as `{endpoint}_{date}.tsv`
pub struct FileLockDumpFeed {
    dir: PathBuf,
}

impl FileLockDumpFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, endpoint: &str, date: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.tsv", endpoint, date))
    }
}

#[async_trait]
impl LockDumpFeed for FileLockDumpFeed {
    async fn fetch(&self, endpoint: &str, date: &str) -> Result<Option<String>> {
        let path = self.path(endpoint, date);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Lock dump not available");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// One file lock from a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRow {
    pub scope: String,
    pub name: String,
    pub rule_id: Uuid,
    pub rse_expression: String,
    pub account: String,
    pub bytes: u64,
    pub state: String,
}

impl DumpRow {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        let [scope, name, rule_id, rse_expression, account, bytes, state] = fields[..] else {
            return None;
        };

        Some(Self {
            scope: scope.to_string(),
            name: name.to_string(),
            rule_id: rule_id.trim().parse().ok()?,
            rse_expression: rse_expression.to_string(),
            account: account.to_string(),
            bytes: bytes.trim().parse().ok()?,
            state: state.trim().to_string(),
        })
    }
}

/// Parse a dump, skipping blank and malformed lines
pub fn parse_dump(content: &str) -> Vec<DumpRow> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| {
            let row = DumpRow::parse(line);
            if row.is_none() {
                warn!(line = idx + 1, "Skipping malformed lock dump line");
            }
            row
        })
        .collect()
}

/// Per-rule totals of a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleUsage {
    pub rule_id: Uuid,
    /// RSE expression as recorded in the dump
    pub rse_expression: String,
    pub bytes: u64,
    pub files: u64,
}

/// Sum file sizes and counts per rule, in first-seen order
pub fn aggregate(rows: &[DumpRow]) -> Vec<RuleUsage> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut usage: Vec<RuleUsage> = Vec::new();

    for row in rows {
        match index.get(&row.rule_id) {
            Some(&i) => {
                usage[i].bytes = usage[i].bytes.saturating_add(row.bytes);
                usage[i].files += 1;
            }
            None => {
                index.insert(row.rule_id, usage.len());
                usage.push(RuleUsage {
                    rule_id: row.rule_id,
                    rse_expression: row.rse_expression.clone(),
                    bytes: row.bytes,
                    files: 1,
                });
            }
        }
    }

    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_date_is_last_sunday() {
        // 2024-03-13 is a Wednesday
        let wednesday = NaiveDate::from_ymd_opt(2024, 3, 13).unwrap();
        assert_eq!(dump_date(wednesday), "10-03-2024");

        let sunday = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(dump_date(sunday), "10-03-2024");

        let saturday = NaiveDate::from_ymd_opt(2024, 3, 16).unwrap();
        assert_eq!(dump_date(saturday), "10-03-2024");
    }

    #[test]
    fn test_http_url() {
        let feed = HttpLockDumpFeed::new("http://dumps:8080/LOCKS/").unwrap();
        assert_eq!(
            feed.url("SITE_A", "10-03-2024"),
            "http://dumps:8080/LOCKS/GetFileFromHDFS?date=10-03-2024&rse=SITE_A"
        );
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let rule = Uuid::new_v4();
        let content = format!(
            "data18\tf1\t{rule}\tSITE_A\troot\t100\tO\n\
             \n\
             data18\tf2\tnot-a-uuid\tSITE_A\troot\t100\tO\n\
             data18\tf3\t{rule}\tSITE_A\troot\tlots\tO\n\
             data18\tf4\t{rule}\tSITE_A\troot\n\
             data18\tf5\t{rule}\tSITE_A\troot\t50\tO\n"
        );

        let rows = parse_dump(&content);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "f1");
        assert_eq!(rows[1].bytes, 50);
    }

    #[test]
    fn test_aggregate_preserves_first_seen_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let row = |rule_id, bytes| DumpRow {
            scope: "data18".to_string(),
            name: "f".to_string(),
            rule_id,
            rse_expression: "SITE_A".to_string(),
            account: "root".to_string(),
            bytes,
            state: "O".to_string(),
        };

        let usage = aggregate(&[row(b, 10), row(a, 5), row(b, 20)]);
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].rule_id, b);
        assert_eq!((usage[0].bytes, usage[0].files), (30, 2));
        assert_eq!((usage[1].bytes, usage[1].files), (5, 1));
    }

    #[test]
    fn test_aggregate_saturates_oversized_rows() {
        let rule_id = Uuid::new_v4();
        let content = format!(
            "data18\tf1\t{id}\tSITE_A\troot\t{max}\tO\ndata18\tf2\t{id}\tSITE_A\troot\t{max}\tO\n",
            id = rule_id,
            max = u64::MAX
        );

        let usage = aggregate(&parse_dump(&content));
        assert_eq!(usage.len(), 1);
        assert_eq!((usage[0].bytes, usage[0].files), (u64::MAX, 2));
    }

    #[tokio::test]
    async fn test_file_feed() {
        let dir = tempfile::tempdir().unwrap();
        let feed = FileLockDumpFeed::new(dir.path());

        assert!(feed.fetch("SITE_A", "10-03-2024").await.unwrap().is_none());

        std::fs::write(feed.path("SITE_A", "10-03-2024"), "line\n").unwrap();
        let content = feed.fetch("SITE_A", "10-03-2024").await.unwrap();
        assert_eq!(content.as_deref(), Some("line\n"));
    }
}
