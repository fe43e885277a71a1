//! Session summary for the external uploader
//!
//! At session end the core emits one structured payload describing the
//! network profile and the client-observed timings. Storing and querying
//! summaries is the uploader's concern, not ours.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::shaper::NetworkProfile;
use crate::Result;

/// Aggregated timings for one URL
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UrlAggregate {
    /// Number of requests served
    pub count: u64,
    /// Total response bytes
    pub bytes: u64,
    /// Total serve time in milliseconds
    pub total_ms: f64,
    /// Mean serve time in milliseconds
    pub mean_ms: f64,
}

/// The summary payload emitted at session end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session mode: `record` or `replay`
    pub mode: String,
    /// Archive identity (hex SHA-256 of the archive file)
    pub archive_id: String,
    /// Network profile the session ran under
    pub profile: NetworkProfile,
    /// Session start, Unix epoch milliseconds
    pub started_at_ms: u64,
    /// Session end, Unix epoch milliseconds
    pub finished_at_ms: u64,
    /// Replay hits (0 in record mode)
    pub replay_hits: u64,
    /// Replay misses (0 in record mode)
    pub replay_misses: u64,
    /// Per-URL timing aggregates
    pub urls: Vec<(String, UrlAggregate)>,
}

/// Concurrent per-URL timing collector
#[derive(Default)]
pub struct SessionStats {
    urls: DashMap<String, UrlAggregate>,
}

impl SessionStats {
    /// Create an empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one served request
    pub fn observe(&self, url: &str, bytes: u64, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let mut entry = self.urls.entry(url.to_string()).or_default();
        entry.count += 1;
        entry.bytes += bytes;
        entry.total_ms += elapsed_ms;
        entry.mean_ms = entry.total_ms / entry.count as f64;
    }

    /// Number of distinct URLs observed
    #[must_use]
    pub fn url_count(&self) -> usize {
        self.urls.len()
    }

    /// Snapshot the aggregates, sorted by URL for stable output
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, UrlAggregate)> {
        let mut urls: Vec<(String, UrlAggregate)> = self
            .urls
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        urls.sort_by(|a, b| a.0.cmp(&b.0));
        urls
    }
}

/// The single capability the uploader collaborator needs
pub trait SummarySink: Send + Sync {
    /// Deliver the session summary
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be delivered
    fn emit_summary(&self, summary: &SessionSummary) -> Result<()>;
}

/// Sink that logs the summary payload as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSummarySink;

impl SummarySink for LogSummarySink {
    fn emit_summary(&self, summary: &SessionSummary) -> Result<()> {
        let payload = serde_json::to_string(summary)
            .map_err(|e| crate::ReplayError::Other(format!("serialising summary: {e}")))?;
        info!(target: "webreplay::summary", %payload, "session summary");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaper::NetworkProfile;

    #[test]
    fn test_observe_aggregates() {
        let stats = SessionStats::new();
        stats.observe("http://a.test/", 100, Duration::from_millis(10));
        stats.observe("http://a.test/", 300, Duration::from_millis(30));
        stats.observe("http://b.test/", 5, Duration::from_millis(1));

        assert_eq!(stats.url_count(), 2);
        let snapshot = stats.snapshot();
        let (url, aggregate) = &snapshot[0];
        assert_eq!(url, "http://a.test/");
        assert_eq!(aggregate.count, 2);
        assert_eq!(aggregate.bytes, 400);
        assert!((aggregate.mean_ms - 20.0).abs() < 1.0);
    }

    #[test]
    fn test_snapshot_sorted() {
        let stats = SessionStats::new();
        stats.observe("http://z.test/", 1, Duration::from_millis(1));
        stats.observe("http://a.test/", 1, Duration::from_millis(1));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot[0].0, "http://a.test/");
        assert_eq!(snapshot[1].0, "http://z.test/");
    }

    #[test]
    fn test_summary_serialises() {
        let summary = SessionSummary {
            mode: "replay".to_string(),
            archive_id: "abc123".to_string(),
            profile: NetworkProfile::unshaped(),
            started_at_ms: 1,
            finished_at_ms: 2,
            replay_hits: 3,
            replay_misses: 1,
            urls: vec![(
                "http://a.test/".to_string(),
                UrlAggregate {
                    count: 1,
                    bytes: 2,
                    total_ms: 3.0,
                    mean_ms: 3.0,
                },
            )],
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"mode\":\"replay\""));
        assert!(json.contains("\"archive_id\":\"abc123\""));

        LogSummarySink.emit_summary(&summary).unwrap();
    }
}
