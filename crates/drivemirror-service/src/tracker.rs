//! In-memory download statistics.
//!
//! Every served download is recorded with [`DownloadTracker::track_download`]. From the records,
//! two scores are derived:
//!
//!  - The *trending* score favors files downloaded a lot recently. It combines the download
//!    velocity of the last day and hour with the total count, decays with a half life of two
//!    days since the last download and boosts files during the first three days.
//!  - The *hotness* score divides the downloads by the age of the file's first download, similar
//!    to the ranking of link aggregators.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::caching::MemoCache;
use crate::types::FileStats;

/// Downloads older than this many hours do not count towards any score.
const HISTORY_HOURS: i64 = 24;
/// Half life of the trending score, in hours.
const RECENCY_HALF_LIFE: f64 = 48.0;
/// Newly downloaded files are boosted for this many hours.
const FRESHNESS_WINDOW: f64 = 72.0;
const HOTNESS_GRAVITY: f64 = 1.5;

#[derive(Clone, Debug)]
struct DownloadRecord {
    count: u64,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    /// Times of the downloads within [`HISTORY_HOURS`], oldest first.
    history: Vec<DateTime<Utc>>,
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 3_600_000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl DownloadRecord {
    /// Downloads per hour during the last `hours` hours.
    fn velocity(&self, hours: i64, now: DateTime<Utc>) -> f64 {
        let cutoff = now - chrono::Duration::hours(hours);
        let recent = self.history.iter().filter(|&&at| at >= cutoff).count();
        recent as f64 / hours as f64
    }

    fn trending_score(&self, now: DateTime<Utc>) -> f64 {
        let velocity = self.velocity(HISTORY_HOURS, now) + 5.0 * self.velocity(1, now);
        let popularity = (self.count as f64).sqrt();

        let recency = (-0.693 * hours_between(self.last, now) / RECENCY_HALF_LIFE).exp();

        let age = hours_between(self.first, now);
        let freshness = if age < FRESHNESS_WINDOW {
            2.0 - age / FRESHNESS_WINDOW
        } else {
            1.0
        };

        (velocity * 3.0 + popularity) * recency * freshness
    }

    fn hotness_score(&self, now: DateTime<Utc>) -> f64 {
        let age = hours_between(self.first, now);
        self.count as f64 / (age + 2.0).powf(HOTNESS_GRAVITY) * 1000.0
    }

    fn stats(&self, file_id: &str, now: DateTime<Utc>) -> FileStats {
        FileStats {
            file_id: file_id.to_owned(),
            download_count: self.count,
            trending_score: round2(self.trending_score(now)),
            hotness_score: round2(self.hotness_score(now)),
            first_download: Some(self.first),
            last_download: Some(self.last),
        }
    }
}

type Records = Arc<Mutex<HashMap<String, DownloadRecord>>>;

fn lock(records: &Records) -> MutexGuard<'_, HashMap<String, DownloadRecord>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records downloads and ranks files by their download activity.
#[derive(Debug)]
pub struct DownloadTracker {
    records: Records,
    top: MemoCache<usize, Arc<Vec<FileStats>>, Infallible>,
    ttl: Duration,
}

impl DownloadTracker {
    /// Creates an empty tracker, caching rankings for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Default::default(),
            top: MemoCache::new("tracker.top"),
            ttl,
        }
    }

    /// Records a download of `file_id` requested from `ip`.
    pub fn track_download(&self, file_id: &str, ip: Option<IpAddr>) {
        self.track_download_at(file_id, ip, Utc::now());
    }

    /// Records a download that happened at `at`.
    pub fn track_download_at(&self, file_id: &str, ip: Option<IpAddr>, at: DateTime<Utc>) {
        let mut records = lock(&self.records);
        let record = records
            .entry(file_id.to_owned())
            .or_insert_with(|| DownloadRecord {
                count: 0,
                first: at,
                last: at,
                history: Vec::new(),
            });

        record.count += 1;
        record.first = record.first.min(at);
        record.last = record.last.max(at);

        let cutoff = at - chrono::Duration::hours(HISTORY_HOURS);
        record.history.retain(|&download| download >= cutoff);
        record.history.push(at);

        metric!(counter("tracker.downloads") += 1);
        tracing::debug!(file_id, ?ip, count = record.count, "tracked download");
    }

    /// Returns the statistics of a single file.
    ///
    /// Files that were never downloaded have a count and scores of zero.
    pub fn file_stats(&self, file_id: &str) -> FileStats {
        self.file_stats_at(file_id, Utc::now())
    }

    fn file_stats_at(&self, file_id: &str, now: DateTime<Utc>) -> FileStats {
        match lock(&self.records).get(file_id) {
            Some(record) => record.stats(file_id, now),
            None => FileStats {
                file_id: file_id.to_owned(),
                download_count: 0,
                trending_score: 0.0,
                hotness_score: 0.0,
                first_download: None,
                last_download: None,
            },
        }
    }

    /// Returns the `limit` files with the highest trending score.
    ///
    /// Rankings are cached, downloads tracked in the meantime show up once the cached ranking
    /// expires.
    pub async fn top_files(&self, limit: usize) -> Arc<Vec<FileStats>> {
        let records = Arc::clone(&self.records);
        let Ok(top) = self
            .top
            .get_or_compute(limit, self.ttl, move || async move {
                Ok(Arc::new(rank(&records, limit, Utc::now())))
            })
            .await;
        top
    }
}

fn rank(records: &Records, limit: usize, now: DateTime<Utc>) -> Vec<FileStats> {
    let mut stats: Vec<_> = lock(records)
        .iter()
        .map(|(file_id, record)| record.stats(file_id, now))
        .collect();

    stats.sort_by(|a, b| {
        b.trending_score
            .total_cmp(&a.trending_score)
            .then_with(|| b.download_count.cmp(&a.download_count))
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
    stats.truncate(limit);
    stats
}
