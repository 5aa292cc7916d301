//! Per-minute admission limiter backed by a persisted counter.
//!
//! The counter file holds a single `<bucket> <count>` line where `bucket` is
//! the UTC calendar minute (`%Y%m%d%H%M`). The window is fixed, not sliding:
//! a new minute resets the count, so up to twice the limit can be admitted
//! across a bucket boundary.
//!
//! The whole read-increment-write runs under an exclusive lock on the counter
//! file, so concurrent processes cannot both observe a stale count.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use crate::config::Config;
use crate::lock::{FileLock, LockError};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {limit} requests per minute already admitted in bucket {bucket}; retry in {retry_after_secs}s")]
    Exceeded {
        limit: u32,
        bucket: String,
        retry_after_secs: u64,
    },

    #[error("Rate limiter busy: {0}")]
    Busy(#[from] LockError),

    #[error("Rate limit state unavailable at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The authoritative `(minute_bucket, count)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub minute_bucket: String,
    pub count: u32,
}

impl RateWindow {
    /// Parse persisted state. Anything unreadable counts as an empty window.
    fn parse(contents: &str) -> Option<Self> {
        let mut parts = contents.split_whitespace();
        let minute_bucket = parts.next()?.to_string();
        let count = parts.next()?.parse().ok()?;
        if minute_bucket.len() != 12 || !minute_bucket.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            minute_bucket,
            count,
        })
    }
}

/// Bucket key for the calendar minute containing `now`.
pub fn minute_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M").to_string()
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    path: PathBuf,
    max_per_minute: u32,
    lock_timeout: Duration,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.rate_limit_path(),
            max_per_minute: config.max_commands_per_minute,
            lock_timeout: config.lock_timeout,
        }
    }

    /// Admit or reject one request at the current time.
    pub async fn admit(&self) -> Result<(), RateLimitError> {
        self.admit_at(Utc::now()).await
    }

    /// Admit or reject one request at `now`.
    ///
    /// # Postcondition
    /// On `Ok`, the persisted count for `now`'s bucket grew by exactly one.
    pub async fn admit_at(&self, now: DateTime<Utc>) -> Result<(), RateLimitError> {
        let bucket = minute_bucket(now);
        let mut lock = FileLock::acquire(&self.path, self.lock_timeout).await?;

        let mut contents = String::new();
        lock.file()
            .read_to_string(&mut contents)
            .map_err(|source| self.storage_error(source))?;

        let count = match RateWindow::parse(&contents) {
            Some(window) if window.minute_bucket == bucket => window.count,
            Some(_) => 0,
            None => {
                if !contents.trim().is_empty() {
                    tracing::warn!(path = %self.path.display(), "Discarding unreadable rate limit state");
                }
                0
            }
        };

        if count >= self.max_per_minute {
            let retry_after_secs = 60 - u64::from(now.second().min(59));
            tracing::debug!(bucket = %bucket, count, limit = self.max_per_minute, "Rate limit reached");
            return Err(RateLimitError::Exceeded {
                limit: self.max_per_minute,
                bucket,
                retry_after_secs,
            });
        }

        let next = RateWindow {
            minute_bucket: bucket,
            count: count + 1,
        };
        write_window(lock.file(), &next).map_err(|source| self.storage_error(source))?;
        Ok(())
    }

    /// Current persisted window, if any.
    pub async fn current(&self) -> Option<RateWindow> {
        let contents = tokio::fs::read_to_string(&self.path).await.ok()?;
        RateWindow::parse(&contents)
    }

    fn storage_error(&self, source: std::io::Error) -> RateLimitError {
        RateLimitError::Storage {
            path: self.path.clone(),
            source,
        }
    }
}

fn write_window(file: &mut File, window: &RateWindow) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    writeln!(file, "{} {}", window.minute_bucket, window.count)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter(dir: &std::path::Path, max: u32) -> RateLimiter {
        let mut config = Config::with_home(dir);
        config.max_commands_per_minute = max;
        RateLimiter::new(&config)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, s).single().expect("time")
    }

    #[tokio::test]
    async fn admits_up_to_limit_within_a_minute() {
        let temp = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(temp.path(), 3);

        for s in [0, 10, 20] {
            limiter.admit_at(at(10, 30, s)).await.expect("admitted");
        }
        let err = limiter.admit_at(at(10, 30, 45)).await.unwrap_err();
        match err {
            RateLimitError::Exceeded {
                limit,
                bucket,
                retry_after_secs,
            } => {
                assert_eq!(limit, 3);
                assert_eq!(bucket, "202501151030");
                assert_eq!(retry_after_secs, 15);
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }

        limiter
            .admit_at(at(10, 31, 0))
            .await
            .expect("next minute admitted");
        assert_eq!(
            limiter.current().await,
            Some(RateWindow {
                minute_bucket: "202501151031".to_string(),
                count: 1
            })
        );
    }

    #[tokio::test]
    async fn rejections_do_not_consume_capacity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(temp.path(), 1);
        limiter.admit_at(at(9, 0, 0)).await.expect("first");
        assert!(limiter.admit_at(at(9, 0, 1)).await.is_err());
        assert!(limiter.admit_at(at(9, 0, 2)).await.is_err());
        assert_eq!(limiter.current().await.map(|w| w.count), Some(1));
    }

    #[tokio::test]
    async fn state_is_shared_between_instances() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = limiter(temp.path(), 2);
        let b = limiter(temp.path(), 2);
        a.admit_at(at(12, 0, 0)).await.expect("a");
        b.admit_at(at(12, 0, 1)).await.expect("b");
        assert!(a.admit_at(at(12, 0, 2)).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_state_resets_to_empty_window() {
        let temp = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(temp.path(), 1);
        std::fs::create_dir_all(temp.path().join("state")).expect("mkdir");
        std::fs::write(temp.path().join("state/rate_limit"), "garbage").expect("write");
        limiter.admit_at(at(8, 0, 0)).await.expect("admitted");
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(temp.path(), 5);
        let now = at(14, 0, 0);

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.admit_at(now).await.is_ok() }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
