//! Fetch-and-apply cycles for the flag and segment feeds, including the
//! on-demand catch-up fetches issued after streaming notifications.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::backoff::Backoff;
use crate::api::{is_retryable, SplitApi};
use crate::segments::SegmentChanges;
use crate::splits::{ChangeNumber, Split, SplitChanges};
use crate::storage::{InMemorySegmentStorage, InMemorySplitStorage};
use crate::Result;

/// Attempts per phase of an on-demand catch-up fetch (plain, then with the
/// CDN-bypassing `till` parameter).
const ON_DEMAND_MAX_ATTEMPTS: u32 = 10;
const ON_DEMAND_BACKOFF_BASE: Duration = Duration::from_secs(1);
const ON_DEMAND_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// In-cycle retries for transient transport failures. Anything still
/// failing afterwards surfaces and waits for the next scheduled tick.
const FETCH_RETRIES: u32 = 3;

async fn fetch_with_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(ON_DEMAND_BACKOFF_BASE, ON_DEMAND_BACKOFF_MAX);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && backoff.attempt() + 1 < FETCH_RETRIES => {
                log::debug!(target: "splitio", "retrying feed fetch after transient error: {err}");
                tokio::time::sleep(backoff.next()).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The conditional-fetch surface of the backend, abstracted so sync logic
/// can be exercised against canned feeds.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_splits(
        &self,
        since: ChangeNumber,
        sets: Option<&str>,
        till: Option<ChangeNumber>,
    ) -> Result<SplitChanges>;

    async fn fetch_segment(
        &self,
        name: &str,
        since: ChangeNumber,
        till: Option<ChangeNumber>,
    ) -> Result<SegmentChanges>;
}

#[async_trait]
impl FeedFetcher for SplitApi {
    async fn fetch_splits(
        &self,
        since: ChangeNumber,
        sets: Option<&str>,
        till: Option<ChangeNumber>,
    ) -> Result<SplitChanges> {
        SplitApi::fetch_splits(self, since, sets, till).await
    }

    async fn fetch_segment(
        &self,
        name: &str,
        since: ChangeNumber,
        till: Option<ChangeNumber>,
    ) -> Result<SegmentChanges> {
        SplitApi::fetch_segment(self, name, since, till).await
    }
}

/// Applies feed deltas to storage and keeps referenced segments in step with
/// the flags that use them.
pub struct Synchronizer {
    fetcher: Arc<dyn FeedFetcher>,
    splits: Arc<InMemorySplitStorage>,
    segments: Arc<InMemorySegmentStorage>,
    /// Sanitized flag-set filter. When present, fetches are scoped to these
    /// sets and flags outside them are dropped from storage.
    flag_sets: Option<Vec<String>>,
}

impl Synchronizer {
    pub fn new(
        fetcher: Arc<dyn FeedFetcher>,
        splits: Arc<InMemorySplitStorage>,
        segments: Arc<InMemorySegmentStorage>,
        flag_sets: Option<Vec<String>>,
    ) -> Synchronizer {
        Synchronizer {
            fetcher,
            splits,
            segments,
            flag_sets,
        }
    }

    pub fn split_storage(&self) -> &Arc<InMemorySplitStorage> {
        &self.splits
    }

    pub fn segment_storage(&self) -> &Arc<InMemorySegmentStorage> {
        &self.segments
    }

    fn sets_csv(&self) -> Option<String> {
        self.flag_sets.as_ref().map(|sets| sets.join(","))
    }

    /// One flag-feed cycle: fetch until the feed reports no more changes,
    /// then fetch any segments newly referenced by the received flags.
    pub async fn sync_splits(&self) -> Result<()> {
        let new_segments = self.fetch_splits_tail(None).await?;
        for segment in new_segments {
            self.sync_segment(&segment, None).await?;
        }
        Ok(())
    }

    /// Catch-up fetch to reach at least `target` on the flag feed. Retries
    /// with backoff, then with the CDN-bypassing `till`, then gives up until
    /// the next scheduled poll.
    pub async fn sync_splits_until(&self, target: ChangeNumber) -> Result<()> {
        if self.splits.change_number() >= target {
            return Ok(());
        }

        let mut backoff = Backoff::new(ON_DEMAND_BACKOFF_BASE, ON_DEMAND_BACKOFF_MAX);
        for _ in 0..ON_DEMAND_MAX_ATTEMPTS {
            let new_segments = self.fetch_splits_tail(None).await?;
            for segment in new_segments {
                self.sync_segment(&segment, None).await?;
            }
            if self.splits.change_number() >= target {
                return Ok(());
            }
            tokio::time::sleep(backoff.next()).await;
        }

        backoff.reset();
        for _ in 0..ON_DEMAND_MAX_ATTEMPTS {
            let new_segments = self.fetch_splits_tail(Some(target)).await?;
            for segment in new_segments {
                self.sync_segment(&segment, None).await?;
            }
            if self.splits.change_number() >= target {
                return Ok(());
            }
            tokio::time::sleep(backoff.next()).await;
        }

        log::warn!(
            target: "splitio",
            "could not catch the flag feed up to {target}, next poll will retry",
        );
        Ok(())
    }

    /// One segment cycle: fetch deltas until the feed reports no more
    /// changes (or `target` is reached when given).
    pub async fn sync_segment(&self, name: &str, target: Option<ChangeNumber>) -> Result<()> {
        if let Some(target) = target {
            if self.segments.change_number(name).unwrap_or(-1) >= target {
                return Ok(());
            }
        }

        loop {
            let since = self.segments.change_number(name).unwrap_or(-1);
            let changes =
                fetch_with_retry(|| self.fetcher.fetch_segment(name, since, None)).await?;
            self.segments
                .update(name, &changes.added, &changes.removed, changes.till);
            if changes.till <= changes.since {
                break;
            }
            if let Some(target) = target {
                if changes.till >= target {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Refresh every segment known to storage.
    pub async fn sync_segments(&self) -> Result<()> {
        for name in self.segments.segment_names() {
            self.sync_segment(&name, None).await?;
        }
        Ok(())
    }

    /// Full sync: the flag feed plus every referenced segment. Used for the
    /// initial readiness sync and for post-reconnect catch-ups.
    pub async fn sync_all(&self) -> Result<()> {
        self.sync_splits().await?;
        self.sync_segments().await?;
        Ok(())
    }

    async fn fetch_splits_tail(&self, till: Option<ChangeNumber>) -> Result<Vec<String>> {
        let sets = self.sets_csv();
        let mut new_segments = Vec::new();
        loop {
            let since = self.splits.change_number();
            let changes =
                fetch_with_retry(|| self.fetcher.fetch_splits(since, sets.as_deref(), till))
                    .await?;
            let done = changes.till <= changes.since;
            new_segments.extend(self.apply_split_changes(changes));
            if done {
                break;
            }
        }
        Ok(new_segments)
    }

    /// Apply one delta: archived flags (and flags outside the configured
    /// sets) are dropped, the rest upserted. Returns referenced segments not
    /// yet in storage.
    fn apply_split_changes(&self, changes: SplitChanges) -> Vec<String> {
        let mut upserts: Vec<Split> = Vec::new();
        let mut removals: Vec<String> = Vec::new();

        for parsed in changes.splits {
            let Some(split) = Option::<Split>::from(parsed) else {
                log::warn!(target: "splitio", "skipping a flag definition this SDK cannot parse");
                continue;
            };
            let in_filter = match &self.flag_sets {
                Some(filter) => split.sets.iter().any(|set| filter.contains(set)),
                None => true,
            };
            if split.is_active() && in_filter {
                upserts.push(split);
            } else {
                removals.push(split.name);
            }
        }

        let mut new_segments: Vec<String> = upserts
            .iter()
            .flat_map(|split| split.segment_names())
            .filter(|name| self.segments.change_number(name).is_none())
            .map(str::to_owned)
            .collect();
        new_segments.sort();
        new_segments.dedup();

        self.splits.apply(upserts, &removals, changes.till);
        new_segments
    }
}
