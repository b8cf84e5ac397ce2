//! Read side of the time-series store: device discovery, latest sample per
//! device, and median-bucketed history at three granularities.
//!
//! `TimeSeriesStore` is the seam to the concrete backend (`influx.rs` in
//! production, `test_support::MemoryStore` in tests). `TimeSeriesReader`
//! layers the hub's policy on top: recency window, aggregation windows,
//! infrastructure filtering and a bounded timeout on every call.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::ReadError;
use crate::normalize::is_infrastructure_metric;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// A node with no sample inside this window is considered offline.
pub const LATEST_WINDOW: Duration = Duration::from_secs(2 * DAY);

/// (range, bucket width) for the day / week / month history views.
pub const DAY_WINDOW: (Duration, Duration) =
    (Duration::from_secs(DAY), Duration::from_secs(15 * 60));
pub const WEEK_WINDOW: (Duration, Duration) =
    (Duration::from_secs(7 * DAY), Duration::from_secs(6 * HOUR));
pub const MONTH_WINDOW: (Duration, Duration) =
    (Duration::from_secs(30 * DAY), Duration::from_secs(6 * HOUR));

// ---------------------------------------------------------------------------
// Store seam
// ---------------------------------------------------------------------------

/// One `(measurement, field, value, time)` row from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub measurement: String,
    pub field: String,
    pub value: Value,
    pub time: Option<OffsetDateTime>,
}

/// Raw primitives offered by a time-series backend over one bucket.
pub trait TimeSeriesStore: Send + Sync {
    /// Every distinct measurement name currently in the bucket.
    fn measurement_names(&self) -> BoxFuture<'_, Result<Vec<String>, ReadError>>;

    /// The most recent sample of each field of `measurement` no older than `within`.
    fn latest<'a>(
        &'a self,
        measurement: &'a str,
        within: Duration,
    ) -> BoxFuture<'a, Result<Vec<Sample>, ReadError>>;

    /// Per-bucket medians over the last `range`, buckets `every` wide. Empty
    /// buckets produce no rows.
    fn windowed_median<'a>(
        &'a self,
        measurement: &'a str,
        range: Duration,
        every: Duration,
    ) -> BoxFuture<'a, Result<Vec<Sample>, ReadError>>;
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// `(timestamp, field -> value)` point of an aggregated series.
pub type SeriesPoint = (OffsetDateTime, BTreeMap<String, Value>);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalAggregates {
    pub day: Vec<SeriesPoint>,
    pub week: Vec<SeriesPoint>,
    pub month: Vec<SeriesPoint>,
}

#[derive(Clone)]
pub struct TimeSeriesReader {
    store: Arc<dyn TimeSeriesStore>,
    timeout: Duration,
}

impl TimeSeriesReader {
    pub fn new(store: Arc<dyn TimeSeriesStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Distinct device measurement names, infrastructure metrics removed.
    pub async fn list_measurement_names(&self) -> Result<Vec<String>, ReadError> {
        let names = self.bounded(self.store.measurement_names()).await?;
        let unique: BTreeSet<String> = names
            .into_iter()
            .filter(|name| !is_infrastructure_metric(name))
            .collect();
        Ok(unique.into_iter().collect())
    }

    /// Latest value of each field within the 48h window. An empty map means
    /// the node is currently offline; it is not an error.
    pub async fn latest_sample(
        &self,
        measurement: &str,
    ) -> Result<BTreeMap<String, Value>, ReadError> {
        let samples = self
            .bounded(self.store.latest(measurement, LATEST_WINDOW))
            .await?;
        Ok(newest_per_field(samples))
    }

    /// Day / week / month median series for `measurement`, each ascending.
    pub async fn historical_aggregates(
        &self,
        measurement: &str,
    ) -> Result<HistoricalAggregates, ReadError> {
        let (day, week, month) = tokio::try_join!(
            self.series(measurement, DAY_WINDOW),
            self.series(measurement, WEEK_WINDOW),
            self.series(measurement, MONTH_WINDOW),
        )?;
        Ok(HistoricalAggregates { day, week, month })
    }

    async fn series(
        &self,
        measurement: &str,
        (range, every): (Duration, Duration),
    ) -> Result<Vec<SeriesPoint>, ReadError> {
        let samples = self
            .bounded(self.store.windowed_median(measurement, range, every))
            .await?;
        Ok(group_by_time(samples))
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ReadError>>,
    ) -> Result<T, ReadError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))?
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn newest_per_field(samples: Vec<Sample>) -> BTreeMap<String, Value> {
    let mut newest: BTreeMap<String, (Option<OffsetDateTime>, Value)> = BTreeMap::new();
    for s in samples {
        match newest.get(&s.field) {
            Some((seen, _)) if *seen >= s.time => {}
            _ => {
                newest.insert(s.field, (s.time, s.value));
            }
        }
    }
    newest.into_iter().map(|(k, (_, v))| (k, v)).collect()
}

/// Pivot per-field rows into one point per timestamp. Rows without a
/// timestamp cannot be placed on a series and are dropped.
fn group_by_time(samples: Vec<Sample>) -> Vec<SeriesPoint> {
    let mut by_time: BTreeMap<OffsetDateTime, BTreeMap<String, Value>> = BTreeMap::new();
    for s in samples {
        if let Some(t) = s.time {
            by_time.entry(t).or_default().insert(s.field, s.value);
        }
    }
    by_time.into_iter().collect()
}

// ===========================================================================
// Tests
// ===========================================================================
