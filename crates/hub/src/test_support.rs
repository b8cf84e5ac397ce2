//! In-memory doubles for the time-series store and the push transport.

use axum::Router;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;

use crate::db::Db;
use crate::error::{DeliveryError, ReadError};
use crate::notify::{Notification, PushSubscription, PushTransport};
use crate::timeseries::{Sample, TimeSeriesStore};

pub async fn test_db() -> Db {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    samples: Mutex<Vec<Sample>>,
    failure: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, measurement: &str, field: &str, value: Value, time: OffsetDateTime) {
        self.samples.lock().unwrap().push(Sample {
            measurement: measurement.to_string(),
            field: field.to_string(),
            value,
            time: Some(time),
        });
    }

    /// Every subsequent call fails as if the store were unreachable.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn respond<T: Send + 'static>(&self, value: T) -> BoxFuture<'static, Result<T, ReadError>> {
        let failure = self.failure.lock().unwrap().clone();
        let delay = *self.delay.lock().unwrap();
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match failure {
                Some(msg) => Err(ReadError::Unreachable(msg)),
                None => Ok(value),
            }
        })
    }

    fn since(&self, measurement: &str, range: Duration) -> Vec<Sample> {
        let cutoff = OffsetDateTime::now_utc() - range;
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.measurement == measurement && s.time.is_some_and(|t| t >= cutoff))
            .cloned()
            .collect()
    }
}

impl TimeSeriesStore for MemoryStore {
    fn measurement_names(&self) -> BoxFuture<'_, Result<Vec<String>, ReadError>> {
        let names: BTreeSet<String> = self
            .samples
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.measurement.clone())
            .collect();
        self.respond(names.into_iter().collect())
    }

    fn latest<'a>(
        &'a self,
        measurement: &'a str,
        within: Duration,
    ) -> BoxFuture<'a, Result<Vec<Sample>, ReadError>> {
        self.respond(self.since(measurement, within))
    }

    fn windowed_median<'a>(
        &'a self,
        measurement: &'a str,
        range: Duration,
        every: Duration,
    ) -> BoxFuture<'a, Result<Vec<Sample>, ReadError>> {
        let width = every.as_secs() as i64;
        let mut buckets: BTreeMap<(i64, String), Vec<f64>> = BTreeMap::new();
        for s in self.since(measurement, range) {
            let (Some(t), Some(v)) = (s.time, s.value.as_f64()) else {
                continue;
            };
            let ts = t.unix_timestamp();
            buckets
                .entry((ts - ts.rem_euclid(width), s.field))
                .or_default()
                .push(v);
        }

        let rows = buckets
            .into_iter()
            .map(|((start, field), mut values)| {
                values.sort_by(|a, b| a.total_cmp(b));
                let mid = values.len() / 2;
                let median = if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                };
                Sample {
                    measurement: measurement.to_string(),
                    field,
                    value: serde_json::json!(median),
                    // window stop, like aggregateWindow's default time column
                    time: OffsetDateTime::from_unix_timestamp(start + width).ok(),
                }
            })
            .collect();
        self.respond(rows)
    }
}

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Notification)>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries to `endpoint` are rejected from now on.
    pub fn fail_endpoint(&self, endpoint: &str) {
        self.failing.lock().unwrap().insert(endpoint.to_string());
    }

    /// Deliveries to `endpoint` stall for `delay` before completing.
    pub fn delay_endpoint(&self, endpoint: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), delay);
    }

    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, endpoint: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .count()
    }
}

impl PushTransport for RecordingTransport {
    fn send<'a>(
        &'a self,
        subscription: &'a PushSubscription,
        payload: &'a Notification,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        let endpoint = subscription.endpoint.clone();
        self.sent
            .lock()
            .unwrap()
            .push((endpoint.clone(), payload.clone()));
        let rejected = self.failing.lock().unwrap().contains(&endpoint);
        let delay = self.delays.lock().unwrap().get(&endpoint).copied();
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if rejected {
                Err(DeliveryError::Rejected {
                    status: 500,
                    body: "push service error".into(),
                })
            } else {
                Ok(())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Local HTTP stub
// ---------------------------------------------------------------------------

/// Serve `app` on an ephemeral localhost port and return its base URL.
pub async fn serve_stub(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A localhost URL nothing is listening on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// A valid subscription descriptor blob for `endpoint`.
pub fn subscription_json(endpoint: &str) -> String {
    serde_json::json!({
        "endpoint": endpoint,
        "keys": {
            "p256dh": "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM",
            "auth": "tBHItJI5svbpez7KI4CCXg"
        }
    })
    .to_string()
}
