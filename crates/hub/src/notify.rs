//! Push-notification subscriptions and rate-limited delivery.
//!
//! Two send paths exist:
//! - `notify_one` is the manual "send me a test" path. It always tries once
//!   and never touches `last_notified`.
//! - `notify_many` is the alerting path. Each subscription gets at most one
//!   delivery attempt per `MIN_GAP` window, claimed atomically in the
//!   store before sending, and every subscription is handled independently.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::db::{Db, SubscriptionRow};
use crate::error::{CoreError, CoreResult, DeliveryError};
use crate::state::SharedEvents;

/// Minimum spacing between two bulk deliveries to the same subscription.
pub const MIN_GAP: Duration = Duration::from_secs(3 * 60 * 60);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Decoded browser push subscription (the stored blob is kept verbatim).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// What the service worker on the other end renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn threshold_reached() -> Self {
        Self {
            title: "Garden alert".to_string(),
            body: "A plant has reached its moisture threshold.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub throttled: usize,
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

pub trait PushTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        subscription: &'a PushSubscription,
        payload: &'a Notification,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Hands each message to an HTTP push relay, which owns the encrypted Web
/// Push exchange with the browser vendor.
pub struct RelayTransport {
    client: reqwest::Client,
    relay_url: String,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    subscription: &'a PushSubscription,
    payload: &'a Notification,
}

impl RelayTransport {
    pub fn new(relay_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            relay_url: relay_url.to_string(),
        })
    }
}

impl PushTransport for RelayTransport {
    fn send<'a>(
        &'a self,
        subscription: &'a PushSubscription,
        payload: &'a Notification,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(&self.relay_url)
                .json(&RelayRequest {
                    subscription,
                    payload,
                })
                .send()
                .await
                .map_err(|e| DeliveryError::Unreachable(e.to_string()))?;

            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            if status.as_u16() == 404 || status.as_u16() == 410 {
                return Err(DeliveryError::Gone(status.as_u16()));
            }
            let body = resp.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    db: Db,
    transport: Arc<dyn PushTransport>,
    timeout: Duration,
    events: SharedEvents,
}

impl Dispatcher {
    pub fn new(
        db: Db,
        transport: Arc<dyn PushTransport>,
        timeout: Duration,
        events: SharedEvents,
    ) -> Self {
        Self {
            db,
            transport,
            timeout,
            events,
        }
    }

    /// Store or fully replace a subscription blob. True when newly created.
    pub async fn register_or_replace_subscription(
        &self,
        id: &str,
        payload: &Value,
    ) -> CoreResult<bool> {
        let blob = payload.to_string();
        self.db
            .put_subscription(id, &blob)
            .await
            .map_err(CoreError::Persistence)
    }

    pub async fn remove_subscription(&self, id: &str) -> CoreResult<bool> {
        self.db
            .delete_subscription(id)
            .await
            .map_err(CoreError::Persistence)
    }

    /// Send the fixed threshold message to one subscription right now.
    /// Delivery problems come back as `Ok(false)`; only an unknown id or a
    /// store failure is an error.
    pub async fn notify_one(&self, id: &str) -> CoreResult<bool> {
        let row = self
            .db
            .get_subscription(id)
            .await
            .map_err(CoreError::Persistence)?
            .ok_or_else(|| CoreError::not_found(format!("subscription '{id}' not found")))?;

        match self.deliver(&row, &Notification::threshold_reached()).await {
            Ok(()) => {
                info!(subscription = %id, "test notification delivered");
                Ok(true)
            }
            Err(e) => {
                warn!(subscription = %id, error = %e, "test notification failed");
                Ok(false)
            }
        }
    }

    /// Fan `message` out to `ids` (every subscription when `ids` is empty).
    pub async fn notify_many(
        &self,
        ids: &[String],
        message: &Notification,
    ) -> CoreResult<DispatchReport> {
        self.notify_many_at(ids, message, OffsetDateTime::now_utc()).await
    }

    pub(crate) async fn notify_many_at(
        &self,
        ids: &[String],
        message: &Notification,
        now: OffsetDateTime,
    ) -> CoreResult<DispatchReport> {
        let targets = self.targets(ids).await?;
        let now = now.unix_timestamp();

        let outcomes = futures::future::join_all(
            targets
                .iter()
                .map(|row| self.dispatch_one(row, message, now)),
        )
        .await;

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Throttled => report.throttled += 1,
                Outcome::Delivered => {
                    report.attempted += 1;
                    report.delivered += 1;
                }
                Outcome::Failed => {
                    report.attempted += 1;
                    report.failed += 1;
                }
            }
        }

        info!(
            targets = targets.len(),
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            throttled = report.throttled,
            "bulk notification dispatched"
        );
        Ok(report)
    }

    async fn targets(&self, ids: &[String]) -> CoreResult<Vec<SubscriptionRow>> {
        if ids.is_empty() {
            return self
                .db
                .list_subscriptions()
                .await
                .map_err(CoreError::Persistence);
        }

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            match self.db.get_subscription(id).await.map_err(CoreError::Persistence)? {
                Some(row) => rows.push(row),
                None => debug!(subscription = %id, "notify target not subscribed"),
            }
        }
        Ok(rows)
    }

    async fn dispatch_one(
        &self,
        row: &SubscriptionRow,
        message: &Notification,
        now: i64,
    ) -> Outcome {
        let gap = MIN_GAP.as_secs() as i64;
        match self.db.claim_notification_slot(&row.id, now, gap).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(subscription = %row.id, "notified recently, skipping");
                return Outcome::Throttled;
            }
            Err(e) => {
                warn!(subscription = %row.id, error = %e, "could not claim notification slot");
                return Outcome::Failed;
            }
        }

        match self.deliver(row, message).await {
            Ok(()) => Outcome::Delivered,
            Err(e) => {
                warn!(subscription = %row.id, error = %e, "push delivery failed");
                self.events
                    .write()
                    .await
                    .record_delivery_failure(&row.id, &e.to_string());
                Outcome::Failed
            }
        }
    }

    async fn deliver(
        &self,
        row: &SubscriptionRow,
        message: &Notification,
    ) -> Result<(), DeliveryError> {
        let subscription: PushSubscription = serde_json::from_str(&row.payload)?;
        tokio::time::timeout(self.timeout, self.transport.send(&subscription, message))
            .await
            .map_err(|_| DeliveryError::Timeout(self.timeout))?
    }
}

enum Outcome {
    Delivered,
    Failed,
    Throttled,
}

// ===========================================================================
// Tests
// ===========================================================================
