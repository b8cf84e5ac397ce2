//! Fuses live telemetry with the device registry.
//!
//! Join rules between a discovered measurement and the registry:
//! - readings + config → a node in the online view
//! - readings, no config → left out of the view, logged and recorded as an
//!   operator inconsistency
//! - config, no readings in the last 48h → offline, simply absent

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::db::{Db, DeviceConfig};
use crate::error::{CoreError, CoreResult};
use crate::normalize::NodeFields;
use crate::notify::Notification;
use crate::state::SharedEvents;
use crate::timeseries::{SeriesPoint, TimeSeriesReader};

/// Moisture readings at or below this percentage look like a pulled or
/// broken sensor, not a dry plant. No alert fires for them.
pub const DEAD_BAND_FLOOR: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedNodeView {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub show_warning: bool,
    pub fields: NodeFields,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(flatten)]
    pub fields: NodeFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    pub day: Vec<HistoryPoint>,
    pub week: Vec<HistoryPoint>,
    pub month: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdAlert {
    pub thresholds_reached: bool,
    pub message: Notification,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Dashboard warning: the plant is at or below its threshold.
pub fn show_warning(threshold: Option<i64>, moisture: Option<i64>) -> bool {
    matches!((threshold, moisture), (Some(t), Some(m)) if m <= t)
}

/// Push alert: like `show_warning`, but never for readings inside the
/// dead band.
pub fn threshold_reached(threshold: Option<i64>, moisture: Option<i64>) -> bool {
    matches!((threshold, moisture), (Some(t), Some(m)) if m > DEAD_BAND_FLOOR && m <= t)
}

pub fn alert_message(name: &str) -> Notification {
    Notification {
        title: "Garden alert".to_string(),
        body: format!("{name} is getting dry and needs water."),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Engine {
    reader: TimeSeriesReader,
    db: Db,
    public_url: String,
    events: SharedEvents,
}

impl Engine {
    pub fn new(reader: TimeSeriesReader, db: Db, public_url: &str, events: SharedEvents) -> Self {
        Self {
            reader,
            db,
            public_url: public_url.trim_end_matches('/').to_string(),
            events,
        }
    }

    pub fn reader(&self) -> &TimeSeriesReader {
        &self.reader
    }

    /// Every device that currently reports and has a config, ordered by id.
    pub async fn build_online_nodes_view(&self) -> CoreResult<Vec<FusedNodeView>> {
        let names = self.reader.list_measurement_names().await?;

        let results =
            futures::future::join_all(names.iter().map(|name| self.node_view(name))).await;

        let mut nodes = Vec::with_capacity(names.len());
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(Some(view)) => nodes.push(view),
                Ok(None) => {}
                Err(e) => warn!(measurement = %name, error = %e, "skipping node"),
            }
        }
        Ok(nodes)
    }

    async fn node_view(&self, measurement: &str) -> CoreResult<Option<FusedNodeView>> {
        let (latest, device) = tokio::join!(
            self.reader.latest_sample(measurement),
            self.db.get_device(measurement),
        );
        let latest = latest?;
        let device = device.map_err(CoreError::Persistence)?;

        if latest.is_empty() {
            debug!(measurement = %measurement, "no recent samples, node offline");
            return Ok(None);
        }

        let Some(device) = device else {
            warn!(measurement = %measurement, "measurement has readings but no device config");
            self.events
                .write()
                .await
                .record_unmatched_measurement(measurement);
            return Ok(None);
        };

        let fields = NodeFields::from_raw(latest);
        Ok(Some(FusedNodeView {
            show_warning: show_warning(device.threshold, fields.moisture),
            image_url: self.image_url(&device),
            id: device.id,
            name: device.name,
            fields,
        }))
    }

    /// Latest normalised readings for one device.
    pub async fn build_current_measurements(&self, id: &str) -> CoreResult<NodeFields> {
        let latest = self.reader.latest_sample(id).await?;
        if latest.is_empty() {
            return Err(CoreError::not_found(format!(
                "no measurements for '{id}' in the last 48 hours"
            )));
        }
        Ok(NodeFields::from_raw(latest))
    }

    pub async fn build_history(&self, id: &str) -> CoreResult<History> {
        let aggregates = self.reader.historical_aggregates(id).await?;
        Ok(History {
            day: to_history(aggregates.day),
            week: to_history(aggregates.week),
            month: to_history(aggregates.month),
        })
    }

    /// Decide whether `id` should trigger a push alert right now.
    pub async fn evaluate_threshold(&self, id: &str) -> CoreResult<ThresholdAlert> {
        let (latest, device) = tokio::join!(self.reader.latest_sample(id), self.db.get_device(id));
        let device = device
            .map_err(CoreError::Persistence)?
            .ok_or_else(|| CoreError::not_found(format!("device '{id}' not found")))?;
        let moisture = NodeFields::from_raw(latest?).moisture;

        if threshold_reached(device.threshold, moisture) {
            Ok(ThresholdAlert {
                thresholds_reached: true,
                message: alert_message(&device.name),
            })
        } else {
            Ok(ThresholdAlert {
                thresholds_reached: false,
                message: Notification {
                    title: String::new(),
                    body: String::new(),
                },
            })
        }
    }

    fn image_url(&self, device: &DeviceConfig) -> Option<String> {
        device
            .image_ref
            .as_deref()
            .map(|r| format!("{}/{}", self.public_url, r.trim_start_matches('/')))
    }
}

/// A device field called `time` would shadow the point's own timestamp
/// once flattened, so it is dropped.
fn to_history(points: Vec<SeriesPoint>) -> Vec<HistoryPoint> {
    points
        .into_iter()
        .map(|(time, raw)| {
            let mut fields = NodeFields::from_raw(raw);
            if fields.extra.remove("time").is_some() {
                debug!(%time, "dropping device field 'time' from history point");
            }
            HistoryPoint { time, fields }
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
