//! Raw sensor units → domain units, plus the typed field set every node
//! reading is folded into.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Raw capacitive reading at (or below) which the soil counts as saturated.
const MOISTURE_RAW_WET: f64 = 1500.0;
/// Raw capacitive reading at (or above) which the soil counts as bone dry.
const MOISTURE_RAW_DRY: f64 = 3000.0;

/// Measurement-name prefixes the time-series engine uses for its own
/// internal telemetry. Anything matching is never a garden device.
const INFRASTRUCTURE_PREFIXES: &[&str] = &[
    "boltdb_",
    "go_",
    "http_",
    "influxdb_",
    "qc_",
    "query_",
    "service_",
    "storage_",
    "task_",
];

// ---------------------------------------------------------------------------
// Pure conversions
// ---------------------------------------------------------------------------

/// Convert a raw soil-moisture reading to a 0..=100 percentage.
///
/// The sensor reads lower the wetter the soil is. Readings at or below
/// 1500 are fully wet, at or above 3000 fully dry, and everything in
/// between maps linearly as `round(200 - raw / 15)`.
pub fn normalize_moisture(raw: f64) -> i64 {
    if raw <= MOISTURE_RAW_WET {
        100
    } else if raw >= MOISTURE_RAW_DRY {
        0
    } else {
        (200.0 - raw / 15.0).round() as i64
    }
}

/// True when `name` belongs to the time-series engine rather than a device.
pub fn is_infrastructure_metric(name: &str) -> bool {
    INFRASTRUCTURE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

// ---------------------------------------------------------------------------
// Typed field set
// ---------------------------------------------------------------------------

/// One node's readings with the known fields pulled out and normalised.
/// Fields the hub does not know about are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeFields {
    /// Soil moisture in percent (already normalised from raw units).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moisture: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl NodeFields {
    /// Fold a raw `field -> value` map from the time-series store.
    ///
    /// A recognised field whose value is not numeric is kept in `extra`
    /// instead of being dropped.
    pub fn from_raw(raw: BTreeMap<String, Value>) -> Self {
        let mut fields = NodeFields::default();

        for (name, value) in raw {
            let number = value.as_f64();
            match (name.as_str(), number) {
                ("moisture", Some(v)) => fields.moisture = Some(normalize_moisture(v)),
                ("temperature", Some(v)) => fields.temperature = Some(v),
                ("humidity", Some(v)) => fields.humidity = Some(v),
                ("battery", Some(v)) => fields.battery = Some(v),
                _ => {
                    fields.extra.insert(name, value);
                }
            }
        }

        fields
    }
}

// ===========================================================================
// Tests
// ===========================================================================
