//! InfluxDB v2 backend for `TimeSeriesStore`: Flux over `/api/v2/query`,
//! annotated-CSV responses decoded with the `csv` crate.

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::ReadError;
use crate::timeseries::{Sample, TimeSeriesStore};

pub struct InfluxClient {
    client: reqwest::Client,
    url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxClient {
    pub fn new(url: &str, org: &str, bucket: &str, token: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            token: token.to_string(),
        })
    }

    async fn query(&self, flux: String) -> Result<Vec<HashMap<String, String>>, ReadError> {
        debug!(flux = %flux, "influx query");
        let resp = self
            .client
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", &self.org)])
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/csv")
            .json(&QueryRequest {
                query: &flux,
                kind: "flux",
                dialect: Dialect {
                    header: true,
                    annotations: &[],
                    delimiter: ",",
                },
            })
            .send()
            .await
            .map_err(|e| ReadError::Unreachable(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ReadError::Unreachable(e.to_string()))?;
        if !status.is_success() {
            return Err(ReadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        parse_csv(&body)
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    dialect: Dialect<'a>,
}

#[derive(Serialize)]
struct Dialect<'a> {
    header: bool,
    annotations: &'a [&'a str],
    delimiter: &'a str,
}

impl TimeSeriesStore for InfluxClient {
    fn measurement_names(&self) -> BoxFuture<'_, Result<Vec<String>, ReadError>> {
        Box::pin(async move {
            let rows = self.query(measurements_query(&self.bucket)).await?;
            Ok(rows.into_iter().filter_map(|mut r| r.remove("_value")).collect())
        })
    }

    fn latest<'a>(
        &'a self,
        measurement: &'a str,
        within: Duration,
    ) -> BoxFuture<'a, Result<Vec<Sample>, ReadError>> {
        Box::pin(async move {
            let rows = self
                .query(latest_query(&self.bucket, measurement, within))
                .await?;
            rows_to_samples(rows, measurement)
        })
    }

    fn windowed_median<'a>(
        &'a self,
        measurement: &'a str,
        range: Duration,
        every: Duration,
    ) -> BoxFuture<'a, Result<Vec<Sample>, ReadError>> {
        Box::pin(async move {
            let rows = self
                .query(median_query(&self.bucket, measurement, range, every))
                .await?;
            rows_to_samples(rows, measurement)
        })
    }
}

// ---------------------------------------------------------------------------
// Flux
// ---------------------------------------------------------------------------

fn flux_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn measurements_query(bucket: &str) -> String {
    format!(
        "import \"influxdata/influxdb/schema\"\nschema.measurements(bucket: {})",
        flux_string(bucket)
    )
}

fn latest_query(bucket: &str, measurement: &str, within: Duration) -> String {
    format!(
        "from(bucket: {})\n  \
         |> range(start: -{}s)\n  \
         |> filter(fn: (r) => r._measurement == {})\n  \
         |> last()",
        flux_string(bucket),
        within.as_secs(),
        flux_string(measurement)
    )
}

/// `median` only accepts numeric columns, so bool and string fields are
/// dropped before aggregating.
fn median_query(bucket: &str, measurement: &str, range: Duration, every: Duration) -> String {
    format!(
        "import \"types\"\n\
         from(bucket: {})\n  \
         |> range(start: -{}s)\n  \
         |> filter(fn: (r) => r._measurement == {})\n  \
         |> filter(fn: (r) => {NUMERIC_VALUE})\n  \
         |> aggregateWindow(every: {}s, fn: median, createEmpty: false)",
        flux_string(bucket),
        range.as_secs(),
        flux_string(measurement),
        every.as_secs()
    )
}

const NUMERIC_VALUE: &str = "types.isType(v: r._value, type: \"float\") \
     or types.isType(v: r._value, type: \"int\") \
     or types.isType(v: r._value, type: \"uint\")";

// ---------------------------------------------------------------------------
// CSV decoding
// ---------------------------------------------------------------------------

fn is_header(record: &csv::StringRecord) -> bool {
    (record.get(1) == Some("result") && record.get(2) == Some("table"))
        || (record.get(0) == Some("error") && record.get(1) == Some("reference"))
}

/// Decode a (possibly multi-table) Flux CSV response into column→cell maps.
/// An in-band error table becomes `ReadError::Rejected`.
fn parse_csv(body: &str) -> Result<Vec<HashMap<String, String>>, ReadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| ReadError::Malformed(e.to_string()))?;
        let blank = record.iter().all(|f| f.trim().is_empty());
        let annotation = record.get(0).is_some_and(|f| f.starts_with('#'));
        if blank || annotation {
            continue;
        }
        if is_header(&record) {
            header = Some(record.iter().map(str::to_string).collect());
            continue;
        }
        let Some(columns) = &header else {
            return Err(ReadError::Malformed("data row before header".to_string()));
        };

        let row: HashMap<String, String> = columns
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();

        if columns.first().map(String::as_str) == Some("error") {
            return Err(ReadError::Rejected {
                status: 200,
                body: row.get("error").cloned().unwrap_or_default(),
            });
        }
        rows.push(row);
    }

    Ok(rows)
}

fn rows_to_samples(
    rows: Vec<HashMap<String, String>>,
    measurement: &str,
) -> Result<Vec<Sample>, ReadError> {
    rows.into_iter()
        .map(|mut row| {
            let field = row
                .remove("_field")
                .ok_or_else(|| ReadError::Malformed("row without _field".to_string()))?;
            let value = row.remove("_value").map(|v| parse_value(&v)).unwrap_or(Value::Null);
            let time = match row.remove("_time") {
                Some(t) if !t.is_empty() => Some(
                    OffsetDateTime::parse(&t, &Rfc3339)
                        .map_err(|e| ReadError::Malformed(format!("bad _time '{t}': {e}")))?,
                ),
                _ => None,
            };
            Ok(Sample {
                measurement: row
                    .remove("_measurement")
                    .unwrap_or_else(|| measurement.to_string()),
                field,
                value,
                time,
            })
        })
        .collect()
}

fn parse_value(cell: &str) -> Value {
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match cell {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
