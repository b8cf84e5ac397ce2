use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::{Db, DeviceConfig, DeviceUpdate};
use crate::engine::{Engine, FusedNodeView, History, ThresholdAlert};
use crate::error::{CoreError, CoreResult};
use crate::normalize::NodeFields;
use crate::notify::{DispatchReport, Dispatcher, Notification};
use crate::state::{SharedEvents, StatusResponse};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub db: Db,
    pub dispatcher: Dispatcher,
    pub events: SharedEvents,
}

#[derive(Debug, Deserialize)]
struct ImageRequest {
    reference: String,
}

#[derive(Debug, Serialize)]
struct TestDelivery {
    delivered: bool,
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    #[serde(default)]
    ids: Vec<String>,
    title: String,
    body: String,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/nodes", get(api_nodes))
        .route("/api/nodes/{id}/measurements", get(api_measurements))
        .route("/api/nodes/{id}/history", get(api_history))
        .route("/api/nodes/{id}/thresholds", get(api_thresholds))
        .route("/api/devices", get(api_devices))
        .route("/api/devices/{id}", get(api_device).put(api_put_device))
        .route("/api/devices/{id}/image", put(api_put_image))
        .route(
            "/api/subscriptions/{id}",
            put(api_put_subscription).delete(api_delete_subscription),
        )
        .route("/api/subscriptions/{id}/test", post(api_test_subscription))
        .route("/api/notify", post(api_notify))
        .with_state(state)
}

fn require_id(id: &str) -> CoreResult<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(CoreError::validation("id must not be empty"));
    }
    Ok(id)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> CoreResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| CoreError::validation(rejection.body_text()))
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.events.read().await.to_status())
}

// -- telemetry ---------------------------------------------------------------

async fn api_nodes(State(state): State<AppState>) -> CoreResult<Json<Vec<FusedNodeView>>> {
    Ok(Json(state.engine.build_online_nodes_view().await?))
}

async fn api_measurements(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> CoreResult<Json<NodeFields>> {
    let id = require_id(&id)?;
    Ok(Json(state.engine.build_current_measurements(id).await?))
}

async fn api_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> CoreResult<Json<History>> {
    let id = require_id(&id)?;
    Ok(Json(state.engine.build_history(id).await?))
}

async fn api_thresholds(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> CoreResult<Json<ThresholdAlert>> {
    let id = require_id(&id)?;
    Ok(Json(state.engine.evaluate_threshold(id).await?))
}

// -- device registry ---------------------------------------------------------

async fn api_devices(State(state): State<AppState>) -> CoreResult<Json<Vec<DeviceConfig>>> {
    let devices = state.db.list_devices().await.map_err(CoreError::Persistence)?;
    Ok(Json(devices))
}

async fn api_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> CoreResult<Json<DeviceConfig>> {
    let id = require_id(&id)?;
    state
        .db
        .get_device(id)
        .await
        .map_err(CoreError::Persistence)?
        .map(Json)
        .ok_or_else(|| CoreError::not_found(format!("device '{id}' not found")))
}

async fn api_put_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<DeviceUpdate>, JsonRejection>,
) -> CoreResult<Response> {
    let id = require_id(&id)?;
    let update = body(payload)?;
    if update.interval <= 0 {
        return Err(CoreError::validation("interval must be positive"));
    }
    if let Some(t) = update.threshold {
        if !(0..=100).contains(&t) {
            return Err(CoreError::validation(format!(
                "threshold {t} out of range [0, 100]"
            )));
        }
    }

    let (device, created) = state
        .db
        .upsert_device(id, &update)
        .await
        .map_err(CoreError::Persistence)?;
    info!(device = %id, version = device.version, created, "device config stored");

    if created {
        Ok((StatusCode::CREATED, Json(device)).into_response())
    } else {
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

async fn api_put_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> CoreResult<StatusCode> {
    let id = require_id(&id)?;
    let req = body(payload)?;
    if req.reference.trim().is_empty() {
        return Err(CoreError::validation("reference must not be empty"));
    }

    state
        .db
        .set_image_reference(id, req.reference.trim())
        .await
        .map_err(CoreError::Persistence)?
        .ok_or_else(|| CoreError::not_found(format!("device '{id}' not found")))?;
    Ok(StatusCode::NO_CONTENT)
}

// -- push subscriptions ------------------------------------------------------

async fn api_put_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> CoreResult<StatusCode> {
    let id = require_id(&id)?;
    let descriptor = body(payload)?;
    if !descriptor.is_object() {
        return Err(CoreError::validation("subscription must be a JSON object"));
    }

    let created = state
        .dispatcher
        .register_or_replace_subscription(id, &descriptor)
        .await?;
    Ok(if created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    })
}

async fn api_delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> CoreResult<StatusCode> {
    let id = require_id(&id)?;
    if state.dispatcher.remove_subscription(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::not_found(format!("subscription '{id}' not found")))
    }
}

async fn api_test_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> CoreResult<Json<TestDelivery>> {
    let id = require_id(&id)?;
    let delivered = state.dispatcher.notify_one(id).await?;
    Ok(Json(TestDelivery { delivered }))
}

async fn api_notify(
    State(state): State<AppState>,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> CoreResult<Json<DispatchReport>> {
    let req = body(payload)?;
    let message = Notification {
        title: req.title,
        body: req.body,
    };
    Ok(Json(state.dispatcher.notify_many(&req.ids, &message).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, bind: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    info!(addr = %bind, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_shared_events;
    use crate::test_support::{subscription_json, test_db, MemoryStore, RecordingTransport};
    use crate::timeseries::TimeSeriesReader;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
    }

    async fn fixture() -> Fixture {
        let db = test_db().await;
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let events = new_shared_events();
        let reader = TimeSeriesReader::new(store.clone(), Duration::from_secs(2));
        let state = AppState {
            engine: Engine::new(reader, db.clone(), "https://garden.example", events.clone()),
            dispatcher: Dispatcher::new(
                db.clone(),
                transport.clone(),
                Duration::from_secs(2),
                events.clone(),
            ),
            db,
            events,
        };
        Fixture {
            app: router(state),
            store,
            transport,
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn basil(threshold: Option<i64>, interval: i64) -> Value {
        json!({
            "name": "Basil",
            "interval": interval,
            "actuator_state": false,
            "threshold": threshold
        })
    }

    // -- devices -------------------------------------------------------------

    #[tokio::test]
    async fn put_device_creates_then_updates() {
        let f = fixture().await;

        let (status, body) =
            call(&f.app, "PUT", "/api/devices/potA", Some(basil(Some(30), 600))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["version"], 1);

        let (status, _) =
            call(&f.app, "PUT", "/api/devices/potA", Some(basil(Some(30), 300))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&f.app, "GET", "/api/devices/potA", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 2);
        assert_eq!(body["interval"], 300);
    }

    #[tokio::test]
    async fn put_device_validation() {
        let f = fixture().await;

        let (status, _) = call(&f.app, "PUT", "/api/devices/potA", Some(basil(None, 0))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            call(&f.app, "PUT", "/api/devices/potA", Some(basil(Some(150), 60))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            call(&f.app, "PUT", "/api/devices/potA", Some(json!({"name": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&f.app, "PUT", "/api/devices/%20", Some(basil(None, 60))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_device_is_404() {
        let f = fixture().await;
        let (status, body) = call(&f.app, "GET", "/api/devices/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));

        let (status, _) = call(
            &f.app,
            "PUT",
            "/api/devices/ghost/image",
            Some(json!({"reference": "a.jpg"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn image_reference_shows_up_in_nodes() {
        let f = fixture().await;
        f.store.push("potA", "moisture", json!(1000), OffsetDateTime::now_utc());
        call(&f.app, "PUT", "/api/devices/potA", Some(basil(Some(50), 600))).await;

        let (status, _) = call(
            &f.app,
            "PUT",
            "/api/devices/potA/image",
            Some(json!({"reference": "images/potA.jpg"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&f.app, "GET", "/api/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "potA");
        assert_eq!(body[0]["image_url"], "https://garden.example/images/potA.jpg");
        assert_eq!(body[0]["fields"]["moisture"], 100);
        assert_eq!(body[0]["show_warning"], false);
    }

    // -- telemetry -----------------------------------------------------------

    #[tokio::test]
    async fn measurements_for_silent_node_is_404() {
        let f = fixture().await;
        let (status, _) = call(&f.app, "GET", "/api/nodes/ghost/measurements", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn store_outage_is_502() {
        let f = fixture().await;
        f.store.fail_with("connection refused");
        let (status, _) = call(&f.app, "GET", "/api/nodes", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn history_has_three_series() {
        let f = fixture().await;
        f.store.push("potA", "moisture", json!(2250), OffsetDateTime::now_utc());
        let (status, body) = call(&f.app, "GET", "/api/nodes/potA/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["day"][0]["moisture"], 50);
        assert!(body["week"].is_array());
        assert!(body["month"].is_array());
    }

    #[tokio::test]
    async fn thresholds_endpoint() {
        let f = fixture().await;
        f.store.push("potA", "moisture", json!(2775), OffsetDateTime::now_utc());
        call(&f.app, "PUT", "/api/devices/potA", Some(basil(Some(20), 600))).await;

        let (status, body) = call(&f.app, "GET", "/api/nodes/potA/thresholds", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["thresholds_reached"], true);
        assert!(body["message"]["body"].as_str().unwrap().contains("Basil"));
    }

    // -- subscriptions -------------------------------------------------------

    #[tokio::test]
    async fn subscription_lifecycle() {
        let f = fixture().await;
        let blob: Value = serde_json::from_str(&subscription_json("https://push/1")).unwrap();

        let (status, _) = call(&f.app, "PUT", "/api/subscriptions/s1", Some(blob.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&f.app, "PUT", "/api/subscriptions/s1", Some(blob)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&f.app, "POST", "/api/subscriptions/s1/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], true);
        assert_eq!(f.transport.sent_to("https://push/1"), 1);

        let (status, _) = call(&f.app, "DELETE", "/api/subscriptions/s1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&f.app, "DELETE", "/api/subscriptions/s1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_object_subscription_is_400() {
        let f = fixture().await;
        let (status, _) = call(&f.app, "PUT", "/api/subscriptions/s1", Some(json!([1, 2]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn notify_endpoint_reports_and_throttles() {
        let f = fixture().await;
        let blob: Value = serde_json::from_str(&subscription_json("https://push/1")).unwrap();
        call(&f.app, "PUT", "/api/subscriptions/s1", Some(blob)).await;

        let msg = json!({"title": "Garden", "body": "Water the basil"});
        let (status, body) = call(&f.app, "POST", "/api/notify", Some(msg.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 1);

        let (_, body) = call(&f.app, "POST", "/api/notify", Some(msg)).await;
        assert_eq!(body["throttled"], 1);
        assert_eq!(f.transport.sent_to("https://push/1"), 1);
    }

    #[tokio::test]
    async fn status_reports_events() {
        let f = fixture().await;
        f.store.push("stray", "moisture", json!(2000), OffsetDateTime::now_utc());
        call(&f.app, "GET", "/api/nodes", None).await;

        let (status, body) = call(&f.app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["events"][0]["kind"], "inconsistency");
    }
}
