//! Admin HTTP surface.
//!
//! Consumed by ops tooling, not by the core: worker status and activity
//! counters, invariant probes, the orphan probe, order cancellation, and the
//! failure-injection toggles when the mock executor is active.

use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Json},
	routing::{get, post},
	Router,
};
use playflow_config::AdminConfig;
use playflow_core::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Starts the admin HTTP server.
pub async fn start_server(
	admin_config: AdminConfig,
	engine: Arc<Engine>,
) -> anyhow::Result<()> {
	let app = Router::new()
		.nest(
			"/admin",
			Router::new()
				.route("/worker", get(handle_worker_status))
				.route("/invariants", get(handle_validate_all))
				.route("/invariants/{order_id}", get(handle_validate_order))
				.route("/orphans", get(handle_orphans))
				.route("/anomalies", get(handle_anomalies))
				.route("/orders/{order_id}/cancel", post(handle_cancel_order))
				.route("/injection", get(handle_get_injection).post(handle_set_injection)),
		)
		.layer(TraceLayer::new_for_http())
		.with_state(engine);

	let bind_address = format!("{}:{}", admin_config.host, admin_config.port);
	let listener = TcpListener::bind(&bind_address).await?;
	tracing::info!("Admin server starting on {}", bind_address);
	axum::serve(listener, app).await?;
	Ok(())
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
	(
		StatusCode::INTERNAL_SERVER_ERROR,
		Json(json!({ "error": e.to_string() })),
	)
}

/// GET /admin/worker — worker id, start time, and activity counters.
async fn handle_worker_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
	Json(engine.worker().status())
}

/// GET /admin/invariants — full conservation-law scan.
async fn handle_validate_all(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
	match engine.validator().validate_all().await {
		Ok(report) => Json(report).into_response(),
		Err(e) => internal_error(e).into_response(),
	}
}

/// GET /admin/invariants/{order_id} — validate one order.
async fn handle_validate_order(
	Path(order_id): Path<Uuid>,
	State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
	match engine.validator().validate_order(order_id).await {
		Ok(report) => Json(report).into_response(),
		Err(e) => (
			StatusCode::NOT_FOUND,
			Json(json!({ "error": e.to_string() })),
		)
			.into_response(),
	}
}

/// GET /admin/orphans — count of EXECUTING tasks past the orphan threshold.
async fn handle_orphans(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
	match engine.orphan_count().await {
		Ok(count) => Json(json!({ "orphans": count })).into_response(),
		Err(e) => internal_error(e).into_response(),
	}
}

/// GET /admin/anomalies — open reconciliation anomalies.
async fn handle_anomalies(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
	match engine.store().open_anomalies().await {
		Ok(anomalies) => Json(anomalies).into_response(),
		Err(e) => internal_error(e).into_response(),
	}
}

/// POST /admin/orders/{order_id}/cancel — abandon open tasks and refund them.
async fn handle_cancel_order(
	Path(order_id): Path<Uuid>,
	State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
	match engine.cancel_order(order_id).await {
		Ok(order) => Json(order).into_response(),
		Err(e) => internal_error(e).into_response(),
	}
}

/// Body for POST /admin/injection; absent fields stay unchanged.
#[derive(Debug, Deserialize)]
struct InjectionUpdate {
	fail_percent: Option<u8>,
	simulate_timeout: Option<bool>,
	added_latency_ms: Option<u64>,
	paused: Option<bool>,
	ban_node: Option<Uuid>,
	unban_node: Option<Uuid>,
}

/// GET /admin/injection — current failure-injection settings.
async fn handle_get_injection(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
	let Some(handle) = engine.injection() else {
		return (
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({ "error": "failure injection requires the mock executor" })),
		)
			.into_response();
	};
	let settings = handle.snapshot();
	Json(json!({
		"fail_percent": settings.fail_percent,
		"simulate_timeout": settings.simulate_timeout,
		"added_latency_ms": settings.added_latency.as_millis() as u64,
		"paused": settings.paused,
		"banned_nodes": settings.banned_nodes,
	}))
	.into_response()
}

/// POST /admin/injection — dev/test failure-injection toggles.
async fn handle_set_injection(
	State(engine): State<Arc<Engine>>,
	Json(update): Json<InjectionUpdate>,
) -> impl IntoResponse {
	let Some(handle) = engine.injection() else {
		return (
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({ "error": "failure injection requires the mock executor" })),
		)
			.into_response();
	};

	handle.update(|settings| {
		if let Some(fail_percent) = update.fail_percent {
			settings.fail_percent = fail_percent.min(100);
		}
		if let Some(simulate_timeout) = update.simulate_timeout {
			settings.simulate_timeout = simulate_timeout;
		}
		if let Some(added_latency_ms) = update.added_latency_ms {
			settings.added_latency = Duration::from_millis(added_latency_ms);
		}
		if let Some(paused) = update.paused {
			settings.paused = paused;
		}
		if let Some(node) = update.ban_node {
			settings.banned_nodes.insert(node);
		}
		if let Some(node) = update.unban_node {
			settings.banned_nodes.remove(&node);
		}
	});
	StatusCode::NO_CONTENT.into_response()
}
