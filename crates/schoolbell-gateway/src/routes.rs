//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Weekday;
use schoolbell_core::types::{Channel, hhmm};
use schoolbell_dispatch::{InstitutionSetting, NotifyStore, Preference, RunRequest};
use serde::Deserialize;

use super::server::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "schoolbell-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "gateway": {
            "host": state.gateway_config.host,
            "port": state.gateway_config.port,
        },
        "channels": state.evaluator.dispatcher().available_channels(),
    }))
}

/// Trigger a notification run. Realtime producers post the reference ids they
/// just created; the scheduler posts an empty body for the daily sweep.
pub async fn run_notifications(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        match serde_json::from_slice::<RunRequest>(&body) {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"ok": false, "error": format!("Invalid run request: {e}")})),
                );
            }
        }
    };
    match state.evaluator.run(request).await {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(json) => (StatusCode::OK, Json(json)),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false, "error": e.to_string()})),
            ),
        },
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"ok": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// Recent run summaries, newest first.
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match state.db.recent_runs(limit) {
        Ok(runs) => Json(serde_json::json!({"ok": true, "runs": runs})),
        Err(e) => Json(serde_json::json!({"ok": false, "error": e.to_string()})),
    }
}

/// The category catalog with its defaults.
pub async fn list_categories(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let categories: Vec<_> = state.evaluator.catalog().iter().collect();
    Json(serde_json::json!({
        "categories": categories,
        "available_channels": state.evaluator.dispatcher().available_channels(),
    }))
}

/// Effective setting for (institution, category), plus the saved override row.
pub async fn get_setting(
    State(state): State<Arc<AppState>>,
    Path((institution_id, category_id)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let saved = match state.db.institution_setting(&institution_id, &category_id) {
        Ok(saved) => saved,
        Err(e) => return Json(serde_json::json!({"ok": false, "error": e.to_string()})),
    };
    let effective = match state.evaluator.settings().resolve(&institution_id, &category_id) {
        Ok(s) => s,
        Err(e) => return Json(serde_json::json!({"ok": false, "error": e.to_string()})),
    };
    Json(serde_json::json!({
        "ok": true,
        "setting": effective,
        "saved": saved,
    }))
}

/// Body of a settings update. Omitted fields fall back to the category default.
#[derive(Debug, Default, Deserialize)]
pub struct SettingUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    /// `HH:MM`
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde(default)]
    pub schedule_days: Option<Vec<Weekday>>,
    #[serde(default)]
    pub template: Option<String>,
}

/// Replace the override row for (institution, category).
pub async fn update_setting(
    State(state): State<Arc<AppState>>,
    Path((institution_id, category_id)): Path<(String, String)>,
    Json(body): Json<SettingUpdate>,
) -> Json<serde_json::Value> {
    if !state.evaluator.catalog().contains(&category_id) {
        return Json(serde_json::json!({
            "ok": false,
            "error": format!("Unknown notification category: {category_id}"),
        }));
    }
    let schedule_time = match body.schedule_time.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => match hhmm::parse(s) {
            Ok(t) => Some(t),
            Err(_) => {
                return Json(serde_json::json!({
                    "ok": false,
                    "error": format!("schedule_time must be HH:MM, got '{s}'"),
                }));
            }
        },
        None => None,
    };

    let setting = InstitutionSetting {
        institution_id: institution_id.clone(),
        category_id: category_id.clone(),
        enabled: body.enabled,
        channels: body.channels,
        schedule_time,
        schedule_days: body.schedule_days,
        template: body.template,
    };
    if let Err(e) = state.db.upsert_setting(&setting) {
        return Json(serde_json::json!({"ok": false, "error": e.to_string()}));
    }
    tracing::info!("Settings for {institution_id}/{category_id} updated");

    match state.evaluator.settings().resolve(&institution_id, &category_id) {
        Ok(effective) => Json(serde_json::json!({"ok": true, "setting": effective})),
        Err(e) => Json(serde_json::json!({"ok": false, "error": e.to_string()})),
    }
}

/// Record a guardian's opt-in/out for one channel at one institution.
pub async fn update_preference(
    State(state): State<Arc<AppState>>,
    Json(preference): Json<Preference>,
) -> Json<serde_json::Value> {
    if preference.recipient_id.trim().is_empty() || preference.institution_id.trim().is_empty() {
        return Json(serde_json::json!({"ok": false, "error": "recipient_id and institution_id are required"}));
    }
    match state.db.set_preference(&preference) {
        Ok(()) => Json(serde_json::json!({"ok": true})),
        Err(e) => Json(serde_json::json!({"ok": false, "error": e.to_string()})),
    }
}
