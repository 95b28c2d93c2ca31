use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    admin,
    chat::{ChatSession, ChatSynthesizer, SessionStore, CHAT_FALLBACK_REPLY},
    error::StoreError,
    imagery::{self, Fingerprint, ImageAsset, ImageGenerator, ImageSource},
    models::{
        ChangeScenarioRequest, ChatRequest, ChatResponse, ImageQuery, PagePath, PageRequest, Scenario, ScenarioForm,
        ScenarioSummary, SelectScenarioForm,
    },
    page::PageSynthesizer,
    scenario::{self, ScenarioStore},
};

#[derive(Clone)]
pub struct AppState {
    pub scenarios: Arc<ScenarioStore>,
    pub pages: Arc<PageSynthesizer>,
    pub images: Arc<ImageGenerator>,
    pub chat: Arc<ChatSynthesizer>,
    pub sessions: Arc<SessionStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home_page))
        .route("/admin", get(admin_page))
        .route("/admin/select", post(admin_select))
        .route("/admin/add", post(admin_add))
        .route("/admin/edit", post(admin_edit))
        .route("/_image/:scenario/:fingerprint", get(serve_image))
        .route("/_chat", post(chat_message))
        .route("/api/scenarios", get(list_scenarios).post(create_scenario))
        .route("/api/scenarios/current", get(current_scenario))
        .route("/api/scenarios/change", post(change_scenario))
        .route("/*path", get(browse))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

// --- browsing ---

pub async fn home_page(State(state): State<AppState>) -> Response {
    render_page(&state, PagePath::home()).await
}

pub async fn browse(Path(path): Path<String>, State(state): State<AppState>) -> Response {
    if imagery::has_image_extension(&path) {
        let scenario_id = state.scenarios.active_id();
        let description = imagery::description_from_filename(&path);
        tracing::info!("🖼️ Image path /{} resolved to '{}'", path, description);
        let asset = state.images.get_image(&scenario_id, &description).await;
        return image_response(asset);
    }
    render_page(&state, PagePath::parse(&path)).await
}

async fn render_page(state: &AppState, path: PagePath) -> Response {
    let request = PageRequest { path, scenario: state.scenarios.get_active() };
    let page = state.pages.synthesize(&request).await;
    if page.is_fallback() {
        tracing::warn!("Served fallback page for {}", page.path);
    }
    Html(page.html).into_response()
}

// --- images ---

pub async fn serve_image(
    Path((scenario_id, fingerprint)): Path<(String, String)>,
    Query(query): Query<ImageQuery>,
    State(state): State<AppState>,
) -> Response {
    if scenario::validate_id(&scenario_id).is_err() {
        return (StatusCode::BAD_REQUEST, "invalid scenario id").into_response();
    }
    if state.scenarios.get(&scenario_id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown scenario").into_response();
    }
    let Some(fingerprint) = Fingerprint::parse(&fingerprint) else {
        return (StatusCode::BAD_REQUEST, "invalid image fingerprint").into_response();
    };

    match query.description.filter(|d| !d.trim().is_empty()) {
        Some(description) => {
            if Fingerprint::compute(&scenario_id, &description) != fingerprint {
                tracing::warn!("Fingerprint {} does not match description '{}'", fingerprint, description);
                return (StatusCode::BAD_REQUEST, "fingerprint does not match description").into_response();
            }
            image_response(state.images.get_image(&scenario_id, &description).await)
        }
        None => match state.images.cached(&scenario_id, &fingerprint).await {
            Some(asset) => image_response(asset),
            None => image_response(ImageGenerator::placeholder(&scenario_id)),
        },
    }
}

fn image_response(asset: ImageAsset) -> Response {
    let cache_control = match asset.source {
        ImageSource::Placeholder => "no-store",
        ImageSource::Cache | ImageSource::Backend => "public, max-age=86400",
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, asset.format.content_type()), (header::CACHE_CONTROL, cache_control)],
        asset.bytes,
    )
        .into_response()
}

// --- admin UI ---

pub async fn admin_page(State(state): State<AppState>) -> Response {
    admin_html(&state, StatusCode::OK, None)
}

fn admin_html(state: &AppState, status: StatusCode, error: Option<&str>) -> Response {
    match admin::render(&state.scenarios.list(), &state.scenarios.active_id(), error) {
        Ok(page) => (status, Html(page)).into_response(),
        Err(e) => {
            tracing::error!("❌ Admin page failed to render: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "admin page unavailable").into_response()
        }
    }
}

/// Called after the active scenario changed, so earlier pages stop steering the prompts.
fn scenario_switched(state: &AppState) {
    state.pages.reset_history();
}

pub async fn admin_select(State(state): State<AppState>, Form(form): Form<SelectScenarioForm>) -> Response {
    match state.scenarios.set_active(form.scenario_id.trim()) {
        Ok(()) => {
            scenario_switched(&state);
            Redirect::to("/admin").into_response()
        }
        Err(e) => admin_error(&state, e),
    }
}

pub async fn admin_add(State(state): State<AppState>, Form(form): Form<ScenarioForm>) -> Response {
    let scenario = Scenario::new(form.id.trim(), form.short_description, form.full_description);
    let id = scenario.id.clone();
    let result = match state.scenarios.add(scenario).await {
        Ok(()) => state.scenarios.set_active(&id),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            scenario_switched(&state);
            Redirect::to("/admin").into_response()
        }
        Err(e) => admin_error(&state, e),
    }
}

pub async fn admin_edit(State(state): State<AppState>, Form(form): Form<ScenarioForm>) -> Response {
    let id = form.id.trim();
    match state.scenarios.edit(id, form.short_description, form.full_description).await {
        Ok(_) => {
            if state.scenarios.active_id() == id {
                scenario_switched(&state);
            }
            Redirect::to("/admin").into_response()
        }
        Err(e) => admin_error(&state, e),
    }
}

fn store_status(error: &StoreError) -> StatusCode {
    match error {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        StoreError::Io(_) | StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn admin_error(state: &AppState, error: StoreError) -> Response {
    let status = store_status(&error);
    tracing::warn!("⚠️ Admin action failed ({}): {}", status, error);
    admin_html(state, status, Some(&error.to_string()))
}

// --- JSON scenario API ---

fn summary(scenario: &Scenario, active_id: &str) -> ScenarioSummary {
    ScenarioSummary {
        name: scenario.id.clone(),
        description: scenario.short_description.clone(),
        active: scenario.id == active_id,
    }
}

pub async fn list_scenarios(State(state): State<AppState>) -> Json<Vec<ScenarioSummary>> {
    let active = state.scenarios.active_id();
    Json(state.scenarios.list().iter().map(|s| summary(s, &active)).collect())
}

pub async fn current_scenario(State(state): State<AppState>) -> Json<ScenarioSummary> {
    let active = state.scenarios.get_active();
    Json(summary(&active, &active.id))
}

pub async fn change_scenario(
    State(state): State<AppState>,
    Json(body): Json<ChangeScenarioRequest>,
) -> Response {
    match state.scenarios.set_active(body.name.trim()) {
        Ok(()) => {
            scenario_switched(&state);
            Json(json!({"success": true, "message": format!("Changed to scenario: {}", body.name)})).into_response()
        }
        Err(e) => api_error(e),
    }
}

pub async fn create_scenario(State(state): State<AppState>, Json(scenario): Json<Scenario>) -> Response {
    let active = state.scenarios.active_id();
    let created = summary(&scenario, &active);
    match state.scenarios.add(scenario).await {
        Ok(()) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => api_error(e),
    }
}

fn api_error(error: StoreError) -> Response {
    let status = store_status(&error);
    tracing::warn!("⚠️ Scenario API request failed ({}): {}", status, error);
    (status, Json(json!({"success": false, "error": error.to_string()}))).into_response()
}

// --- chat ---

pub async fn chat_message(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    if body.message.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "message must not be empty"}))).into_response();
    }
    let scenario = state.scenarios.get_active();

    // Work on a copy so the sessions lock is never held across the model call.
    let existing = body.session_id.and_then(|id| state.sessions.get(&id));
    let mut session = match existing {
        Some(session) if session.scenario_id == scenario.id => session,
        Some(mut stale) => {
            tracing::info!("🔀 Session {} restarted for scenario '{}'", stale.id, scenario.id);
            stale.restart(scenario.id.clone());
            stale
        }
        None => ChatSession::new(scenario.id.clone()),
    };
    let session_id = session.id;

    let (reply, degraded) = match state.chat.respond(&mut session, &scenario, &body.message).await {
        Ok(reply) => (reply, false),
        Err(_) => (CHAT_FALLBACK_REPLY.to_string(), true),
    };
    state.sessions.save(session);
    tracing::debug!("💬 {} chat sessions held", state.sessions.len());

    Json(ChatResponse { session_id, reply, degraded }).into_response()
}
