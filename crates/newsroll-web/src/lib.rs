//! JSON API over the refresh gate and the per-user library.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use newsroll_core::Article;
use newsroll_storage::DocumentStore;
use newsroll_sync::{library, LibraryError, RefreshGate, SearchCriterion, Services, SessionHandle};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "newsroll-web";

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<RefreshGate>,
    pub store: Arc<dyn DocumentStore>,
}

impl AppState {
    pub fn new(gate: Arc<RefreshGate>) -> Self {
        Self {
            store: Arc::clone(gate.store()),
            gate,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    criteria: Option<String>,
    #[serde(default)]
    q: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/bucket", get(bucket_handler))
        .route("/users/{user_id}/refresh", post(refresh_handler))
        .route("/users/{user_id}/feed", get(feed_handler))
        .route("/users/{user_id}/search", get(search_handler))
        .route(
            "/users/{user_id}/favorites",
            get(list_favorites_handler)
                .post(add_favorite_handler)
                .delete(clear_favorites_handler),
        )
        .route(
            "/users/{user_id}/favorites/{article_id}",
            delete(remove_favorite_handler),
        )
        .route("/users/{user_id}/reads", post(track_read_handler))
        .route("/users/{user_id}/metrics", get(metrics_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let services = Services::from_env()?;
    let port = services.config.web_port;
    let state = AppState::new(Arc::clone(&services.gate));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "newsroll api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn bucket_handler(State(state): State<Arc<AppState>>) -> Response {
    let fetch_key = state.gate.fetch_key(Utc::now());
    Json(json!({ "fetch_key": fetch_key })).into_response()
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    match state
        .gate
        .run_refresh_cycle(&user_id, Utc::now(), &SessionHandle::detached())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err),
    }
}

async fn feed_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    Query(query): Query<FeedQuery>,
) -> Response {
    let category = query.category.unwrap_or_else(|| "all".to_string());
    match library::feed_slides(state.store.as_ref(), &user_id, &category).await {
        Ok(slides) => Json(slides).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let criterion = match query.criteria.as_deref().unwrap_or("title").parse::<SearchCriterion>() {
        Ok(criterion) => criterion,
        Err(err) => return library_error(err),
    };
    match library::search(state.store.as_ref(), &user_id, criterion, &query.q).await {
        Ok(results) => Json(results).into_response(),
        Err(err) => library_error(err),
    }
}

async fn list_favorites_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    match library::list_favorites(state.store.as_ref(), &user_id).await {
        Ok(favorites) => Json(favorites).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn add_favorite_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    Json(article): Json<Article>,
) -> Response {
    match library::add_favorite(state.store.as_ref(), &user_id, article).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => library_error(err),
    }
}

async fn clear_favorites_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    match library::clear_favorites(state.store.as_ref(), &user_id).await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(err) => library_error(err),
    }
}

async fn remove_favorite_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((user_id, article_id)): AxumPath<(String, String)>,
) -> Response {
    match library::remove_favorite(state.store.as_ref(), &user_id, &article_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_body(StatusCode::NOT_FOUND, format!("{article_id} is not a favorite")),
        Err(err) => server_error(err.into()),
    }
}

async fn track_read_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    Json(article): Json<Article>,
) -> Response {
    match library::track_read(state.store.as_ref(), &user_id, &article, Utc::now()).await {
        Ok(recorded) => Json(json!({ "recorded": recorded })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    match library::category_metrics(state.store.as_ref(), &user_id).await {
        Ok(counts) => Json(counts).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn library_error(err: LibraryError) -> Response {
    let status = match err {
        LibraryError::AlreadyFavorite(_) => StatusCode::CONFLICT,
        LibraryError::NoFavorites => StatusCode::NOT_FOUND,
        LibraryError::EmptyQuery
        | LibraryError::QueryTooShort
        | LibraryError::InvalidDate(_)
        | LibraryError::UnknownCriterion(_) => StatusCode::BAD_REQUEST,
        LibraryError::Store(_) => return server_error(err.into()),
    };
    error_body(status, err.to_string())
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = ?err, "request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}
